use crate::models::order::PrintItem;

const BASE_MINUTES: u32 = 30;
const MINUTES_PER_PAGE: u32 = 2;
const COLOR_MINUTES: u32 = 15;
const BINDING_MINUTES: u32 = 10;

/// Production time estimate in minutes, derived purely from order content.
pub fn estimate_minutes(items: &[PrintItem]) -> u32 {
    let pages: u32 = items.iter().map(|item| item.pages).sum();

    let mut minutes = BASE_MINUTES.saturating_add(pages.saturating_mul(MINUTES_PER_PAGE));
    if items.iter().any(|item| item.color) {
        minutes = minutes.saturating_add(COLOR_MINUTES);
    }
    if items.iter().any(|item| item.binding) {
        minutes = minutes.saturating_add(BINDING_MINUTES);
    }
    minutes
}

#[cfg(test)]
mod tests {
    use super::estimate_minutes;
    use crate::models::order::PrintItem;

    fn item(pages: u32, color: bool, binding: bool) -> PrintItem {
        PrintItem {
            name: "doc.pdf".to_string(),
            pages,
            color,
            binding,
        }
    }

    #[test]
    fn two_ten_page_items_one_color() {
        let items = [item(10, true, false), item(10, false, false)];
        assert_eq!(estimate_minutes(&items), 85);
    }

    #[test]
    fn binding_and_color_are_counted_once() {
        let items = [item(1, true, true), item(1, true, true)];
        assert_eq!(estimate_minutes(&items), 30 + 4 + 15 + 10);
    }

    #[test]
    fn empty_order_gets_base_time() {
        assert_eq!(estimate_minutes(&[]), 30);
    }
}
