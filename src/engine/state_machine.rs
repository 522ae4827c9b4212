use crate::error::EngineError;
use crate::models::order::{DeliveryChannel, OrderStatus};

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Returned
        )
    }

    /// Legal edges of the fulfillment graph. Self-loops are never legal.
    pub fn can_transition_to(self, target: OrderStatus) -> bool {
        use OrderStatus::*;

        if self.is_terminal() || self == target {
            return false;
        }

        match target {
            Cancelled | Returned => true,
            Processing => self == Pending,
            Printed => self == Processing,
            Shipped => self == Printed,
            OutForDelivery => matches!(self, Printed | Shipped | NotDelivered),
            NotDelivered => self == OutForDelivery,
            Delivered => matches!(self, Shipped | OutForDelivery),
            Pending => false,
        }
    }

    pub fn ensure_transition(self, target: OrderStatus) -> Result<(), EngineError> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: self,
                to: target,
            })
        }
    }

    /// Graph edges narrowed by channel: a failed attempt only exists for the own fleet.
    pub fn can_transition_on(self, target: OrderStatus, channel: DeliveryChannel) -> bool {
        if target == OrderStatus::NotDelivered && channel != DeliveryChannel::SelfFleet {
            return false;
        }
        self.can_transition_to(target)
    }

    pub fn ensure_transition_on(
        self,
        target: OrderStatus,
        channel: DeliveryChannel,
    ) -> Result<(), EngineError> {
        if self.can_transition_on(target, channel) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: self,
                to: target,
            })
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Printed => "printed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::NotDelivered => "not_delivered",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Returned => "returned",
        }
    }
}
