use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLocation {
    pub lat: f64,
    pub lng: f64,
    pub last_updated: DateTime<Utc>,
}

/// Whether the agent may work at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Active,
    Suspended,
    Deleted,
}

/// Whether the agent is free right now.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Performance {
    pub orders_assigned: u64,
    pub deliveries_completed: u64,
    pub average_rating: f64,
    pub total_earnings: f64,
}

impl Performance {
    /// Counts a completed delivery and folds `rating` into the running average.
    pub fn record_delivery(&mut self, rating: Option<f64>) {
        self.deliveries_completed = self.deliveries_completed.saturating_add(1);

        if let Some(rating) = rating {
            let n = self.deliveries_completed as f64;
            self.average_rating = ((self.average_rating * (n - 1.0)) + rating) / n;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub version: u64,
    pub name: String,
    pub phone: String,
    pub account_status: AccountStatus,
    pub availability: Availability,
    pub current_order_id: Option<Uuid>,
    pub performance: Performance,
    pub location: Option<AgentLocation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_eligible(&self) -> bool {
        self.account_status == AccountStatus::Active
            && self.availability == Availability::Available
    }

    /// Marks the agent busy with `order_id`. Keeps `availability` and `current_order_id` in step.
    pub fn occupy(&mut self, order_id: Uuid) {
        self.availability = Availability::Busy;
        self.current_order_id = Some(order_id);
        self.performance.orders_assigned = self.performance.orders_assigned.saturating_add(1);
    }

    pub fn release(&mut self) {
        self.availability = Availability::Available;
        self.current_order_id = None;
    }

    pub fn is_released(&self) -> bool {
        self.availability == Availability::Available && self.current_order_id.is_none()
    }
}
