use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentEventKind {
    StatusChanged,
    AgentAssigned,
    AgentReassigned,
    AwaitingAgent,
    CourierFallback,
    ShipmentCreated,
}

/// Broadcast to websocket subscribers after every committed change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentEvent {
    pub order_id: Uuid,
    pub kind: FulfillmentEventKind,
    pub status: OrderStatus,
    pub agent_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}
