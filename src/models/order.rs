use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,
    Processing,
    Printed,
    Shipped,
    OutForDelivery,
    NotDelivered,
    Delivered,
    Cancelled,
    Returned,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    SelfFleet,
    Courier,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Upi,
    Wallet,
    CashOnDelivery,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    RefundPending,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub method: PaymentMethod,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrintItem {
    pub name: String,
    pub pages: u32,
    #[serde(default)]
    pub color: bool,
    #[serde(default)]
    pub binding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub channel: DeliveryChannel,
    pub agent_id: Option<Uuid>,
    pub provider_shipment_ref: Option<String>,
    pub tracking_url: Option<String>,
    pub provider_error: Option<String>,
    /// Self-fleet order waiting for a free agent; the top-level status is unchanged.
    pub pending_agent: bool,
    pub reassigned: bool,
    pub reassign_reason: Option<String>,
}

impl Delivery {
    pub fn new(channel: DeliveryChannel) -> Self {
        Self {
            channel,
            agent_id: None,
            provider_shipment_ref: None,
            tracking_url: None,
            provider_error: None,
            pending_agent: false,
            reassigned: false,
            reassign_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DeliveryProof {
    #[serde(default)]
    pub otp: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Admin,
    Agent,
    Customer,
    Courier,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineAction {
    StatusChanged { from: OrderStatus, to: OrderStatus },
    AgentAssigned { agent_id: Uuid },
    AgentReleased { agent_id: Uuid },
    AgentReassigned { from: Option<Uuid>, to: Uuid },
    AwaitingAgent,
    ShipmentCreated { shipment_ref: String },
    CourierFallback { error: String },
    RefundScheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub action: TimelineAction,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub version: u64,
    pub status: OrderStatus,
    pub customer_id: String,
    pub customer_phone: String,
    pub delivery_address: String,
    pub items: Vec<PrintItem>,
    pub delivery: Delivery,
    pub payment: Payment,
    pub assigned_agent_id: Option<Uuid>,
    pub urgent: bool,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub proof: Option<DeliveryProof>,
    pub return_reason: Option<String>,
    pub cancel_reason: Option<String>,
    pub timeline: Vec<TimelineEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn record(
        &mut self,
        at: DateTime<Utc>,
        actor: Actor,
        action: TimelineAction,
        note: Option<String>,
    ) -> u32 {
        let seq = self.timeline.last().map_or(1, |entry| entry.seq + 1);
        self.timeline.push(TimelineEntry {
            seq,
            timestamp: at,
            actor,
            action,
            note,
        });
        seq
    }

    pub fn is_self_fleet(&self) -> bool {
        self.delivery.channel == DeliveryChannel::SelfFleet
    }

    /// Binds an agent to this order. The caller must write the agent side in the same batch.
    pub fn bind_agent(&mut self, agent_id: Uuid) {
        self.assigned_agent_id = Some(agent_id);
        self.delivery.agent_id = Some(agent_id);
        self.delivery.pending_agent = false;
    }
}
