pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::order::{Order, OrderStatus};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("courier provider not configured")]
    NotConfigured,

    #[error("courier request failed: {0}")]
    Request(String),

    #[error("courier rejected shipment: {0}")]
    Rejected(String),

    #[error("courier call timed out")]
    Timeout,
}

/// What the courier gets to see of an order.
#[derive(Debug, Clone, Serialize)]
pub struct ShipmentRequest {
    pub order_id: Uuid,
    pub customer_phone: String,
    pub delivery_address: String,
    pub item_count: usize,
    pub urgent: bool,
}

impl From<&Order> for ShipmentRequest {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            customer_phone: order.customer_phone.clone(),
            delivery_address: order.delivery_address.clone(),
            item_count: order.items.len(),
            urgent: order.urgent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    pub shipment_ref: String,
    pub tracking_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderStatusWebhook {
    pub shipment_ref: String,
    pub provider_status: String,
    #[serde(default)]
    pub tracking_code: Option<String>,
}

#[async_trait]
pub trait CourierProvider: Send + Sync {
    async fn create_shipment(&self, request: &ShipmentRequest) -> Result<Shipment, ProviderError>;
}

/// Stand-in used when no courier is configured: every courier order falls back to the fleet.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredCourier;

#[async_trait]
impl CourierProvider for UnconfiguredCourier {
    async fn create_shipment(&self, _request: &ShipmentRequest) -> Result<Shipment, ProviderError> {
        Err(ProviderError::NotConfigured)
    }
}

pub fn map_provider_status(provider_status: &str) -> Option<OrderStatus> {
    match provider_status.trim().to_ascii_lowercase().as_str() {
        "in_transit" => Some(OrderStatus::Shipped),
        "out_for_delivery" => Some(OrderStatus::OutForDelivery),
        "delivered" => Some(OrderStatus::Delivered),
        "returned" => Some(OrderStatus::Returned),
        "cancelled" => Some(OrderStatus::Cancelled),
        _ => None,
    }
}
