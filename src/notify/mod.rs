use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel failed: {0}")]
    Channel(String),

    #[error("refund request failed: {0}")]
    Refund(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub recipient: String,
    pub title: String,
    pub body: String,
    pub data: Value,
}

/// Push/SMS/WhatsApp delivery. Best effort: the engine never waits on the outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Refund side of the payment gateway.
#[async_trait]
pub trait RefundGateway: Send + Sync {
    async fn schedule_refund(&self, order_id: Uuid, customer_id: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            recipient = %notification.recipient,
            title = %notification.title,
            "notification sent"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogRefundGateway;

#[async_trait]
impl RefundGateway for LogRefundGateway {
    async fn schedule_refund(&self, order_id: Uuid, customer_id: &str) -> Result<(), NotifyError> {
        info!(order_id = %order_id, customer_id = %customer_id, "refund scheduled");
        Ok(())
    }
}
