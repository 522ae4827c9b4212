use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::models::event::FulfillmentEvent;
use crate::notify::{Notification, Notifier, RefundGateway};
use crate::observability::metrics::Metrics;

const DEDUPE_CAPACITY: usize = 50_000;

/// Fire-and-forget dispatch of everything that happens after a commit.
///
/// Each dispatch carries a key derived from the order and the timeline entry that
/// caused it, so replaying the same transition never sends twice.
pub struct SideEffects {
    notifier: Arc<dyn Notifier>,
    refunds: Arc<dyn RefundGateway>,
    events_tx: broadcast::Sender<FulfillmentEvent>,
    metrics: Metrics,
    timeout: Duration,
    dispatched: DashSet<String>,
}

impl SideEffects {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        refunds: Arc<dyn RefundGateway>,
        events_tx: broadcast::Sender<FulfillmentEvent>,
        metrics: Metrics,
        timeout: Duration,
    ) -> Self {
        Self {
            notifier,
            refunds,
            events_tx,
            metrics,
            timeout,
            dispatched: DashSet::new(),
        }
    }

    pub fn dispatch_key(order_id: Uuid, seq: u32, audience: &str) -> String {
        format!("{order_id}:{seq}:{audience}")
    }

    fn first_dispatch(&self, key: &str) -> bool {
        if self.dispatched.len() >= DEDUPE_CAPACITY {
            self.dispatched.clear();
        }
        self.dispatched.insert(key.to_string())
    }

    pub fn notify(&self, key: String, notification: Notification) {
        if !self.first_dispatch(&key) {
            debug!(key = %key, "notification already dispatched");
            return;
        }

        let notifier = self.notifier.clone();
        let metrics = self.metrics.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let recipient = notification.recipient.clone();
            let outcome = match tokio::time::timeout(timeout, notifier.send(notification)).await {
                Ok(Ok(())) => "sent",
                Ok(Err(err)) => {
                    warn!(recipient = %recipient, error = %err, "notification failed");
                    "failed"
                }
                Err(_) => {
                    warn!(recipient = %recipient, "notification timed out");
                    "timeout"
                }
            };
            metrics
                .notifications_total
                .with_label_values(&[outcome])
                .inc();
        });
    }

    pub fn schedule_refund(&self, key: String, order_id: Uuid, customer_id: String) {
        if !self.first_dispatch(&key) {
            return;
        }

        let refunds = self.refunds.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, refunds.schedule_refund(order_id, &customer_id))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(order_id = %order_id, error = %err, "refund scheduling failed"),
                Err(_) => error!(order_id = %order_id, "refund scheduling timed out"),
            }
        });
    }

    pub fn publish(&self, event: FulfillmentEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}
