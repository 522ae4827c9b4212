use std::sync::Arc;

use tokio::sync::broadcast;

use crate::engine::EngineSettings;
use crate::engine::lifecycle::{EngineDeps, OrderEngine};
use crate::models::event::FulfillmentEvent;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub engine: Arc<OrderEngine>,
    pub events_tx: broadcast::Sender<FulfillmentEvent>,
    pub metrics: Metrics,
    pub webhook_token: Option<String>,
}

impl AppState {
    pub fn new(
        deps: EngineDeps,
        settings: EngineSettings,
        event_buffer_size: usize,
        webhook_token: Option<String>,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size);
        let metrics = Metrics::new();
        let engine = OrderEngine::new(deps, settings, metrics.clone(), events_tx.clone());

        Self {
            engine: Arc::new(engine),
            events_tx,
            metrics,
            webhook_token,
        }
    }
}
