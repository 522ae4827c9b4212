pub mod directory;
pub mod estimate;
pub mod lifecycle;
pub mod otp;
pub mod scheduler;
pub mod side_effects;
pub mod state_machine;
pub mod sweep;

use std::future::Future;
use std::time::Duration;

use crate::error::EngineError;
use crate::store::StoreError;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sweep_batch_size: usize,
    pub sweep_min_age: chrono::Duration,
    pub otp_ttl: chrono::Duration,
    pub assign_max_attempts: u32,
    pub store_timeout: Duration,
    pub courier_timeout: Duration,
    pub notify_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_batch_size: 10,
            sweep_min_age: chrono::Duration::minutes(10),
            otp_ttl: chrono::Duration::minutes(30),
            assign_max_attempts: 5,
            store_timeout: Duration::from_secs(2),
            courier_timeout: Duration::from_secs(5),
            notify_timeout: Duration::from_secs(3),
        }
    }
}

/// Runs a store call under the configured deadline.
pub(crate) async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(EngineError::from),
        Err(_) => Err(EngineError::Timeout("store call")),
    }
}

pub(crate) fn is_conflict(err: &EngineError) -> bool {
    matches!(err, EngineError::Store(StoreError::Conflict(_)))
}
