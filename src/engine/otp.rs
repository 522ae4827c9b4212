use std::sync::Arc;

use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::{EngineSettings, bounded};
use crate::error::EngineError;
use crate::models::otp::DeliveryOtp;
use crate::observability::metrics::Metrics;
use crate::store::{FulfillmentStore, OtpError};

pub const OTP_DIGITS: usize = 6;

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..OTP_DIGITS)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Issues and checks delivery codes. At most one `issue` per out-for-delivery transition.
pub struct OtpService {
    store: Arc<dyn FulfillmentStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    metrics: Metrics,
}

impl OtpService {
    pub fn new(
        store: Arc<dyn FulfillmentStore>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            metrics,
        }
    }

    pub async fn issue(
        &self,
        order_id: Uuid,
        agent_id: Uuid,
        customer_phone: &str,
    ) -> Result<DeliveryOtp, EngineError> {
        let issued_at = self.clock.now();
        let otp = DeliveryOtp {
            order_id,
            code: generate_code(),
            agent_id,
            customer_phone: customer_phone.to_string(),
            issued_at,
            expires_at: issued_at + self.settings.otp_ttl,
            used: false,
        };

        bounded(self.settings.store_timeout, self.store.insert_otp(otp.clone())).await?;
        info!(order_id = %order_id, agent_id = %agent_id, "delivery code issued");
        Ok(otp)
    }

    pub async fn validate(&self, order_id: Uuid, code: &str) -> Result<DeliveryOtp, EngineError> {
        let now = self.clock.now();
        let outcome = bounded(
            self.settings.store_timeout,
            self.store.consume_otp(order_id, code.trim(), now),
        )
        .await?;

        self.observe(order_id, outcome.as_ref().map(|_| ()));
        outcome.map_err(EngineError::InvalidOtp)
    }

    /// Counts a validation outcome, including codes consumed inside a delivery batch.
    pub(crate) fn observe(&self, order_id: Uuid, outcome: Result<(), &OtpError>) {
        let label = match outcome {
            Ok(()) => "valid",
            Err(OtpError::Missing) => "missing",
            Err(OtpError::NotFound) => "not_found",
            Err(OtpError::Expired) => "expired",
            Err(OtpError::Mismatch) => "mismatch",
        };
        self.metrics
            .otp_validations_total
            .with_label_values(&[label])
            .inc();

        if let Err(err) = outcome {
            warn!(order_id = %order_id, error = %err, "delivery code rejected");
        }
    }
}
