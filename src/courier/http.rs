use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::courier::{CourierProvider, ProviderError, Shipment, ShipmentRequest};

#[derive(Debug, Clone)]
pub struct HttpCourierProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CreateShipmentResponse {
    shipment_ref: String,
    tracking_url: String,
}

impl HttpCourierProvider {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::Request(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl CourierProvider for HttpCourierProvider {
    async fn create_shipment(&self, request: &ShipmentRequest) -> Result<Shipment, ProviderError> {
        let url = format!("{}/shipments", self.base_url);
        debug!(order_id = %request.order_id, url = %url, "creating courier shipment");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Request(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(order_id = %request.order_id, status = %status, "courier rejected shipment");
            return Err(ProviderError::Rejected(format!("{status}: {body}")));
        }

        let created: CreateShipmentResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Request(format!("invalid courier response: {err}")))?;

        Ok(Shipment {
            shipment_ref: created.shipment_ref,
            tracking_url: created.tracking_url,
        })
    }
}
