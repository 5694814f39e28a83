//! Outbound webhook delivery.
//!
//! A single worker consumes the global event stream and POSTs every
//! envelope to each configured URL. Delivery is best-effort: failures are
//! retried with exponential backoff and then logged, never propagated back
//! to the bus.

use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::WebhookConfig;
use crate::error::DeliveryError;
use crate::store::EventEnvelope;

/// Delivers broker events to configured webhook endpoints.
pub struct WebhookDispatcher {
    client: Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    /// Create a dispatcher for the given configuration.
    pub fn new(config: WebhookConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(DeliveryError::Http)?;

        Ok(Self { client, config })
    }

    /// Subscribe to the bus and run deliveries on a dedicated task.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut subscription = bus.subscribe();
        info!(urls = self.config.urls.len(), "Webhook delivery started");

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                for url in &self.config.urls {
                    if let Err(e) = self.deliver(url, &event).await {
                        warn!(
                            url = %url,
                            sequence = event.sequence,
                            error = %e,
                            "Webhook delivery failed"
                        );
                    }
                }
            }
            info!("Webhook delivery stopped");
        })
    }

    /// POST one envelope to one URL, retrying with exponential backoff.
    async fn deliver(&self, url: &str, event: &EventEnvelope) -> Result<(), DeliveryError> {
        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                debug!(
                    url = %url,
                    sequence = event.sequence,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying webhook delivery"
                );
                tokio::time::sleep(delay).await;
            }

            match self.attempt(url, event).await {
                Ok(()) => {
                    debug!(url = %url, sequence = event.sequence, "Webhook delivered");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        Err(last_error.unwrap_or(DeliveryError::Status { status: 0 }))
    }

    async fn attempt(&self, url: &str, event: &EventEnvelope) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(DeliveryError::Http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}
