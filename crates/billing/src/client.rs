//! Stripe API client
//!
//! Only used to fetch events for admin replay; live processing works from the
//! signed webhook payload alone.

use serde_json::Value;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
}

impl StripeClient {
    pub fn new(secret_key: &str) -> Self {
        let inner = stripe::Client::new(secret_key).with_app_info(
            "creditline".to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );
        Self { inner }
    }

    /// Client from config, if a secret key is set
    pub fn from_config(config: &BillingConfig) -> Option<Self> {
        config
            .stripe_secret_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(Self::new)
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    /// Fetch an event by id and return it in webhook JSON form
    pub async fn retrieve_event_json(&self, event_id: &str) -> BillingResult<Value> {
        let id = event_id
            .parse::<stripe::EventId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid event ID: {}", e)))?;

        let event = stripe::Event::retrieve(&self.inner, &id, &[])
            .await
            .map_err(|e| {
                BillingError::StripeApi(format!("Failed to fetch event from Stripe: {}", e))
            })?;

        serde_json::to_value(&event)
            .map_err(|e| BillingError::Internal(format!("Failed to encode Stripe event: {}", e)))
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient").finish_non_exhaustive()
    }
}
