//! Billing configuration
//!
//! Built once at process start and handed to the ledger and webhook handler.
//! Nothing in this crate reads the environment after construction.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Whether a price grants recurring or one-time credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    Subscription,
    OneTime,
}

/// A Stripe price and the number of credits it grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePlan {
    pub price_id: String,
    pub name: String,
    pub credits: i64,
    pub kind: PriceKind,
}

impl PricePlan {
    /// Parse one `price_id:name:credits:kind` catalog entry
    pub fn parse(entry: &str) -> BillingResult<Self> {
        let parts: Vec<&str> = entry.trim().split(':').collect();
        if parts.len() != 4 {
            return Err(BillingError::Config(format!(
                "price entry '{}' must be price_id:name:credits:kind",
                entry
            )));
        }

        let credits: i64 = parts[2].parse().map_err(|_| {
            BillingError::Config(format!("invalid credit count in price entry '{}'", entry))
        })?;
        if credits <= 0 {
            return Err(BillingError::Config(format!(
                "price entry '{}' must grant a positive number of credits",
                entry
            )));
        }

        let kind = match parts[3] {
            "subscription" => PriceKind::Subscription,
            "one_time" => PriceKind::OneTime,
            other => {
                return Err(BillingError::Config(format!(
                    "unknown price kind '{}' (expected subscription or one_time)",
                    other
                )))
            }
        };

        Ok(Self {
            price_id: parts[0].to_string(),
            name: parts[1].to_string(),
            credits,
            kind,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Stripe API key, only needed for replaying events from Stripe
    pub stripe_secret_key: Option<String>,
    pub webhook_secret: String,
    /// Maximum age of a signed webhook timestamp
    pub signature_tolerance_secs: i64,
    /// Credits granted to the free bucket at signup and on each refresh
    pub free_allotment: i64,
    pub free_period_days: i64,
    pub one_time_validity_days: i64,
    /// Used when a checkout event carries no billing period
    pub default_period_days: i64,
    pub max_conflict_retries: usize,
    pub webhook_retention_days: i64,
    pub prices: Vec<PricePlan>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            stripe_secret_key: None,
            webhook_secret: String::new(),
            signature_tolerance_secs: 300,
            free_allotment: 10,
            free_period_days: 30,
            one_time_validity_days: 365,
            default_period_days: 30,
            max_conflict_retries: 5,
            webhook_retention_days: 30,
            prices: Vec::new(),
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let prices = match std::env::var("CREDIT_PRICES") {
            Ok(raw) => raw
                .split(',')
                .filter(|entry| !entry.trim().is_empty())
                .map(PricePlan::parse)
                .collect::<BillingResult<Vec<_>>>()?,
            Err(_) => {
                tracing::warn!("CREDIT_PRICES not set - no price will grant credits");
                Vec::new()
            }
        };

        let defaults = Self::default();
        Ok(Self {
            stripe_secret_key: std::env::var("STRIPE_SECRET_KEY").ok(),
            webhook_secret,
            signature_tolerance_secs: env_or("WEBHOOK_TOLERANCE_SECS", defaults.signature_tolerance_secs)?,
            free_allotment: env_or("FREE_CREDITS", defaults.free_allotment)?,
            free_period_days: env_or("FREE_PERIOD_DAYS", defaults.free_period_days)?,
            one_time_validity_days: env_or("ONE_TIME_VALIDITY_DAYS", defaults.one_time_validity_days)?,
            default_period_days: env_or("DEFAULT_PERIOD_DAYS", defaults.default_period_days)?,
            max_conflict_retries: env_or("LEDGER_MAX_RETRIES", defaults.max_conflict_retries)?,
            webhook_retention_days: env_or("WEBHOOK_RETENTION_DAYS", defaults.webhook_retention_days)?,
            prices,
        })
    }

    pub fn price(&self, price_id: &str) -> Option<&PricePlan> {
        self.prices.iter().find(|p| p.price_id == price_id)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_price_entry() {
        let plan = PricePlan::parse("price_pro:Pro:100:subscription").unwrap();
        assert_eq!(plan.price_id, "price_pro");
        assert_eq!(plan.name, "Pro");
        assert_eq!(plan.credits, 100);
        assert_eq!(plan.kind, PriceKind::Subscription);

        let pack = PricePlan::parse(" price_pack:Pack:50:one_time ").unwrap();
        assert_eq!(pack.kind, PriceKind::OneTime);
    }

    #[test]
    fn test_parse_price_entry_rejects_bad_input() {
        assert!(PricePlan::parse("price_pro:Pro:100").is_err());
        assert!(PricePlan::parse("price_pro:Pro:lots:subscription").is_err());
        assert!(PricePlan::parse("price_pro:Pro:0:subscription").is_err());
        assert!(PricePlan::parse("price_pro:Pro:10:lifetime").is_err());
    }

    #[test]
    fn test_price_lookup() {
        let config = BillingConfig {
            prices: vec![PricePlan::parse("price_pro:Pro:100:subscription").unwrap()],
            ..BillingConfig::default()
        };
        assert_eq!(config.price("price_pro").map(|p| p.credits), Some(100));
        assert!(config.price("price_missing").is_none());
    }
}
