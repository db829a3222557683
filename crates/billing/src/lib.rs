// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries formatted context strings
#![allow(clippy::too_many_arguments)] // Webhook handlers pass event, context and routing ids
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Creditline Billing Module
//!
//! Credit ledger with Stripe subscription reconciliation.
//!
//! ## Features
//!
//! - **Buckets**: free, subscription and one-time credit pools, each with its
//!   own limit and expiry
//! - **Debits**: all-or-nothing, drawn in a fixed spend order
//! - **Webhooks**: verified Stripe events applied at most once
//! - **Subscription lifecycle**: active, past due, canceled and derived expiry
//! - **Invariants**: runnable consistency checks over the ledger
//!
//! Persistence sits behind [`LedgerStore`], with a Postgres implementation
//! for production and an in-memory one for tests and simulations.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;
pub mod subscription;
pub mod summary;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::StripeClient;

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::{BillingConfig, PriceKind, PricePlan};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, ParsedEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{
    BucketDraw, CreditGrant, CreditMode, CreditRequest, DebitReceipt, EffectiveBalance,
    LedgerEngine, Mutation,
};

// Models
pub use models::{
    Balance, Bucket, BucketKind, CreditTransaction, ProcessedWebhookEvent, Subscription,
    SubscriptionStatus, UserId,
};

// Stores
pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use store::LedgerStore;

// Summary
pub use summary::{BucketSummary, CreditSummary, SubscriptionSummary};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome, WebhookReplayResult};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub ledger: Arc<LedgerEngine>,
    pub webhooks: Arc<WebhookHandler>,
    pub invariants: Arc<InvariantChecker>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Ok(Self::new(
            config,
            Arc::new(PgLedgerStore::new(pool)),
            Arc::new(SystemClock),
        ))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: BillingConfig, store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        let stripe = StripeClient::from_config(&config);
        if stripe.is_none() {
            tracing::warn!("STRIPE_SECRET_KEY not set - webhook replay is disabled");
        }

        let ledger = Arc::new(LedgerEngine::new(
            store.clone(),
            Arc::new(config),
            clock.clone(),
        ));

        Self {
            webhooks: Arc::new(WebhookHandler::new(ledger.clone(), stripe)),
            invariants: Arc::new(InvariantChecker::new(store, clock)),
            ledger,
        }
    }

    /// Service over a fresh in-memory store
    pub fn in_memory(config: BillingConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config, Arc::new(MemoryLedgerStore::new()), clock)
    }
}
