//! Ledger persistence seam
//!
//! The engine never writes a row directly. It loads an [`AccountSnapshot`],
//! plans the new state in memory and hands a [`LedgerCommit`] to the store,
//! which applies it as a single atomic unit or not at all.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::{
    Balance, CreditTransaction, NewTransaction, ProcessedWebhookEvent, Subscription, UserId,
};

/// Current persisted state for one user
#[derive(Debug, Clone, Default)]
pub struct AccountSnapshot {
    pub balance: Option<Balance>,
    pub subscription: Option<Subscription>,
}

impl AccountSnapshot {
    /// Version the next commit must match (0 when no balance row exists)
    pub fn version(&self) -> i64 {
        self.balance.as_ref().map(|b| b.version).unwrap_or(0)
    }
}

/// Everything one mutation writes
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    pub user_id: UserId,
    /// Version read before planning; 0 inserts a new balance row
    pub expected_version: i64,
    /// New bucket state; `version` on it is ignored
    pub balance: Balance,
    pub subscription: Option<Subscription>,
    pub transactions: Vec<NewTransaction>,
    /// Dedup registry row written together with the mutation
    pub processed_event: Option<ProcessedWebhookEvent>,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { version: i64 },
    /// Balance row changed since it was read
    VersionConflict,
    /// The processed event id is already registered
    DuplicateEvent,
    /// A transaction with the same (source_event_id, bucket) already exists
    DuplicateSource,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_account(&self, user_id: &UserId) -> BillingResult<AccountSnapshot>;

    async fn load_subscription(&self, user_id: &UserId) -> BillingResult<Option<Subscription>>;

    async fn find_user_by_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<UserId>>;

    async fn find_user_by_customer(&self, stripe_customer_id: &str)
        -> BillingResult<Option<UserId>>;

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool>;

    async fn commit(&self, commit: LedgerCommit) -> BillingResult<CommitOutcome>;

    /// Register an event that had no ledger effect. Returns false if it was
    /// already registered.
    async fn record_event(&self, event: ProcessedWebhookEvent) -> BillingResult<bool>;

    /// Newest first
    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: Option<i64>,
    ) -> BillingResult<Vec<CreditTransaction>>;

    /// Newest first
    async fn list_processed_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ProcessedWebhookEvent>>;

    async fn prune_processed_events(&self, older_than: OffsetDateTime) -> BillingResult<u64>;

    async fn list_user_ids(&self, limit: i64, offset: i64) -> BillingResult<Vec<UserId>>;

    async fn list_users_with_expired_free(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<UserId>>;
}
