//! In-memory ledger store
//!
//! Same commit semantics as the Postgres store, guarded by a single
//! `tokio::sync::RwLock`. Used by tests and local runs without a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Balance, BucketKind, CreditTransaction, ProcessedWebhookEvent, Subscription, UserId,
};
use crate::store::{AccountSnapshot, CommitOutcome, LedgerCommit, LedgerStore};

#[derive(Debug, Default)]
struct MemoryState {
    balances: HashMap<UserId, Balance>,
    subscriptions: HashMap<UserId, Subscription>,
    transactions: Vec<CreditTransaction>,
    sources: HashSet<(String, BucketKind)>,
    events: HashMap<String, ProcessedWebhookEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<RwLock<MemoryState>>,
    failures: Arc<AtomicUsize>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with `StoreUnavailable`
    pub fn inject_failure(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load_account(&self, user_id: &UserId) -> BillingResult<AccountSnapshot> {
        let state = self.state.read().await;
        Ok(AccountSnapshot {
            balance: state.balances.get(user_id).cloned(),
            subscription: state.subscriptions.get(user_id).cloned(),
        })
    }

    async fn load_subscription(&self, user_id: &UserId) -> BillingResult<Option<Subscription>> {
        Ok(self.state.read().await.subscriptions.get(user_id).cloned())
    }

    async fn find_user_by_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<UserId>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .map(|s| s.user_id.clone()))
    }

    async fn find_user_by_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<UserId>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.stripe_customer_id.as_deref() == Some(stripe_customer_id))
            .map(|s| s.user_id.clone()))
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self.state.read().await.events.contains_key(event_id))
    }

    async fn commit(&self, commit: LedgerCommit) -> BillingResult<CommitOutcome> {
        if self.take_failure() {
            return Err(BillingError::StoreUnavailable(
                "injected store failure".to_string(),
            ));
        }

        let mut state = self.state.write().await;

        if let Some(event) = &commit.processed_event {
            if state.events.contains_key(&event.event_id) {
                return Ok(CommitOutcome::DuplicateEvent);
            }
        }

        let current_version = state
            .balances
            .get(&commit.user_id)
            .map(|b| b.version)
            .unwrap_or(0);
        if current_version != commit.expected_version {
            return Ok(CommitOutcome::VersionConflict);
        }

        let mut new_sources = HashSet::new();
        for tx in &commit.transactions {
            if let Some(source) = &tx.source_event_id {
                let key = (source.clone(), tx.bucket);
                if state.sources.contains(&key) || !new_sources.insert(key) {
                    return Ok(CommitOutcome::DuplicateSource);
                }
            }
        }

        let version = commit.expected_version + 1;
        let mut balance = commit.balance;
        balance.version = version;
        balance.updated_at = commit.at;
        state.balances.insert(commit.user_id.clone(), balance);

        if let Some(subscription) = commit.subscription {
            state.subscriptions.insert(commit.user_id.clone(), subscription);
        }

        state.sources.extend(new_sources);
        for tx in commit.transactions {
            state.transactions.push(CreditTransaction {
                id: Uuid::new_v4(),
                user_id: commit.user_id.clone(),
                bucket: tx.bucket,
                amount: tx.amount,
                reason: tx.reason,
                source_event_id: tx.source_event_id,
                created_at: commit.at,
            });
        }

        if let Some(event) = commit.processed_event {
            state.events.insert(event.event_id.clone(), event);
        }

        Ok(CommitOutcome::Committed { version })
    }

    async fn record_event(&self, event: ProcessedWebhookEvent) -> BillingResult<bool> {
        if self.take_failure() {
            return Err(BillingError::StoreUnavailable(
                "injected store failure".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        if state.events.contains_key(&event.event_id) {
            return Ok(false);
        }
        state.events.insert(event.event_id.clone(), event);
        Ok(true)
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: Option<i64>,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let state = self.state.read().await;
        let rows = state
            .transactions
            .iter()
            .rev()
            .filter(|tx| &tx.user_id == user_id)
            .cloned();

        Ok(match limit {
            Some(limit) => rows.take(limit.max(0) as usize).collect(),
            None => rows.collect(),
        })
    }

    async fn list_processed_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ProcessedWebhookEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state.events.values().cloned().collect();
        events.sort_by(|a, b| {
            b.processed_at
                .cmp(&a.processed_at)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });

        Ok(events
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn prune_processed_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.write().await;
        let before = state.events.len();
        state.events.retain(|_, e| e.processed_at >= older_than);
        Ok((before - state.events.len()) as u64)
    }

    async fn list_user_ids(&self, limit: i64, offset: i64) -> BillingResult<Vec<UserId>> {
        let state = self.state.read().await;
        let mut ids: Vec<_> = state.balances.keys().cloned().collect();
        ids.sort();

        Ok(ids
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_users_with_expired_free(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<UserId>> {
        let state = self.state.read().await;
        let mut ids: Vec<_> = state
            .balances
            .values()
            .filter(|b| b.free.is_expired(now))
            .map(|b| b.user_id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit.max(0) as usize);
        Ok(ids)
    }
}
