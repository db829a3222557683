//! Ledger engine
//!
//! Applies credits and debits to the three buckets of a user's balance.
//!
//! ## Spend order
//!
//! With a live subscription: subscription -> one-time -> free.
//! Without one: one-time -> free. Expired buckets are skipped.
//!
//! ## Concurrency
//!
//! Each mutation reads the balance row with its version, plans the new state
//! in memory and commits with a version check. A conflicting commit is retried
//! with jittered exponential backoff; after `max_conflict_retries` the caller
//! gets `TemporarilyUnavailable`.
//!
//! ## Expiry
//!
//! Reads treat expired buckets as zero without writing. Every committed
//! mutation also zeroes the stored balance of expired buckets and records an
//! `expired` row for the removed amount, so the signed sum of a bucket's
//! transaction rows always equals its stored balance.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    reason, Balance, BucketKind, CreditTransaction, NewTransaction, ProcessedWebhookEvent,
    Subscription, UserId,
};
use crate::store::{CommitOutcome, LedgerCommit, LedgerStore};
use crate::subscription::has_live_subscription;

/// How a credit changes the bucket balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditMode {
    /// `min(balance + amount, limit)`
    TopUp,
    /// Fresh allotment or renewal: balance becomes `limit`
    Replace,
}

/// Bucket change computed by [`apply_credit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditGrant {
    pub bucket: BucketKind,
    pub amount: i64,
    pub limit: i64,
    pub expires_at: Option<OffsetDateTime>,
    pub mode: CreditMode,
    pub reason: String,
    pub source_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest {
    pub user_id: UserId,
    pub grant: CreditGrant,
}

/// Per-bucket balances with expired buckets reported as zero
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveBalance {
    pub user_id: UserId,
    pub free: i64,
    pub subscription: i64,
    pub one_time: i64,
    pub total: i64,
}

impl EffectiveBalance {
    /// The subscription bucket reads as 0 unless `subscription` is live, since
    /// debits never draw from it otherwise.
    pub fn of(
        balance: &Balance,
        subscription: Option<&Subscription>,
        now: OffsetDateTime,
    ) -> Self {
        let free = balance.free.effective(now);
        let subscription = if has_live_subscription(subscription, now) {
            balance.paid.effective(now)
        } else {
            0
        };
        let one_time = balance.one_time.effective(now);
        Self {
            user_id: balance.user_id.clone(),
            free,
            subscription,
            one_time,
            total: free + subscription + one_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketDraw {
    pub bucket: BucketKind,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebitReceipt {
    pub user_id: UserId,
    pub amount: i64,
    pub drawn: Vec<BucketDraw>,
    pub remaining_balance: i64,
}

/// Result of a mutation that may already have happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<T> {
    Applied(T),
    /// Nothing to change. Only the event record, if any, was written
    Unchanged(T),
    /// The event or source id was already recorded
    AlreadyApplied,
}

impl<T> Mutation<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Mutation::Applied(_))
    }
}

/// Webhook event a mutation is recorded against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub event_id: String,
    pub event_type: String,
}

/// State handed to a planner; the planner edits it in place
#[derive(Debug, Clone)]
pub(crate) struct LedgerState {
    pub balance: Balance,
    pub subscription: Option<Subscription>,
}

impl LedgerState {
    pub fn effective(&self, now: OffsetDateTime) -> EffectiveBalance {
        EffectiveBalance::of(&self.balance, self.subscription.as_ref(), now)
    }
}

pub(crate) struct Plan<T> {
    pub transactions: Vec<NewTransaction>,
    pub subscription_changed: bool,
    pub outcome: &'static str,
    pub value: T,
}

impl<T> Plan<T> {
    pub fn new(value: T) -> Self {
        Self {
            transactions: Vec::new(),
            subscription_changed: false,
            outcome: "applied",
            value,
        }
    }
}

pub(crate) enum Decision<T> {
    Apply(Plan<T>),
    /// Record the event (if any) with `outcome` and write nothing else
    Skip { outcome: &'static str, value: T },
}

/// Zero expired buckets and return the matching `expired` rows
pub fn expire_stale(balance: &mut Balance, now: OffsetDateTime) -> Vec<NewTransaction> {
    let mut rows = Vec::new();
    for kind in BucketKind::ALL {
        let bucket = balance.bucket_mut(kind);
        if bucket.is_expired(now) && bucket.balance > 0 {
            rows.push(NewTransaction::new(kind, -bucket.balance, reason::EXPIRED));
            bucket.balance = 0;
        }
    }
    rows
}

/// Apply a credit to one bucket and return its ledger row.
///
/// The row records the actual change in balance, which can be smaller than
/// `amount` when a top-up hits the limit.
pub fn apply_credit(balance: &mut Balance, grant: &CreditGrant) -> BillingResult<NewTransaction> {
    if grant.amount < 0 {
        return Err(BillingError::InvalidInput(
            "credit amount must not be negative".to_string(),
        ));
    }
    if grant.limit < 0 {
        return Err(BillingError::InvalidInput(
            "credit limit must not be negative".to_string(),
        ));
    }

    let bucket = balance.bucket_mut(grant.bucket);
    let before = bucket.balance;
    let after = match grant.mode {
        CreditMode::TopUp => before.saturating_add(grant.amount).min(grant.limit),
        CreditMode::Replace => grant.limit,
    };

    bucket.balance = after;
    bucket.limit = grant.limit;
    bucket.expires_at = grant.expires_at;

    Ok(
        NewTransaction::new(grant.bucket, after - before, grant.reason.clone())
            .with_source(grant.source_event_id.clone()),
    )
}

/// Spend order for a debit
pub fn spend_order(live_subscription: bool) -> &'static [BucketKind] {
    if live_subscription {
        &[BucketKind::Subscription, BucketKind::OneTime, BucketKind::Free]
    } else {
        &[BucketKind::OneTime, BucketKind::Free]
    }
}

/// Draw `amount` across buckets in spend order. All-or-nothing: on
/// `InsufficientCredits` the balance is left untouched.
pub fn apply_debit(
    balance: &mut Balance,
    live_subscription: bool,
    amount: i64,
    now: OffsetDateTime,
) -> BillingResult<Vec<BucketDraw>> {
    if amount <= 0 {
        return Err(BillingError::InvalidInput(
            "debit amount must be positive".to_string(),
        ));
    }

    let order = spend_order(live_subscription);
    let available: i64 = order
        .iter()
        .map(|kind| balance.bucket(*kind).effective(now))
        .sum();
    if available < amount {
        return Err(BillingError::InsufficientCredits {
            requested: amount,
            available,
        });
    }

    let mut remaining = amount;
    let mut drawn = Vec::new();
    for kind in order {
        if remaining == 0 {
            break;
        }
        let bucket = balance.bucket_mut(*kind);
        let usable = bucket.effective(now);
        let take = usable.min(remaining);
        if take > 0 {
            bucket.balance -= take;
            remaining -= take;
            drawn.push(BucketDraw {
                bucket: *kind,
                amount: take,
            });
        }
    }

    Ok(drawn)
}

/// Grant for a one-time purchase: added on top of what is left, validity
/// extended to the later of the current expiry and `now + validity`.
pub fn one_time_grant(
    balance: &Balance,
    credits: i64,
    validity: Duration,
    now: OffsetDateTime,
    source_event_id: Option<String>,
) -> CreditGrant {
    let current = &balance.one_time;
    let fresh_end = now + validity;
    let expires_at = match current.expires_at {
        Some(end) if end > fresh_end => end,
        _ => fresh_end,
    };

    CreditGrant {
        bucket: BucketKind::OneTime,
        amount: credits,
        limit: current.effective(now) + credits,
        expires_at: Some(expires_at),
        mode: CreditMode::TopUp,
        reason: reason::ONE_TIME_PURCHASE.to_string(),
        source_event_id,
    }
}

pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    config: Arc<BillingConfig>,
    clock: Arc<dyn Clock>,
}

impl LedgerEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: Arc<BillingConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Credit one bucket. Idempotent per `source_event_id`.
    pub async fn credit(&self, request: CreditRequest) -> BillingResult<Mutation<EffectiveBalance>> {
        let grant = request.grant;
        let result = self
            .mutate(&request.user_id, true, None, |state, now| {
                let row = apply_credit(&mut state.balance, &grant)?;
                let mut plan = Plan::new(state.effective(now));
                plan.transactions.push(row);
                Ok(Decision::Apply(plan))
            })
            .await?;

        match &result {
            Mutation::Applied(balance) => tracing::info!(
                user_id = %request.user_id,
                bucket = %grant.bucket,
                amount = grant.amount,
                total = balance.total,
                "Credits granted"
            ),
            _ => tracing::info!(
                user_id = %request.user_id,
                source_event_id = ?grant.source_event_id,
                "Credit already applied for source event"
            ),
        }

        Ok(result)
    }

    /// Consume credits in spend order
    pub async fn debit(
        &self,
        user_id: &UserId,
        amount: i64,
        debit_reason: &str,
    ) -> BillingResult<DebitReceipt> {
        let result = self
            .mutate(user_id, false, None, |state, now| {
                let live = has_live_subscription(state.subscription.as_ref(), now);
                let drawn = apply_debit(&mut state.balance, live, amount, now)?;

                let mut plan = Plan::new(DebitReceipt {
                    user_id: user_id.clone(),
                    amount,
                    drawn: drawn.clone(),
                    remaining_balance: state.balance.effective_total(live, now),
                });
                plan.transactions = drawn
                    .iter()
                    .map(|d| NewTransaction::new(d.bucket, -d.amount, debit_reason))
                    .collect();
                Ok(Decision::Apply(plan))
            })
            .await;

        match result {
            Ok(Mutation::Applied(receipt)) | Ok(Mutation::Unchanged(receipt)) => {
                tracing::info!(
                    user_id = %user_id,
                    amount = amount,
                    remaining = receipt.remaining_balance,
                    "Credits debited"
                );
                Ok(receipt)
            }
            Ok(Mutation::AlreadyApplied) => Err(BillingError::Internal(
                "debit reported as already applied".to_string(),
            )),
            Err(e @ BillingError::InsufficientCredits { .. }) => {
                tracing::info!(user_id = %user_id, amount = amount, "Debit refused: {}", e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Pure read; never writes
    pub async fn effective_balance(&self, user_id: &UserId) -> BillingResult<EffectiveBalance> {
        let snapshot = self.store.load_account(user_id).await?;
        let balance = snapshot
            .balance
            .ok_or_else(|| BillingError::AccountNotFound(user_id.to_string()))?;
        Ok(EffectiveBalance::of(
            &balance,
            snapshot.subscription.as_ref(),
            self.clock.now(),
        ))
    }

    /// Create the balance row with the signup free allotment. An account a
    /// webhook created first still gets the allotment once; after that the
    /// call changes nothing.
    pub async fn open_account(&self, user_id: &UserId) -> BillingResult<Mutation<EffectiveBalance>> {
        let allotment = self.config.free_allotment;
        let period = Duration::days(self.config.free_period_days);

        let result = self
            .mutate(user_id, true, None, |state, now| {
                let free = &state.balance.free;
                let free_granted = free.expires_at.is_some() || free.limit > 0;
                if state.balance.is_persisted() && free_granted {
                    return Ok(Decision::Skip {
                        outcome: "exists",
                        value: state.effective(now),
                    });
                }

                let row = apply_credit(
                    &mut state.balance,
                    &CreditGrant {
                        bucket: BucketKind::Free,
                        amount: allotment,
                        limit: allotment,
                        expires_at: Some(now + period),
                        mode: CreditMode::Replace,
                        reason: reason::SIGNUP_GRANT.to_string(),
                        source_event_id: None,
                    },
                )?;
                let mut plan = Plan::new(state.effective(now));
                plan.transactions.push(row);
                Ok(Decision::Apply(plan))
            })
            .await?;

        if result.is_applied() {
            tracing::info!(user_id = %user_id, free = allotment, "Credit account opened");
        }
        Ok(result)
    }

    /// Re-grant the free allotment once the free bucket has expired
    pub async fn refresh_free_allotment(
        &self,
        user_id: &UserId,
    ) -> BillingResult<Mutation<EffectiveBalance>> {
        let allotment = self.config.free_allotment;
        let period = Duration::days(self.config.free_period_days);

        let result = self
            .mutate(user_id, false, None, |state, now| {
                let free = &state.balance.free;
                if free.expires_at.is_some() && !free.is_expired(now) {
                    return Ok(Decision::Skip {
                        outcome: "not_due",
                        value: state.effective(now),
                    });
                }

                let row = apply_credit(
                    &mut state.balance,
                    &CreditGrant {
                        bucket: BucketKind::Free,
                        amount: allotment,
                        limit: allotment,
                        expires_at: Some(now + period),
                        mode: CreditMode::Replace,
                        reason: reason::FREE_REFRESH.to_string(),
                        source_event_id: None,
                    },
                )?;
                let mut plan = Plan::new(state.effective(now));
                plan.transactions.push(row);
                Ok(Decision::Apply(plan))
            })
            .await?;

        if result.is_applied() {
            tracing::info!(user_id = %user_id, free = allotment, "Free allotment refreshed");
        }
        Ok(result)
    }

    /// Newest ledger rows first
    pub async fn usage_history(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        if limit <= 0 {
            return Err(BillingError::InvalidInput(
                "limit must be positive".to_string(),
            ));
        }
        self.store.list_transactions(user_id, Some(limit)).await
    }

    /// Read, plan and commit with bounded optimistic retries
    pub(crate) async fn mutate<T, F>(
        &self,
        user_id: &UserId,
        create_if_missing: bool,
        event: Option<&EventContext>,
        planner: F,
    ) -> BillingResult<Mutation<T>>
    where
        T: Send,
        F: Fn(&mut LedgerState, OffsetDateTime) -> BillingResult<Decision<T>> + Send + Sync,
    {
        let strategy = ExponentialBackoff::from_millis(5)
            .max_delay(StdDuration::from_millis(200))
            .map(jitter)
            .take(self.config.max_conflict_retries);

        let result = RetryIf::start(
            strategy,
            || self.try_mutate(user_id, create_if_missing, event, &planner),
            |e: &BillingError| {
                let retry = matches!(e, BillingError::ConcurrentUpdateConflict);
                if retry {
                    tracing::warn!(user_id = %user_id, "Balance version conflict, retrying");
                }
                retry
            },
        )
        .await;

        match result {
            Err(BillingError::ConcurrentUpdateConflict) => {
                tracing::warn!(
                    user_id = %user_id,
                    retries = self.config.max_conflict_retries,
                    "Giving up after repeated balance conflicts"
                );
                Err(BillingError::TemporarilyUnavailable)
            }
            other => other,
        }
    }

    async fn try_mutate<T, F>(
        &self,
        user_id: &UserId,
        create_if_missing: bool,
        event: Option<&EventContext>,
        planner: &F,
    ) -> BillingResult<Mutation<T>>
    where
        F: Fn(&mut LedgerState, OffsetDateTime) -> BillingResult<Decision<T>>,
    {
        let snapshot = self.store.load_account(user_id).await?;
        let now = self.clock.now();
        let expected_version = snapshot.version();

        let balance = match snapshot.balance {
            Some(balance) => balance,
            None if create_if_missing => Balance::empty(user_id.clone(), now),
            None => return Err(BillingError::AccountNotFound(user_id.to_string())),
        };

        let mut state = LedgerState {
            balance,
            subscription: snapshot.subscription,
        };
        let mut transactions = expire_stale(&mut state.balance, now);
        let unplanned = state.balance.clone();

        let plan = match planner(&mut state, now)? {
            Decision::Apply(plan) => plan,
            Decision::Skip { outcome, value } => {
                let Some(event) = event else {
                    return Ok(Mutation::Unchanged(value));
                };
                // The skip was decided on this snapshot, so the event is
                // registered under the same version check as a real change
                let commit = LedgerCommit {
                    user_id: user_id.clone(),
                    expected_version,
                    balance: unplanned,
                    subscription: None,
                    transactions,
                    processed_event: Some(processed_record(event, user_id, outcome, now)),
                    at: now,
                };
                return match self.store.commit(commit).await? {
                    CommitOutcome::Committed { .. } => Ok(Mutation::Unchanged(value)),
                    CommitOutcome::VersionConflict => Err(BillingError::ConcurrentUpdateConflict),
                    CommitOutcome::DuplicateEvent | CommitOutcome::DuplicateSource => {
                        Ok(Mutation::AlreadyApplied)
                    }
                };
            }
        };

        transactions.extend(plan.transactions);
        let commit = LedgerCommit {
            user_id: user_id.clone(),
            expected_version,
            balance: state.balance,
            subscription: if plan.subscription_changed {
                state.subscription
            } else {
                None
            },
            transactions,
            processed_event: event.map(|e| processed_record(e, user_id, plan.outcome, now)),
            at: now,
        };

        match self.store.commit(commit).await? {
            CommitOutcome::Committed { .. } => Ok(Mutation::Applied(plan.value)),
            CommitOutcome::VersionConflict => Err(BillingError::ConcurrentUpdateConflict),
            CommitOutcome::DuplicateEvent | CommitOutcome::DuplicateSource => {
                Ok(Mutation::AlreadyApplied)
            }
        }
    }
}

fn processed_record(
    event: &EventContext,
    user_id: &UserId,
    outcome: &str,
    now: OffsetDateTime,
) -> ProcessedWebhookEvent {
    ProcessedWebhookEvent {
        event_id: event.event_id.clone(),
        event_type: event.event_type.clone(),
        user_id: Some(user_id.clone()),
        outcome: outcome.to_string(),
        processed_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryLedgerStore;
    use crate::models::Bucket;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

    fn balance(free: i64, paid: i64, one_time: i64) -> Balance {
        let mut b = Balance::empty(UserId::new("user_1"), NOW);
        let end = Some(NOW + Duration::days(10));
        b.free = Bucket {
            balance: free,
            limit: free,
            expires_at: end,
        };
        b.paid = Bucket {
            balance: paid,
            limit: paid,
            expires_at: end,
        };
        b.one_time = Bucket {
            balance: one_time,
            limit: one_time,
            expires_at: end,
        };
        b
    }

    fn engine() -> (LedgerEngine, MemoryLedgerStore, Arc<ManualClock>) {
        let store = MemoryLedgerStore::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = LedgerEngine::new(
            Arc::new(store.clone()),
            Arc::new(BillingConfig::default()),
            clock.clone(),
        );
        (engine, store, clock)
    }

    #[test]
    fn test_debit_spends_subscription_first() {
        let mut b = balance(2, 5, 3);
        let drawn = apply_debit(&mut b, true, 6, NOW).unwrap();

        assert_eq!(b.paid.balance, 0);
        assert_eq!(b.one_time.balance, 2);
        assert_eq!(b.free.balance, 2);
        assert_eq!(
            drawn,
            vec![
                BucketDraw {
                    bucket: BucketKind::Subscription,
                    amount: 5
                },
                BucketDraw {
                    bucket: BucketKind::OneTime,
                    amount: 1
                },
            ]
        );
    }

    #[test]
    fn test_debit_without_subscription_skips_paid_bucket() {
        let mut b = balance(2, 5, 3);
        let err = apply_debit(&mut b, false, 6, NOW).unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits {
                requested: 6,
                available: 5
            }
        ));
        assert_eq!(b, balance(2, 5, 3));

        apply_debit(&mut b, false, 4, NOW).unwrap();
        assert_eq!((b.one_time.balance, b.free.balance, b.paid.balance), (0, 1, 5));
    }

    #[test]
    fn test_debit_skips_expired_bucket() {
        let mut b = balance(2, 0, 3);
        b.one_time.expires_at = Some(NOW - Duration::seconds(1));

        let err = apply_debit(&mut b, false, 3, NOW).unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits { available: 2, .. }
        ));

        apply_debit(&mut b, false, 2, NOW).unwrap();
        assert_eq!(b.free.balance, 0);
        assert_eq!(b.one_time.balance, 3);
    }

    #[test]
    fn test_debit_rejects_non_positive_amount() {
        let mut b = balance(2, 0, 0);
        assert!(matches!(
            apply_debit(&mut b, false, 0, NOW),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_top_up_is_capped_at_limit() {
        let mut b = balance(8, 0, 0);
        let grant = CreditGrant {
            bucket: BucketKind::Free,
            amount: 5,
            limit: 10,
            expires_at: Some(NOW + Duration::days(30)),
            mode: CreditMode::TopUp,
            reason: "bonus".into(),
            source_event_id: None,
        };

        let row = apply_credit(&mut b, &grant).unwrap();
        assert_eq!(b.free.balance, 10);
        assert_eq!(row.amount, 2);
    }

    #[test]
    fn test_replace_resets_to_limit() {
        let mut b = balance(0, 37, 0);
        let grant = CreditGrant {
            bucket: BucketKind::Subscription,
            amount: 100,
            limit: 100,
            expires_at: Some(NOW + Duration::days(30)),
            mode: CreditMode::Replace,
            reason: reason::SUBSCRIPTION_RENEWAL.into(),
            source_event_id: Some("evt_1".into()),
        };

        let row = apply_credit(&mut b, &grant).unwrap();
        assert_eq!(b.paid.balance, 100);
        assert_eq!(b.paid.limit, 100);
        assert_eq!(row.amount, 63);
        assert_eq!(row.source_event_id.as_deref(), Some("evt_1"));
    }

    #[test]
    fn test_expire_stale_records_removed_amount() {
        let mut b = balance(4, 0, 3);
        b.free.expires_at = Some(NOW);

        let rows = expire_stale(&mut b, NOW);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bucket, BucketKind::Free);
        assert_eq!(rows[0].amount, -4);
        assert_eq!(rows[0].reason, reason::EXPIRED);
        assert_eq!(b.free.balance, 0);
        assert_eq!(b.one_time.balance, 3);
    }

    #[test]
    fn test_one_time_grant_stacks_on_remaining_balance() {
        let mut b = balance(0, 0, 20);
        let later = NOW + Duration::days(500);
        b.one_time.expires_at = Some(later);

        let grant = one_time_grant(&b, 50, Duration::days(365), NOW, Some("evt_p".into()));
        assert_eq!(grant.limit, 70);
        assert_eq!(grant.expires_at, Some(later));

        apply_credit(&mut b, &grant).unwrap();
        assert_eq!(b.one_time.balance, 70);
    }

    #[tokio::test]
    async fn test_open_account_is_idempotent() {
        let (engine, store, _) = engine();
        let user = UserId::new("user_1");

        let first = engine.open_account(&user).await.unwrap();
        assert!(first.is_applied());

        let second = engine.open_account(&user).await.unwrap();
        assert!(matches!(second, Mutation::Unchanged(ref b) if b.free == 10));
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_open_account_grants_free_once_when_row_already_exists() {
        let (engine, store, _) = engine();
        let user = UserId::new("user_1");
        engine
            .credit(CreditRequest {
                user_id: user.clone(),
                grant: CreditGrant {
                    bucket: BucketKind::OneTime,
                    amount: 5,
                    limit: 5,
                    expires_at: None,
                    mode: CreditMode::TopUp,
                    reason: reason::ONE_TIME_PURCHASE.into(),
                    source_event_id: Some("evt_pack".into()),
                },
            })
            .await
            .unwrap();

        let opened = engine.open_account(&user).await.unwrap();
        assert!(matches!(opened, Mutation::Applied(ref b) if b.free == 10 && b.one_time == 5));

        let again = engine.open_account(&user).await.unwrap();
        assert!(matches!(again, Mutation::Unchanged(_)));
        assert_eq!(store.transaction_count().await, 2);
    }

    #[tokio::test]
    async fn test_reported_total_is_always_debitable() {
        let (engine, _, _) = engine();
        let user = UserId::new("user_1");
        engine.open_account(&user).await.unwrap();
        engine
            .credit(CreditRequest {
                user_id: user.clone(),
                grant: CreditGrant {
                    bucket: BucketKind::Subscription,
                    amount: 20,
                    limit: 20,
                    expires_at: Some(NOW + Duration::days(30)),
                    mode: CreditMode::Replace,
                    reason: reason::SUBSCRIPTION_GRANT.into(),
                    source_event_id: None,
                },
            })
            .await
            .unwrap();

        // no subscription row, so the paid bucket is not spendable
        let balance = engine.effective_balance(&user).await.unwrap();
        assert_eq!(balance.subscription, 0);
        assert_eq!(balance.total, 10);

        let receipt = engine.debit(&user, balance.total, "usage").await.unwrap();
        assert_eq!(receipt.remaining_balance, 0);
    }

    #[tokio::test]
    async fn test_debit_unknown_account() {
        let (engine, _, _) = engine();
        let err = engine
            .debit(&UserId::new("ghost"), 1, "usage")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_credit_is_idempotent_per_source_event() {
        let (engine, store, _) = engine();
        let user = UserId::new("user_1");
        let request = CreditRequest {
            user_id: user.clone(),
            grant: CreditGrant {
                bucket: BucketKind::OneTime,
                amount: 25,
                limit: 25,
                expires_at: None,
                mode: CreditMode::TopUp,
                reason: reason::ONE_TIME_PURCHASE.into(),
                source_event_id: Some("evt_42".into()),
            },
        };

        assert!(engine.credit(request.clone()).await.unwrap().is_applied());
        assert_eq!(
            engine.credit(request).await.unwrap(),
            Mutation::AlreadyApplied
        );

        assert_eq!(engine.effective_balance(&user).await.unwrap().one_time, 25);
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_free_refresh_after_expiry() {
        let (engine, _, clock) = engine();
        let user = UserId::new("user_1");
        engine.open_account(&user).await.unwrap();
        engine.debit(&user, 7, "usage").await.unwrap();

        let early = engine.refresh_free_allotment(&user).await.unwrap();
        assert!(matches!(early, Mutation::Unchanged(_)));

        clock.advance(Duration::days(31));
        assert_eq!(engine.effective_balance(&user).await.unwrap().free, 0);

        let refreshed = engine.refresh_free_allotment(&user).await.unwrap();
        assert!(matches!(refreshed, Mutation::Applied(ref b) if b.free == 10));

        // expired remainder + refresh rows keep the ledger sum equal to the balance
        let history = engine.usage_history(&user, 50).await.unwrap();
        let sum: i64 = history
            .iter()
            .filter(|tx| tx.bucket == BucketKind::Free)
            .map(|tx| tx.amount)
            .sum();
        assert_eq!(sum, 10);
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        use async_trait::async_trait;

        use crate::store::AccountSnapshot;

        struct AlwaysConflicting;

        #[async_trait]
        impl LedgerStore for AlwaysConflicting {
            async fn load_account(&self, user_id: &UserId) -> BillingResult<AccountSnapshot> {
                let mut b = Balance::empty(user_id.clone(), NOW);
                b.version = 1;
                b.free = Bucket {
                    balance: 5,
                    limit: 5,
                    expires_at: None,
                };
                Ok(AccountSnapshot {
                    balance: Some(b),
                    subscription: None,
                })
            }
            async fn load_subscription(&self, _: &UserId) -> BillingResult<Option<Subscription>> {
                Ok(None)
            }
            async fn find_user_by_subscription(&self, _: &str) -> BillingResult<Option<UserId>> {
                Ok(None)
            }
            async fn find_user_by_customer(&self, _: &str) -> BillingResult<Option<UserId>> {
                Ok(None)
            }
            async fn is_event_processed(&self, _: &str) -> BillingResult<bool> {
                Ok(false)
            }
            async fn commit(&self, _: LedgerCommit) -> BillingResult<CommitOutcome> {
                Ok(CommitOutcome::VersionConflict)
            }
            async fn record_event(&self, _: ProcessedWebhookEvent) -> BillingResult<bool> {
                Ok(true)
            }
            async fn list_transactions(
                &self,
                _: &UserId,
                _: Option<i64>,
            ) -> BillingResult<Vec<CreditTransaction>> {
                Ok(Vec::new())
            }
            async fn list_processed_events(
                &self,
                _: i64,
                _: i64,
            ) -> BillingResult<Vec<ProcessedWebhookEvent>> {
                Ok(Vec::new())
            }
            async fn prune_processed_events(&self, _: OffsetDateTime) -> BillingResult<u64> {
                Ok(0)
            }
            async fn list_user_ids(&self, _: i64, _: i64) -> BillingResult<Vec<UserId>> {
                Ok(Vec::new())
            }
            async fn list_users_with_expired_free(
                &self,
                _: OffsetDateTime,
                _: i64,
            ) -> BillingResult<Vec<UserId>> {
                Ok(Vec::new())
            }
        }

        let engine = LedgerEngine::new(
            Arc::new(AlwaysConflicting),
            Arc::new(BillingConfig {
                max_conflict_retries: 2,
                ..BillingConfig::default()
            }),
            Arc::new(ManualClock::new(NOW)),
        );

        let err = engine
            .debit(&UserId::new("user_1"), 1, "usage")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TemporarilyUnavailable));
        assert!(err.is_retryable());

        // a skipped event is registered under the same version check
        let event = EventContext {
            event_id: "evt_stale".into(),
            event_type: "customer.subscription.updated".into(),
        };
        let skipped = engine
            .mutate(&UserId::new("user_1"), false, Some(&event), |_, _| {
                Ok(Decision::Skip {
                    outcome: "stale",
                    value: (),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(skipped, BillingError::TemporarilyUnavailable));
    }
}
