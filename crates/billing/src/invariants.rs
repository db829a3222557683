//! Ledger Invariants Module
//!
//! Runnable consistency checks over stored balances, subscriptions and the
//! transaction log. Checks only read, never write, and can be run after any
//! mutation, webhook replay or on a schedule.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::models::{Balance, BucketKind, CreditTransaction, Subscription, SubscriptionStatus, UserId};
use crate::store::LedgerStore;
use crate::subscription::effective_status;

const PAGE_SIZE: i64 = 500;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub user_ids: Vec<UserId>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Credits can be spent that were never granted
    Critical,
    /// Stored state disagrees with itself or the log
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub users_checked: usize,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        users_checked: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            users_checked,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Everything the checks look at for one user
struct UserLedger {
    balance: Balance,
    subscription: Option<Subscription>,
    transactions: Vec<CreditTransaction>,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Run every check for every user
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let mut violations = Vec::new();
        let mut users_checked = 0;
        let mut offset = 0;

        loop {
            let users = self.store.list_user_ids(PAGE_SIZE, offset).await?;
            if users.is_empty() {
                break;
            }
            for user_id in &users {
                let Some(ledger) = self.load(user_id).await? else {
                    continue;
                };
                violations.extend(Self::check_ledger(&ledger, now));
                users_checked += 1;
            }
            offset += users.len() as i64;
        }

        if !violations.is_empty() {
            tracing::error!(
                violations = violations.len(),
                users_checked = users_checked,
                "Ledger invariant violations found"
            );
        }

        Ok(InvariantCheckSummary::from_violations(
            now,
            users_checked,
            violations,
        ))
    }

    /// Run every check for one user
    pub async fn check_user(&self, user_id: &UserId) -> BillingResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let ledger = self
            .load(user_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(user_id.to_string()))?;

        Ok(InvariantCheckSummary::from_violations(
            now,
            1,
            Self::check_ledger(&ledger, now),
        ))
    }

    /// Run a single invariant check by name for one user
    pub async fn run_check(
        &self,
        name: &str,
        user_id: &UserId,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let now = self.clock.now();
        let Some(ledger) = self.load(user_id).await? else {
            return Ok(vec![]);
        };

        Ok(match name {
            "non_negative_buckets" => Self::check_non_negative(&ledger),
            "balance_within_limit" => Self::check_within_limit(&ledger),
            "paid_balance_requires_subscription" => Self::check_paid_requires_subscription(&ledger, now),
            "ledger_reconstructs_balance" => Self::check_ledger_sum(&ledger),
            _ => vec![],
        })
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "non_negative_buckets",
            "balance_within_limit",
            "paid_balance_requires_subscription",
            "ledger_reconstructs_balance",
        ]
    }

    async fn load(&self, user_id: &UserId) -> BillingResult<Option<UserLedger>> {
        let snapshot = self.store.load_account(user_id).await?;
        let Some(balance) = snapshot.balance else {
            return Ok(None);
        };
        let transactions = self.store.list_transactions(user_id, None).await?;

        Ok(Some(UserLedger {
            balance,
            subscription: snapshot.subscription,
            transactions,
        }))
    }

    fn check_ledger(ledger: &UserLedger, now: OffsetDateTime) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        violations.extend(Self::check_non_negative(ledger));
        violations.extend(Self::check_within_limit(ledger));
        violations.extend(Self::check_paid_requires_subscription(ledger, now));
        violations.extend(Self::check_ledger_sum(ledger));
        violations
    }

    /// Invariant 1: no bucket balance is ever negative
    fn check_non_negative(ledger: &UserLedger) -> Vec<InvariantViolation> {
        BucketKind::ALL
            .iter()
            .filter(|kind| ledger.balance.bucket(**kind).balance < 0)
            .map(|kind| InvariantViolation {
                invariant: "non_negative_buckets".to_string(),
                user_ids: vec![ledger.balance.user_id.clone()],
                description: format!("{} bucket balance is negative", kind),
                context: serde_json::json!({
                    "bucket": kind.as_str(),
                    "balance": ledger.balance.bucket(*kind).balance,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect()
    }

    /// Invariant 2: each bucket balance is at most its most recent limit
    fn check_within_limit(ledger: &UserLedger) -> Vec<InvariantViolation> {
        BucketKind::ALL
            .iter()
            .filter(|kind| {
                let bucket = ledger.balance.bucket(**kind);
                bucket.balance > bucket.limit
            })
            .map(|kind| {
                let bucket = ledger.balance.bucket(*kind);
                InvariantViolation {
                    invariant: "balance_within_limit".to_string(),
                    user_ids: vec![ledger.balance.user_id.clone()],
                    description: format!(
                        "{} bucket holds {} credits but its limit is {}",
                        kind, bucket.balance, bucket.limit
                    ),
                    context: serde_json::json!({
                        "bucket": kind.as_str(),
                        "balance": bucket.balance,
                        "limit": bucket.limit,
                    }),
                    severity: ViolationSeverity::High,
                }
            })
            .collect()
    }

    /// Invariant 3: spendable subscription credits only while the
    /// subscription is within its paid period
    fn check_paid_requires_subscription(
        ledger: &UserLedger,
        now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        let paid = ledger.balance.paid.effective(now);
        let status = effective_status(ledger.subscription.as_ref(), now);
        if paid == 0 || !matches!(status, SubscriptionStatus::None | SubscriptionStatus::Expired) {
            return vec![];
        }

        vec![InvariantViolation {
            invariant: "paid_balance_requires_subscription".to_string(),
            user_ids: vec![ledger.balance.user_id.clone()],
            description: format!(
                "{} spendable subscription credits with subscription status {}",
                paid, status
            ),
            context: serde_json::json!({
                "paid_balance": paid,
                "paid_end": ledger.balance.paid.expires_at.map(|t| t.unix_timestamp()),
                "status": status.as_str(),
            }),
            severity: ViolationSeverity::Medium,
        }]
    }

    /// Invariant 4: signed sum of transaction rows per bucket equals the
    /// stored bucket balance
    fn check_ledger_sum(ledger: &UserLedger) -> Vec<InvariantViolation> {
        let mut sums: HashMap<BucketKind, i64> = HashMap::new();
        for tx in &ledger.transactions {
            *sums.entry(tx.bucket).or_insert(0) += tx.amount;
        }

        BucketKind::ALL
            .iter()
            .filter_map(|kind| {
                let stored = ledger.balance.bucket(*kind).balance;
                let logged = sums.get(kind).copied().unwrap_or(0);
                (stored != logged).then(|| InvariantViolation {
                    invariant: "ledger_reconstructs_balance".to_string(),
                    user_ids: vec![ledger.balance.user_id.clone()],
                    description: format!(
                        "{} bucket stores {} but transactions sum to {}",
                        kind, stored, logged
                    ),
                    context: serde_json::json!({
                        "bucket": kind.as_str(),
                        "stored": stored,
                        "transaction_sum": logged,
                    }),
                    severity: ViolationSeverity::High,
                })
            })
            .collect()
    }
}
