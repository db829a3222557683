//! Read-side projection of balance and subscription
//!
//! Expiry is applied to the returned values only; stored rows are never
//! touched by a read.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerEngine;
use crate::models::{Balance, BucketKind, Subscription, SubscriptionStatus, UserId};
use crate::subscription::{effective_status, has_live_subscription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSummary {
    pub kind: BucketKind,
    /// Effective balance (0 once expired)
    pub balance: i64,
    pub limit: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionSummary {
    /// Status as of the read, with `expired` derived
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub price_name: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditSummary {
    pub user_id: UserId,
    pub buckets: Vec<BucketSummary>,
    pub total_balance: i64,
    pub subscription: Option<SubscriptionSummary>,
}

impl CreditSummary {
    pub fn build(
        balance: &Balance,
        subscription: Option<&Subscription>,
        now: OffsetDateTime,
    ) -> Self {
        let live = has_live_subscription(subscription, now);
        let buckets: Vec<BucketSummary> = BucketKind::ALL
            .iter()
            .map(|kind| {
                let bucket = balance.bucket(*kind);
                let spendable = live || *kind != BucketKind::Subscription;
                BucketSummary {
                    kind: *kind,
                    balance: if spendable { bucket.effective(now) } else { 0 },
                    limit: bucket.limit,
                    expires_at: bucket.expires_at,
                    expired: bucket.is_expired(now),
                }
            })
            .collect();

        let subscription = subscription.map(|sub| SubscriptionSummary {
            status: effective_status(Some(sub), now),
            price_id: sub.price_id.clone(),
            price_name: sub.price_name.clone(),
            period_start: sub.period_start,
            period_end: sub.period_end,
        });

        Self {
            user_id: balance.user_id.clone(),
            total_balance: buckets.iter().map(|b| b.balance).sum(),
            buckets,
            subscription,
        }
    }

    pub fn bucket(&self, kind: BucketKind) -> Option<&BucketSummary> {
        self.buckets.iter().find(|b| b.kind == kind)
    }
}

impl LedgerEngine {
    /// Balances, limits, expirations, total and subscription status for one user
    pub async fn get_user_credit_summary(&self, user_id: &UserId) -> BillingResult<CreditSummary> {
        let snapshot = self.store().load_account(user_id).await?;
        let balance = snapshot
            .balance
            .ok_or_else(|| BillingError::AccountNotFound(user_id.to_string()))?;

        Ok(CreditSummary::build(
            &balance,
            snapshot.subscription.as_ref(),
            self.now(),
        ))
    }
}
