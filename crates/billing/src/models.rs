//! Ledger data model
//!
//! A user owns one [`Balance`] made of three [`Bucket`]s, zero-or-one
//! [`Subscription`], an append-only list of [`CreditTransaction`]s, and is
//! referenced by the [`ProcessedWebhookEvent`] dedup registry.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Identity anchor owned by the external auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One of the three independent credit pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Free,
    Subscription,
    OneTime,
}

impl BucketKind {
    pub const ALL: [BucketKind; 3] = [BucketKind::Free, BucketKind::Subscription, BucketKind::OneTime];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Free => "free",
            BucketKind::Subscription => "subscription",
            BucketKind::OneTime => "one_time",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(BucketKind::Free),
            "subscription" => Some(BucketKind::Subscription),
            "one_time" => Some(BucketKind::OneTime),
            _ => None,
        }
    }
}

impl std::fmt::Display for BucketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored state of a single credit pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bucket {
    pub balance: i64,
    /// Size of the most recent grant, for display ratios
    pub limit: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl Bucket {
    /// A bucket without an expiration never expires.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|end| now >= end)
    }

    /// Stored balance, or 0 once the bucket has expired
    pub fn effective(&self, now: OffsetDateTime) -> i64 {
        if self.is_expired(now) {
            0
        } else {
            self.balance
        }
    }
}

/// Per-user balance record, the unit of mutual exclusion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: UserId,
    pub free: Bucket,
    pub paid: Bucket,
    pub one_time: Bucket,
    /// Optimistic concurrency token; 0 means the row does not exist yet
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Balance {
    pub fn empty(user_id: UserId, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            free: Bucket::default(),
            paid: Bucket::default(),
            one_time: Bucket::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn bucket(&self, kind: BucketKind) -> &Bucket {
        match kind {
            BucketKind::Free => &self.free,
            BucketKind::Subscription => &self.paid,
            BucketKind::OneTime => &self.one_time,
        }
    }

    pub fn bucket_mut(&mut self, kind: BucketKind) -> &mut Bucket {
        match kind {
            BucketKind::Free => &mut self.free,
            BucketKind::Subscription => &mut self.paid,
            BucketKind::OneTime => &mut self.one_time,
        }
    }

    /// Spendable total at `now`. The subscription bucket only counts while
    /// a subscription is live.
    pub fn effective_total(&self, live_subscription: bool, now: OffsetDateTime) -> i64 {
        BucketKind::ALL
            .iter()
            .filter(|kind| live_subscription || **kind != BucketKind::Subscription)
            .map(|kind| self.bucket(*kind).effective(now))
            .sum()
    }
}

/// Subscription lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
    PastDue,
    Canceled,
    /// Derived at read time, never stored
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(SubscriptionStatus::None),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: UserId,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub price_name: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    /// `created` timestamp of the last provider event that changed the status
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Reasons recorded by the ledger itself. Debits carry a caller-supplied reason.
pub mod reason {
    pub const SIGNUP_GRANT: &str = "signup_grant";
    pub const FREE_REFRESH: &str = "free_refresh";
    pub const SUBSCRIPTION_GRANT: &str = "subscription_grant";
    pub const SUBSCRIPTION_RENEWAL: &str = "subscription_renewal";
    pub const ONE_TIME_PURCHASE: &str = "one_time_purchase";
    pub const EXPIRED: &str = "expired";
}

/// Append-only ledger row. `amount` is signed: credits positive, debits negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub bucket: BucketKind,
    pub amount: i64,
    pub reason: String,
    pub source_event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Ledger row before the store assigns its id and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub bucket: BucketKind,
    pub amount: i64,
    pub reason: String,
    pub source_event_id: Option<String>,
}

impl NewTransaction {
    pub fn new(bucket: BucketKind, amount: i64, reason: impl Into<String>) -> Self {
        Self {
            bucket,
            amount,
            reason: reason.into(),
            source_event_id: None,
        }
    }

    pub fn with_source(mut self, source_event_id: Option<String>) -> Self {
        self.source_event_id = source_event_id;
        self
    }
}

/// Dedup registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedWebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub user_id: Option<UserId>,
    /// Short description of the effect (`applied`, `ignored`, `stale`, ...)
    pub outcome: String,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_bucket_expiry_is_inclusive_of_end() {
        let end = datetime!(2025-01-31 00:00 UTC);
        let bucket = Bucket {
            balance: 7,
            limit: 10,
            expires_at: Some(end),
        };

        assert_eq!(bucket.effective(end - time::Duration::seconds(1)), 7);
        assert_eq!(bucket.effective(end), 0);
        assert!(bucket.is_expired(end));
    }

    #[test]
    fn test_bucket_without_expiry_never_expires() {
        let bucket = Bucket {
            balance: 3,
            limit: 3,
            expires_at: None,
        };
        assert_eq!(bucket.effective(datetime!(2999-01-01 00:00 UTC)), 3);
    }

    #[test]
    fn test_effective_total_skips_expired_buckets() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let mut balance = Balance::empty(UserId::new("user_1"), now);
        balance.free = Bucket {
            balance: 2,
            limit: 10,
            expires_at: Some(now - time::Duration::days(1)),
        };
        balance.paid = Bucket {
            balance: 5,
            limit: 100,
            expires_at: Some(now + time::Duration::days(10)),
        };
        balance.one_time = Bucket {
            balance: 3,
            limit: 3,
            expires_at: None,
        };

        assert_eq!(balance.effective_total(true, now), 8);
        assert_eq!(balance.effective_total(false, now), 3);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SubscriptionStatus::None,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::parse("trialing"), None);
    }
}
