//! Postgres ledger store
//!
//! Every [`LedgerCommit`] runs in one SQL transaction: dedup registry insert,
//! versioned balance write, subscription upsert and transaction rows either
//! all land or none do.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Balance, Bucket, BucketKind, CreditTransaction, ProcessedWebhookEvent, Subscription,
    SubscriptionStatus, UserId,
};
use crate::store::{AccountSnapshot, CommitOutcome, LedgerCommit, LedgerStore};

#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_balance(
        tx: &mut Transaction<'_, Postgres>,
        commit: &LedgerCommit,
    ) -> BillingResult<bool> {
        let b = &commit.balance;
        let result = if commit.expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO credit_balances (
                    user_id, balance_free, balance_paid, balance_one_time_paid,
                    total_free_limit, total_paid_limit, total_one_time_paid_limit,
                    free_end, paid_end, one_time_paid_end,
                    version, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1, $11, $11)
                ON CONFLICT (user_id) DO NOTHING
                "#,
            )
            .bind(commit.user_id.as_str())
            .bind(b.free.balance)
            .bind(b.paid.balance)
            .bind(b.one_time.balance)
            .bind(b.free.limit)
            .bind(b.paid.limit)
            .bind(b.one_time.limit)
            .bind(b.free.expires_at)
            .bind(b.paid.expires_at)
            .bind(b.one_time.expires_at)
            .bind(commit.at)
            .execute(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE credit_balances
                SET balance_free = $3,
                    balance_paid = $4,
                    balance_one_time_paid = $5,
                    total_free_limit = $6,
                    total_paid_limit = $7,
                    total_one_time_paid_limit = $8,
                    free_end = $9,
                    paid_end = $10,
                    one_time_paid_end = $11,
                    version = version + 1,
                    updated_at = $12
                WHERE user_id = $1 AND version = $2
                "#,
            )
            .bind(commit.user_id.as_str())
            .bind(commit.expected_version)
            .bind(b.free.balance)
            .bind(b.paid.balance)
            .bind(b.one_time.balance)
            .bind(b.free.limit)
            .bind(b.paid.limit)
            .bind(b.one_time.limit)
            .bind(b.free.expires_at)
            .bind(b.paid.expires_at)
            .bind(b.one_time.expires_at)
            .bind(commit.at)
            .execute(&mut **tx)
            .await?
        };

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_subscription(
        tx: &mut Transaction<'_, Postgres>,
        sub: &Subscription,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_subscriptions (
                user_id, status, price_id, price_name,
                stripe_subscription_id, stripe_customer_id,
                sub_period_start, sub_period_end, last_event_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO UPDATE SET
                status = EXCLUDED.status,
                price_id = EXCLUDED.price_id,
                price_name = EXCLUDED.price_name,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                sub_period_start = EXCLUDED.sub_period_start,
                sub_period_end = EXCLUDED.sub_period_end,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(sub.user_id.as_str())
        .bind(sub.status.as_str())
        .bind(&sub.price_id)
        .bind(&sub.price_name)
        .bind(&sub.stripe_subscription_id)
        .bind(&sub.stripe_customer_id)
        .bind(sub.period_start)
        .bind(sub.period_end)
        .bind(sub.last_event_at)
        .bind(sub.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    user_id: String,
    balance_free: i64,
    balance_paid: i64,
    balance_one_time_paid: i64,
    total_free_limit: i64,
    total_paid_limit: i64,
    total_one_time_paid_limit: i64,
    free_end: Option<OffsetDateTime>,
    paid_end: Option<OffsetDateTime>,
    one_time_paid_end: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            user_id: UserId::new(row.user_id),
            free: Bucket {
                balance: row.balance_free,
                limit: row.total_free_limit,
                expires_at: row.free_end,
            },
            paid: Bucket {
                balance: row.balance_paid,
                limit: row.total_paid_limit,
                expires_at: row.paid_end,
            },
            one_time: Bucket {
                balance: row.balance_one_time_paid,
                limit: row.total_one_time_paid_limit,
                expires_at: row.one_time_paid_end,
            },
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    user_id: String,
    status: String,
    price_id: Option<String>,
    price_name: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    sub_period_start: Option<OffsetDateTime>,
    sub_period_end: Option<OffsetDateTime>,
    last_event_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Database(format!("unknown subscription status '{}'", row.status))
        })?;

        Ok(Subscription {
            user_id: UserId::new(row.user_id),
            status,
            price_id: row.price_id,
            price_name: row.price_name,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_customer_id: row.stripe_customer_id,
            period_start: row.sub_period_start,
            period_end: row.sub_period_end,
            last_event_at: row.last_event_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: String,
    bucket: String,
    amount: i64,
    reason: String,
    source_event_id: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let bucket = BucketKind::parse(&row.bucket).ok_or_else(|| {
            BillingError::Database(format!("unknown bucket kind '{}'", row.bucket))
        })?;

        Ok(CreditTransaction {
            id: row.id,
            user_id: UserId::new(row.user_id),
            bucket,
            amount: row.amount,
            reason: row.reason,
            source_event_id: row.source_event_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProcessedEventRow {
    event_id: String,
    event_type: String,
    user_id: Option<String>,
    outcome: String,
    processed_at: OffsetDateTime,
}

impl From<ProcessedEventRow> for ProcessedWebhookEvent {
    fn from(row: ProcessedEventRow) -> Self {
        ProcessedWebhookEvent {
            event_id: row.event_id,
            event_type: row.event_type,
            user_id: row.user_id.map(UserId::new),
            outcome: row.outcome,
            processed_at: row.processed_at,
        }
    }
}

const BALANCE_COLUMNS: &str = "user_id, balance_free, balance_paid, balance_one_time_paid, \
     total_free_limit, total_paid_limit, total_one_time_paid_limit, \
     free_end, paid_end, one_time_paid_end, version, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "user_id, status, price_id, price_name, \
     stripe_subscription_id, stripe_customer_id, sub_period_start, sub_period_end, \
     last_event_at, updated_at";

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn load_account(&self, user_id: &UserId) -> BillingResult<AccountSnapshot> {
        let balance: Option<BalanceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM credit_balances WHERE user_id = $1",
            BALANCE_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let subscription = self.load_subscription(user_id).await?;

        Ok(AccountSnapshot {
            balance: balance.map(Balance::from),
            subscription,
        })
    }

    async fn load_subscription(&self, user_id: &UserId) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM credit_subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_user_by_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<UserId>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT user_id FROM credit_subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| UserId::new(id)))
    }

    async fn find_user_by_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<UserId>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM credit_subscriptions
            WHERE stripe_customer_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(stripe_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| UserId::new(id)))
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM processed_webhook_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.0)
    }

    async fn commit(&self, commit: LedgerCommit) -> BillingResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Claim the event first so a concurrent delivery of the same id blocks
        // on the primary key until this transaction resolves.
        if let Some(event) = &commit.processed_event {
            let claimed = sqlx::query(
                r#"
                INSERT INTO processed_webhook_events
                    (event_id, event_type, user_id, outcome, processed_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&event.event_id)
            .bind(&event.event_type)
            .bind(event.user_id.as_ref().map(|u| u.as_str()))
            .bind(&event.outcome)
            .bind(event.processed_at)
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(CommitOutcome::DuplicateEvent);
            }
        }

        if !Self::write_balance(&mut tx, &commit).await? {
            tx.rollback().await?;
            return Ok(CommitOutcome::VersionConflict);
        }

        if let Some(subscription) = &commit.subscription {
            Self::upsert_subscription(&mut tx, subscription).await?;
        }

        for entry in &commit.transactions {
            let inserted = sqlx::query(
                r#"
                INSERT INTO credit_transactions
                    (id, user_id, bucket, amount, reason, source_event_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT ON CONSTRAINT uq_credit_transactions_source DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(commit.user_id.as_str())
            .bind(entry.bucket.as_str())
            .bind(entry.amount)
            .bind(&entry.reason)
            .bind(&entry.source_event_id)
            .bind(commit.at)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(CommitOutcome::DuplicateSource);
            }
        }

        tx.commit().await?;

        Ok(CommitOutcome::Committed {
            version: commit.expected_version + 1,
        })
    }

    async fn record_event(&self, event: ProcessedWebhookEvent) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events
                (event_id, event_type, user_id, outcome, processed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.user_id.as_ref().map(|u| u.as_str()))
        .bind(&event.outcome)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: Option<i64>,
    ) -> BillingResult<Vec<CreditTransaction>> {
        // LIMIT NULL means no limit in Postgres
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, bucket, amount, reason, source_event_id, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditTransaction::try_from).collect()
    }

    async fn list_processed_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ProcessedWebhookEvent>> {
        let rows: Vec<ProcessedEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, user_id, outcome, processed_at
            FROM processed_webhook_events
            ORDER BY processed_at DESC, event_id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ProcessedWebhookEvent::from).collect())
    }

    async fn prune_processed_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list_user_ids(&self, limit: i64, offset: i64) -> BillingResult<Vec<UserId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM credit_balances ORDER BY user_id LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| UserId::new(id)).collect())
    }

    async fn list_users_with_expired_free(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<UserId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM credit_balances
            WHERE free_end IS NOT NULL AND free_end <= $1
            ORDER BY user_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| UserId::new(id)).collect())
    }
}
