// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Credit Ledger
//!
//! End-to-end scenarios through signed webhooks, the ledger engine and the
//! in-memory store:
//! - Spend order and all-or-nothing debits
//! - Concurrent debits on one balance
//! - Redelivered and out-of-order webhooks
//! - Cancellation, expiry and renewal of the subscription bucket
//! - Store failures in the middle of an event

use std::sync::Arc;

use serde_json::{json, Value};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

use crate::clock::{Clock, ManualClock};
use crate::config::{BillingConfig, PricePlan};
use crate::error::BillingError;
use crate::ledger::{CreditGrant, CreditMode, CreditRequest};
use crate::memory::MemoryLedgerStore;
use crate::models::{reason, BucketKind, SubscriptionStatus, UserId};
use crate::store::LedgerStore;
use crate::webhooks::{signature_header, WebhookOutcome};
use crate::BillingService;

const SECRET: &str = "whsec_edge";
const NOW: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

struct Harness {
    service: BillingService,
    store: MemoryLedgerStore,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let store = MemoryLedgerStore::new();
    let clock = Arc::new(ManualClock::new(NOW));
    let config = BillingConfig {
        webhook_secret: SECRET.to_string(),
        prices: vec![
            PricePlan::parse("price_pro:Pro:100:subscription").unwrap(),
            PricePlan::parse("price_pack:Pack:50:one_time").unwrap(),
        ],
        ..BillingConfig::default()
    };
    let service = BillingService::new(config, Arc::new(store.clone()), clock.clone());
    Harness {
        service,
        store,
        clock,
    }
}

fn user() -> UserId {
    UserId::new("user_1")
}

fn envelope(id: &str, event_type: &str, created: OffsetDateTime, object: Value) -> String {
    json!({
        "id": id,
        "type": event_type,
        "created": created.unix_timestamp(),
        "data": { "object": object }
    })
    .to_string()
}

fn checkout(id: &str, created: OffsetDateTime, start: OffsetDateTime, end: OffsetDateTime) -> String {
    envelope(
        id,
        "checkout.session.completed",
        created,
        json!({
            "id": "cs_1",
            "mode": "subscription",
            "client_reference_id": "user_1",
            "customer": "cus_1",
            "subscription": {
                "id": "sub_1",
                "status": "active",
                "current_period_start": start.unix_timestamp(),
                "current_period_end": end.unix_timestamp(),
                "items": { "data": [ { "price": { "id": "price_pro" } } ] }
            }
        }),
    )
}

fn invoice(
    id: &str,
    event_type: &str,
    created: OffsetDateTime,
    billing_reason: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> String {
    envelope(
        id,
        event_type,
        created,
        json!({
            "id": format!("in_{}", id),
            "customer": "cus_1",
            "subscription": "sub_1",
            "billing_reason": billing_reason,
            "lines": { "data": [ {
                "price": { "id": "price_pro" },
                "period": { "start": start.unix_timestamp(), "end": end.unix_timestamp() }
            } ] }
        }),
    )
}

fn subscription_event(id: &str, event_type: &str, created: OffsetDateTime, status: &str) -> String {
    envelope(
        id,
        event_type,
        created,
        json!({ "id": "sub_1", "status": status, "customer": "cus_1" }),
    )
}

fn pack_purchase(id: &str) -> String {
    envelope(
        id,
        "checkout.session.completed",
        NOW,
        json!({
            "id": "cs_pack",
            "mode": "payment",
            "payment_status": "paid",
            "client_reference_id": "user_1",
            "metadata": { "price_id": "price_pack" }
        }),
    )
}

impl Harness {
    async fn deliver(&self, payload: &str) -> Result<WebhookOutcome, BillingError> {
        let header = signature_header(SECRET, self.clock.now().unix_timestamp(), payload).unwrap();
        let event = self.service.webhooks.verify_event(payload, &header)?;
        self.service.webhooks.handle_event(event).await
    }

    async fn subscribe(&self) {
        let outcome = self
            .deliver(&checkout("evt_checkout", NOW, NOW, NOW + Duration::days(30)))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
    }

    async fn paid_balance(&self) -> i64 {
        self.service
            .ledger
            .effective_balance(&user())
            .await
            .unwrap()
            .subscription
    }

    async fn assert_healthy(&self) {
        let summary = self.service.invariants.run_all_checks().await.unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
    }
}

// =========================================================================
// Spend order: subscription -> one-time -> free with a live subscription
// =========================================================================
#[tokio::test]
async fn test_spend_order_with_live_subscription() {
    let h = harness();
    h.service.ledger.open_account(&user()).await.unwrap();
    h.subscribe().await;
    h.deliver(&pack_purchase("evt_pack")).await.unwrap();

    let receipt = h.service.ledger.debit(&user(), 120, "usage").await.unwrap();
    assert_eq!(receipt.drawn.len(), 2);
    assert_eq!(receipt.drawn[0].bucket, BucketKind::Subscription);
    assert_eq!(receipt.drawn[0].amount, 100);
    assert_eq!(receipt.drawn[1].bucket, BucketKind::OneTime);
    assert_eq!(receipt.drawn[1].amount, 20);

    let balance = h.service.ledger.effective_balance(&user()).await.unwrap();
    assert_eq!((balance.subscription, balance.one_time, balance.free), (0, 30, 10));
    h.assert_healthy().await;
}

// =========================================================================
// Debits are all-or-nothing
// =========================================================================
#[tokio::test]
async fn test_insufficient_debit_changes_nothing() {
    let h = harness();
    h.service.ledger.open_account(&user()).await.unwrap();
    let rows_before = h.store.transaction_count().await;

    let err = h.service.ledger.debit(&user(), 11, "usage").await.unwrap_err();
    assert!(matches!(
        err,
        BillingError::InsufficientCredits {
            requested: 11,
            available: 10
        }
    ));

    assert_eq!(
        h.service.ledger.effective_balance(&user()).await.unwrap().free,
        10
    );
    assert_eq!(h.store.transaction_count().await, rows_before);
}

// =========================================================================
// Two concurrent debits of 4 against a balance of 5: exactly one succeeds
// =========================================================================
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_debits_never_overdraw() {
    use tokio::sync::Barrier;

    let h = harness();
    h.service
        .ledger
        .credit(CreditRequest {
            user_id: user(),
            grant: CreditGrant {
                bucket: BucketKind::OneTime,
                amount: 5,
                limit: 5,
                expires_at: None,
                mode: CreditMode::TopUp,
                reason: reason::ONE_TIME_PURCHASE.to_string(),
                source_event_id: Some("seed".to_string()),
            },
        })
        .await
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = vec![];
    for _ in 0..2 {
        let ledger = Arc::clone(&h.service.ledger);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            ledger.debit(&user(), 4, "usage").await
        }));
    }

    let mut succeeded = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(BillingError::InsufficientCredits { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(succeeded, 1, "Exactly one debit should succeed");
    assert_eq!(refused, 1, "The other debit should be refused");
    assert_eq!(
        h.service.ledger.effective_balance(&user()).await.unwrap().total,
        1
    );
    h.assert_healthy().await;
}

// =========================================================================
// A redelivered event is acknowledged without a second ledger row
// =========================================================================
#[tokio::test]
async fn test_redelivered_purchase_credits_once() {
    let h = harness();
    let payload = pack_purchase("evt_pack");

    assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Processed);
    assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Duplicate);

    assert_eq!(h.store.transaction_count().await, 1);
    assert_eq!(
        h.service.ledger.effective_balance(&user()).await.unwrap().one_time,
        50
    );
}

// =========================================================================
// Checkout then the first invoice for the same period: granted once
// =========================================================================
#[tokio::test]
async fn test_checkout_and_initial_invoice_grant_once() {
    let h = harness();
    h.subscribe().await;
    assert_eq!(h.paid_balance().await, 100);

    let end = NOW + Duration::days(30);
    let first = invoice("evt_inv_1", "invoice.paid", NOW, "subscription_create", NOW, end);
    assert_eq!(h.deliver(&first).await.unwrap(), WebhookOutcome::Ignored);

    // Same period delivered as a cycle invoice under another event type
    let again = invoice(
        "evt_inv_2",
        "invoice.payment_succeeded",
        NOW,
        "subscription_cycle",
        NOW,
        end,
    );
    assert_eq!(h.deliver(&again).await.unwrap(), WebhookOutcome::Ignored);

    assert_eq!(h.paid_balance().await, 100);
    assert_eq!(h.store.transaction_count().await, 1);
    h.assert_healthy().await;
}

// =========================================================================
// Renewal replaces the unused remainder with a fresh allotment
// =========================================================================
#[tokio::test]
async fn test_renewal_resets_paid_bucket() {
    let h = harness();
    h.subscribe().await;
    h.service.ledger.debit(&user(), 60, "usage").await.unwrap();

    let start = NOW + Duration::days(30);
    let end = NOW + Duration::days(60);
    h.clock.set(start + Duration::hours(1));

    let renewal = invoice(
        "evt_renew",
        "invoice.paid",
        start + Duration::hours(1),
        "subscription_cycle",
        start,
        end,
    );
    assert_eq!(h.deliver(&renewal).await.unwrap(), WebhookOutcome::Processed);
    assert_eq!(h.paid_balance().await, 100);

    let summary = h
        .service
        .ledger
        .get_user_credit_summary(&user())
        .await
        .unwrap();
    assert_eq!(summary.subscription.as_ref().unwrap().period_end, Some(end));
    assert_eq!(
        summary.bucket(BucketKind::Subscription).unwrap().expires_at,
        Some(end)
    );
    h.assert_healthy().await;
}

// =========================================================================
// Cancellation keeps paid credits until the period ends
// =========================================================================
#[tokio::test]
async fn test_canceled_subscription_keeps_credits_until_period_end() {
    let h = harness();
    h.subscribe().await;
    h.service.ledger.debit(&user(), 60, "usage").await.unwrap();

    h.clock.advance(Duration::days(5));
    let canceled = subscription_event(
        "evt_cancel",
        "customer.subscription.deleted",
        NOW + Duration::days(5),
        "canceled",
    );
    assert_eq!(h.deliver(&canceled).await.unwrap(), WebhookOutcome::Processed);
    assert_eq!(h.paid_balance().await, 40);

    // still spendable while the period runs
    h.service.ledger.debit(&user(), 10, "usage").await.unwrap();
    assert_eq!(h.paid_balance().await, 30);

    h.clock.set(NOW + Duration::days(30));
    assert_eq!(h.paid_balance().await, 0);

    let summary = h
        .service
        .ledger
        .get_user_credit_summary(&user())
        .await
        .unwrap();
    assert_eq!(
        summary.subscription.map(|s| s.status),
        Some(SubscriptionStatus::Expired)
    );

    let err = h.service.ledger.debit(&user(), 1, "usage").await.unwrap_err();
    assert!(matches!(err, BillingError::InsufficientCredits { available: 0, .. }));
    h.assert_healthy().await;
}

// =========================================================================
// A cancellation delivered before its checkout still wins
// =========================================================================
#[tokio::test]
async fn test_cancellation_before_checkout_stays_canceled() {
    let h = harness();
    let deleted = envelope(
        "evt_deleted",
        "customer.subscription.deleted",
        NOW + Duration::seconds(10),
        json!({
            "id": "sub_1",
            "status": "canceled",
            "customer": "cus_1",
            "metadata": { "user_id": "user_1" }
        }),
    );
    assert_eq!(h.deliver(&deleted).await.unwrap(), WebhookOutcome::Processed);

    let late_checkout = checkout("evt_checkout", NOW, NOW, NOW + Duration::days(30));
    assert_eq!(h.deliver(&late_checkout).await.unwrap(), WebhookOutcome::Processed);

    let sub = h.store.load_subscription(&user()).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
    assert_eq!(sub.period_end, Some(NOW + Duration::days(30)));

    // the paid period still runs out normally
    assert_eq!(h.paid_balance().await, 100);
    h.clock.set(NOW + Duration::days(30));
    assert_eq!(h.paid_balance().await, 0);
    h.assert_healthy().await;
}

// =========================================================================
// Payment failures for a subscription not seen yet are retried by the sender
// =========================================================================
#[tokio::test]
async fn test_status_signal_before_checkout_is_not_recorded() {
    let h = harness();
    h.deliver(&pack_purchase("evt_pack")).await.unwrap();
    let failed = envelope(
        "evt_failed",
        "invoice.payment_failed",
        NOW,
        json!({
            "id": "in_failed",
            "customer": "cus_1",
            "subscription": "sub_1",
            "billing_reason": "subscription_cycle"
        }),
    );

    assert!(matches!(
        h.deliver(&failed).await,
        Err(BillingError::NotFound(_))
    ));
    assert!(!h.store.is_event_processed("evt_failed").await.unwrap());
}

// =========================================================================
// A stale checkout does not roll back a newer period
// =========================================================================
#[tokio::test]
async fn test_stale_checkout_keeps_newer_period() {
    let h = harness();
    let newer_end = NOW + Duration::days(60);
    let updated = envelope(
        "evt_updated",
        "customer.subscription.updated",
        NOW + Duration::minutes(5),
        json!({
            "id": "sub_1",
            "status": "active",
            "customer": "cus_1",
            "metadata": { "user_id": "user_1" },
            "current_period_start": (NOW + Duration::days(30)).unix_timestamp(),
            "current_period_end": newer_end.unix_timestamp(),
            "items": { "data": [ { "price": { "id": "price_pro" } } ] }
        }),
    );
    assert_eq!(h.deliver(&updated).await.unwrap(), WebhookOutcome::Processed);

    h.subscribe().await;

    let sub = h.store.load_subscription(&user()).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.period_end, Some(newer_end));
    assert_eq!(sub.last_event_at, Some(NOW + Duration::minutes(5)));
}

// =========================================================================
// Accounts created by a webhook still get the signup allotment
// =========================================================================
#[tokio::test]
async fn test_open_account_after_checkout_grants_free_allotment() {
    let h = harness();
    h.subscribe().await;

    let opened = h.service.ledger.open_account(&user()).await.unwrap();
    assert!(opened.is_applied());

    let balance = h.service.ledger.effective_balance(&user()).await.unwrap();
    assert_eq!((balance.subscription, balance.free), (100, 10));
    assert!(!h.service.ledger.open_account(&user()).await.unwrap().is_applied());

    h.clock.advance(Duration::days(31));
    let due = h
        .store
        .list_users_with_expired_free(h.clock.now(), 10)
        .await
        .unwrap();
    assert_eq!(due, vec![user()]);
    h.assert_healthy().await;
}

// =========================================================================
// Expired buckets read as zero without writing
// =========================================================================
#[tokio::test]
async fn test_expired_one_time_credits_read_as_zero() {
    let h = harness();
    h.deliver(&pack_purchase("evt_pack")).await.unwrap();
    let rows = h.store.transaction_count().await;

    h.clock.advance(Duration::days(366));
    let balance = h.service.ledger.effective_balance(&user()).await.unwrap();
    assert_eq!(balance.one_time, 0);
    assert_eq!(h.store.transaction_count().await, rows);

    // next committed mutation writes the expiry
    h.service.ledger.refresh_free_allotment(&user()).await.unwrap();
    let history = h.service.ledger.usage_history(&user(), 10).await.unwrap();
    assert!(history
        .iter()
        .any(|tx| tx.reason == reason::EXPIRED && tx.amount == -50));
    h.assert_healthy().await;
}

// =========================================================================
// A store failure mid-event leaves no trace; the redelivery applies it
// =========================================================================
#[tokio::test]
async fn test_failed_commit_is_retried_by_redelivery() {
    let h = harness();
    let payload = checkout("evt_checkout", NOW, NOW, NOW + Duration::days(30));

    h.store.inject_failure(1);
    let err = h.deliver(&payload).await.unwrap_err();
    assert!(err.is_retryable());

    assert!(matches!(
        h.service.ledger.effective_balance(&user()).await,
        Err(BillingError::AccountNotFound(_))
    ));
    assert!(!h
        .service
        .ledger
        .store()
        .is_event_processed("evt_checkout")
        .await
        .unwrap());

    assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Processed);
    assert_eq!(h.paid_balance().await, 100);
    assert_eq!(h.store.transaction_count().await, 1);
}

// =========================================================================
// An older status event arriving late does not override a newer one
// =========================================================================
#[tokio::test]
async fn test_stale_status_event_is_ignored() {
    let h = harness();
    h.subscribe().await;
    h.clock.advance(Duration::hours(3));

    let newer = subscription_event(
        "evt_newer",
        "customer.subscription.updated",
        NOW + Duration::hours(2),
        "past_due",
    );
    let older = subscription_event(
        "evt_older",
        "customer.subscription.updated",
        NOW + Duration::hours(1),
        "active",
    );

    assert_eq!(h.deliver(&newer).await.unwrap(), WebhookOutcome::Processed);
    assert_eq!(h.deliver(&older).await.unwrap(), WebhookOutcome::Ignored);

    let sub = h
        .service
        .ledger
        .store()
        .load_subscription(&user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::PastDue);

    let recorded = h.service.webhooks.list_processed(10, 0).await.unwrap();
    let stale = recorded.iter().find(|e| e.event_id == "evt_older").unwrap();
    assert_eq!(stale.outcome, "stale");
}

// =========================================================================
// Past due is cured by the next paid invoice
// =========================================================================
#[tokio::test]
async fn test_past_due_cured_by_paid_invoice() {
    let h = harness();
    h.subscribe().await;

    let failed_at = NOW + Duration::days(29);
    h.clock.set(failed_at);
    let failed = invoice(
        "evt_failed",
        "invoice.payment_failed",
        failed_at,
        "subscription_cycle",
        NOW + Duration::days(30),
        NOW + Duration::days(60),
    );
    assert_eq!(h.deliver(&failed).await.unwrap(), WebhookOutcome::Processed);

    // past due still spends the subscription bucket
    h.service.ledger.debit(&user(), 5, "usage").await.unwrap();
    assert_eq!(h.paid_balance().await, 95);

    let paid_at = NOW + Duration::days(30) + Duration::hours(1);
    h.clock.set(paid_at);
    let paid = invoice(
        "evt_paid",
        "invoice.paid",
        paid_at,
        "subscription_cycle",
        NOW + Duration::days(30),
        NOW + Duration::days(60),
    );
    assert_eq!(h.deliver(&paid).await.unwrap(), WebhookOutcome::Processed);

    let summary = h
        .service
        .ledger
        .get_user_credit_summary(&user())
        .await
        .unwrap();
    assert_eq!(
        summary.subscription.map(|s| s.status),
        Some(SubscriptionStatus::Active)
    );
    assert_eq!(h.paid_balance().await, 100);
    h.assert_healthy().await;
}

// =========================================================================
// Invoices for an unknown subscription are left for the sender to retry
// =========================================================================
#[tokio::test]
async fn test_invoice_for_unknown_subscription_is_not_recorded() {
    let h = harness();
    let orphan = invoice(
        "evt_orphan",
        "invoice.paid",
        NOW,
        "subscription_cycle",
        NOW,
        NOW + Duration::days(30),
    );

    assert!(matches!(
        h.deliver(&orphan).await,
        Err(BillingError::NotFound(_))
    ));
    assert!(!h
        .service
        .ledger
        .store()
        .is_event_processed("evt_orphan")
        .await
        .unwrap());
}

// =========================================================================
// Unrecognized event types are acknowledged once
// =========================================================================
#[tokio::test]
async fn test_unrecognized_event_is_recorded_as_ignored() {
    let h = harness();
    let payload = envelope("evt_other", "customer.created", NOW, json!({ "id": "cus_9" }));

    assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Ignored);
    assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Duplicate);
}

// =========================================================================
// Bad signatures are rejected before anything is parsed
// =========================================================================
#[tokio::test]
async fn test_bad_signature_rejected() {
    let h = harness();
    let payload = pack_purchase("evt_pack");
    let header = signature_header("whsec_wrong", NOW.unix_timestamp(), &payload).unwrap();

    assert!(matches!(
        h.service.webhooks.verify_event(&payload, &header),
        Err(BillingError::InvalidSignature)
    ));
    assert_eq!(h.store.transaction_count().await, 0);
}
