//! Stripe webhook handling
//!
//! Turns a signed Stripe event into exactly one ledger effect. The dedup
//! registry row for the event is written in the same commit as the balance
//! and subscription changes it causes, and every credit carries the event id
//! as its source, so a redelivery or a replay after a partial failure is a
//! no-op.
//!
//! Out-of-order delivery: a subscription remembers the `created` time of the
//! last event that changed its status. Older status-changing events are
//! recorded with outcome `stale` and have no effect. Paid-bucket rollover is
//! gated on the invoice period ending after the current paid expiry, which
//! does not depend on arrival order.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};

use crate::client::StripeClient;
use crate::config::{PriceKind, PricePlan};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    map_stripe_status, BillingEvent, BillingPeriod, CheckoutCompleted, InvoiceNotice,
    OneTimePurchase, ParsedEvent, SubscriptionNotice,
};
use crate::ledger::{
    apply_credit, one_time_grant, CreditGrant, CreditMode, Decision, EventContext, LedgerEngine,
    LedgerState, Mutation, Plan,
};
use crate::models::{
    reason, BucketKind, ProcessedWebhookEvent, Subscription, SubscriptionStatus, UserId,
};
use crate::subscription::{transition, SubscriptionSignal, Transition};

type HmacSha256 = Hmac<Sha256>;

/// What happened to a delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Ledger or subscription state changed
    Processed,
    /// Recorded as processed without any state change
    Ignored,
    /// Already recorded by an earlier delivery
    Duplicate,
}

/// Result of an admin replay
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub event_id: String,
    pub event_type: String,
    pub previously_processed: bool,
    pub outcome: WebhookOutcome,
}

/// Hex HMAC-SHA256 over `"{timestamp}.{payload}"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `Stripe-Signature` header value for a payload, as Stripe would send it
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)?
    ))
}

/// Check a `Stripe-Signature` header against the raw payload.
///
/// Accepts the header if any `v1` entry matches and the timestamp is within
/// `tolerance_secs` of `now`.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::InvalidSignature
    })?;
    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::InvalidSignature);
    }

    let age = (now.unix_timestamp() - timestamp).abs();
    if age > tolerance_secs {
        tracing::warn!(
            timestamp = timestamp,
            now = now.unix_timestamp(),
            age = age,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::InvalidSignature);
    }

    let expected = compute_signature(secret, timestamp, payload)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::InvalidSignature);
    }

    Ok(())
}

fn is_stale(subscription: &Subscription, created: OffsetDateTime) -> bool {
    subscription
        .last_event_at
        .is_some_and(|last| created < last)
}

/// Whether the paid bucket already holds a grant for `period`
fn paid_covers(state: &LedgerState, period: &BillingPeriod) -> bool {
    state
        .balance
        .paid
        .expires_at
        .is_some_and(|end| end >= period.end)
}

fn same_subscription(subscription: &Subscription, stripe_subscription_id: Option<&str>) -> bool {
    match (subscription.stripe_subscription_id.as_deref(), stripe_subscription_id) {
        (Some(stored), Some(incoming)) => stored == incoming,
        _ => true,
    }
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    ledger: Arc<LedgerEngine>,
    stripe: Option<StripeClient>,
}

impl WebhookHandler {
    pub fn new(ledger: Arc<LedgerEngine>, stripe: Option<StripeClient>) -> Self {
        Self { ledger, stripe }
    }

    /// Verify the signature and parse the event. Nothing is written.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<ParsedEvent> {
        let config = self.ledger.config();
        verify_signature(
            payload,
            signature,
            &config.webhook_secret,
            config.signature_tolerance_secs,
            self.ledger.now(),
        )?;

        let event = ParsedEvent::from_json(payload).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse webhook event JSON");
            e
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook signature verified"
        );
        Ok(event)
    }

    /// Apply a verified event at most once
    pub async fn handle_event(&self, event: ParsedEvent) -> BillingResult<WebhookOutcome> {
        let store = self.ledger.store();
        if store.is_event_processed(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let ctx = EventContext {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
        };

        let result = self.process_event_internal(&event, &ctx).await;

        match &result {
            Ok(outcome) => tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                outcome = ?outcome,
                "Webhook event handled"
            ),
            Err(e) if e.is_retryable() => tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook event failed, sender will retry"
            ),
            Err(e) => tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook event failed"
            ),
        }

        result
    }

    async fn process_event_internal(
        &self,
        event: &ParsedEvent,
        ctx: &EventContext,
    ) -> BillingResult<WebhookOutcome> {
        match &event.event {
            BillingEvent::SubscriptionCheckoutCompleted(checkout) => {
                self.handle_subscription_checkout(event, ctx, checkout).await
            }
            BillingEvent::OneTimePurchaseCompleted(purchase) => {
                self.handle_one_time_purchase(ctx, purchase).await
            }
            BillingEvent::InvoicePaid(invoice) => {
                self.handle_invoice_paid(event, ctx, invoice).await
            }
            BillingEvent::InvoicePaymentFailed(invoice) => {
                self.handle_invoice_payment_failed(event, ctx, invoice).await
            }
            BillingEvent::SubscriptionUpdated(notice) => {
                self.handle_subscription_updated(event, ctx, notice).await
            }
            BillingEvent::SubscriptionDeleted(notice) => {
                self.handle_subscription_deleted(event, ctx, notice).await
            }
            BillingEvent::Unrecognized { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event type");
                self.record_without_effect(ctx, None, "unhandled").await
            }
        }
    }

    async fn record_without_effect(
        &self,
        ctx: &EventContext,
        user_id: Option<UserId>,
        outcome: &str,
    ) -> BillingResult<WebhookOutcome> {
        let inserted = self
            .ledger
            .store()
            .record_event(ProcessedWebhookEvent {
                event_id: ctx.event_id.clone(),
                event_type: ctx.event_type.clone(),
                user_id,
                outcome: outcome.to_string(),
                processed_at: self.ledger.now(),
            })
            .await?;

        Ok(if inserted {
            WebhookOutcome::Ignored
        } else {
            WebhookOutcome::Duplicate
        })
    }

    async fn resolve_user(
        &self,
        direct: Option<&UserId>,
        stripe_subscription_id: Option<&str>,
        stripe_customer_id: Option<&str>,
    ) -> BillingResult<Option<UserId>> {
        if let Some(user_id) = direct {
            return Ok(Some(user_id.clone()));
        }

        let store = self.ledger.store();
        if let Some(sub_id) = stripe_subscription_id {
            if let Some(user_id) = store.find_user_by_subscription(sub_id).await? {
                return Ok(Some(user_id));
            }
        }
        if let Some(customer_id) = stripe_customer_id {
            if let Some(user_id) = store.find_user_by_customer(customer_id).await? {
                return Ok(Some(user_id));
            }
        }
        Ok(None)
    }

    /// Resolve the owner of a subscription-scoped event. Unknown owners are
    /// reported as `NotFound` so the sender retries after the checkout lands.
    async fn require_user(
        &self,
        direct: Option<&UserId>,
        stripe_subscription_id: Option<&str>,
        stripe_customer_id: Option<&str>,
    ) -> BillingResult<UserId> {
        self.resolve_user(direct, stripe_subscription_id, stripe_customer_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "no user for subscription {:?} / customer {:?}",
                    stripe_subscription_id, stripe_customer_id
                ))
            })
    }

    fn plan_for(&self, price_id: Option<&str>, kind: PriceKind) -> BillingResult<&PricePlan> {
        let price_id = price_id.ok_or_else(|| {
            BillingError::MalformedEvent("event does not reference a price".to_string())
        })?;

        match self.ledger.config().price(price_id) {
            Some(plan) if plan.kind == kind => Ok(plan),
            Some(_) => Err(BillingError::Config(format!(
                "price {} is not a {:?} price",
                price_id, kind
            ))),
            None => Err(BillingError::Config(format!(
                "price {} is not in the credit catalog",
                price_id
            ))),
        }
    }

    fn outcome_of<T>(mutation: Mutation<T>) -> WebhookOutcome {
        match mutation {
            Mutation::Applied(_) => WebhookOutcome::Processed,
            Mutation::Unchanged(_) => WebhookOutcome::Ignored,
            Mutation::AlreadyApplied => WebhookOutcome::Duplicate,
        }
    }

    async fn handle_subscription_checkout(
        &self,
        event: &ParsedEvent,
        ctx: &EventContext,
        checkout: &CheckoutCompleted,
    ) -> BillingResult<WebhookOutcome> {
        let user_id = match self
            .resolve_user(
                checkout.user_id.as_ref(),
                checkout.subscription_id.as_deref(),
                checkout.customer_id.as_deref(),
            )
            .await?
        {
            Some(user_id) => user_id,
            None => {
                tracing::error!(
                    session_id = %checkout.session_id,
                    "Checkout session carries no user reference"
                );
                return self.record_without_effect(ctx, None, "no_user").await;
            }
        };

        let plan = self.plan_for(checkout.price_id.as_deref(), PriceKind::Subscription)?;
        let period = checkout.period.unwrap_or(BillingPeriod {
            start: event.created,
            end: event.created + Duration::days(self.ledger.config().default_period_days),
        });
        let created = event.created;

        let mutation = self
            .ledger
            .mutate(&user_id, true, Some(ctx), |state, now| {
                let existing = state.subscription.clone();
                let current = existing
                    .as_ref()
                    .map(|s| s.status)
                    .unwrap_or(SubscriptionStatus::None);

                let stale = existing.as_ref().is_some_and(|s| is_stale(s, created));
                let status = if stale {
                    current
                } else {
                    transition(current, SubscriptionSignal::CheckoutCompleted).resulting_status()
                };

                let already_granted = existing.as_ref().is_some_and(|s| {
                    s.stripe_subscription_id.is_some()
                        && s.stripe_subscription_id == checkout.subscription_id
                }) && paid_covers(state, &period);

                let last_event_at = match existing.as_ref().and_then(|s| s.last_event_at) {
                    Some(last) if last > created => Some(last),
                    _ => Some(created),
                };

                // A newer event already wrote this row; only fill in what it left empty
                let newer = existing.as_ref().filter(|_| stale);
                state.subscription = Some(Subscription {
                    user_id: state.balance.user_id.clone(),
                    status,
                    price_id: newer
                        .and_then(|s| s.price_id.clone())
                        .or_else(|| Some(plan.price_id.clone())),
                    price_name: newer
                        .and_then(|s| s.price_name.clone())
                        .or_else(|| Some(plan.name.clone())),
                    stripe_subscription_id: newer
                        .and_then(|s| s.stripe_subscription_id.clone())
                        .or_else(|| checkout.subscription_id.clone()),
                    stripe_customer_id: newer
                        .and_then(|s| s.stripe_customer_id.clone())
                        .or_else(|| checkout.customer_id.clone()),
                    period_start: newer.and_then(|s| s.period_start).or(Some(period.start)),
                    period_end: newer.and_then(|s| s.period_end).or(Some(period.end)),
                    last_event_at,
                    updated_at: now,
                });

                let mut out = Plan::new(());
                out.subscription_changed = true;
                if already_granted {
                    out.outcome = "already_granted";
                } else {
                    out.transactions.push(apply_credit(
                        &mut state.balance,
                        &CreditGrant {
                            bucket: BucketKind::Subscription,
                            amount: plan.credits,
                            limit: plan.credits,
                            expires_at: Some(period.end),
                            mode: CreditMode::Replace,
                            reason: reason::SUBSCRIPTION_GRANT.to_string(),
                            source_event_id: Some(ctx.event_id.clone()),
                        },
                    )?);
                }
                Ok(Decision::Apply(out))
            })
            .await?;

        if mutation.is_applied() {
            tracing::info!(
                user_id = %user_id,
                price_id = %plan.price_id,
                credits = plan.credits,
                period_end = %period.end,
                "Subscription checkout applied"
            );
        }
        Ok(Self::outcome_of(mutation))
    }

    async fn handle_one_time_purchase(
        &self,
        ctx: &EventContext,
        purchase: &OneTimePurchase,
    ) -> BillingResult<WebhookOutcome> {
        let user_id = match self
            .resolve_user(
                purchase.user_id.as_ref(),
                None,
                purchase.customer_id.as_deref(),
            )
            .await?
        {
            Some(user_id) => user_id,
            None => {
                tracing::error!(
                    session_id = %purchase.session_id,
                    "Checkout session carries no user reference"
                );
                return self.record_without_effect(ctx, None, "no_user").await;
            }
        };

        if !purchase.paid {
            tracing::info!(
                user_id = %user_id,
                session_id = %purchase.session_id,
                "One-time purchase awaiting payment"
            );
            return self
                .record_without_effect(ctx, Some(user_id), "awaiting_payment")
                .await;
        }

        let credits = match self.plan_for(purchase.price_id.as_deref(), PriceKind::OneTime) {
            Ok(plan) => plan.credits,
            Err(e) => match purchase.credits {
                Some(credits) if credits > 0 => credits,
                _ => return Err(e),
            },
        };
        let validity = Duration::days(self.ledger.config().one_time_validity_days);

        let mutation = self
            .ledger
            .mutate(&user_id, true, Some(ctx), |state, now| {
                let grant = one_time_grant(
                    &state.balance,
                    credits,
                    validity,
                    now,
                    Some(ctx.event_id.clone()),
                );
                let mut out = Plan::new(());
                out.transactions.push(apply_credit(&mut state.balance, &grant)?);
                Ok(Decision::Apply(out))
            })
            .await?;

        if mutation.is_applied() {
            tracing::info!(user_id = %user_id, credits = credits, "One-time purchase credited");
        }
        Ok(Self::outcome_of(mutation))
    }

    async fn handle_invoice_paid(
        &self,
        event: &ParsedEvent,
        ctx: &EventContext,
        invoice: &InvoiceNotice,
    ) -> BillingResult<WebhookOutcome> {
        if invoice.subscription_id.is_none() {
            return self.record_without_effect(ctx, None, "not_subscription").await;
        }

        let user_id = self
            .require_user(
                None,
                invoice.subscription_id.as_deref(),
                invoice.customer_id.as_deref(),
            )
            .await?;

        let stored = self.ledger.store().load_subscription(&user_id).await?;
        let price_id = invoice
            .price_id
            .clone()
            .or_else(|| stored.as_ref().and_then(|s| s.price_id.clone()));
        let plan = self.plan_for(price_id.as_deref(), PriceKind::Subscription)?;
        let created = event.created;

        let mutation = self
            .ledger
            .mutate(&user_id, true, Some(ctx), |state, now| {
                let Some(mut sub) = state.subscription.clone() else {
                    return Ok(Decision::Skip {
                        outcome: "no_subscription",
                        value: (),
                    });
                };
                if !same_subscription(&sub, invoice.subscription_id.as_deref()) {
                    return Ok(Decision::Skip {
                        outcome: "other_subscription",
                        value: (),
                    });
                }

                let step = transition(sub.status, SubscriptionSignal::PaymentSucceeded);
                if let Transition::Rejected { reason: why, .. } = step {
                    tracing::info!(user_id = %sub.user_id, reason = why, "Invoice paid ignored");
                    return Ok(Decision::Skip {
                        outcome: "rejected",
                        value: (),
                    });
                }

                let mut out = Plan::new(());
                let mut touched = false;

                if step.is_changed() && !is_stale(&sub, created) {
                    sub.status = step.resulting_status();
                    sub.last_event_at = Some(created);
                    touched = true;
                }

                if let Some(period) = invoice.period {
                    let renews = !invoice.is_initial() && !paid_covers(state, &period);
                    let paid = &state.balance.paid;
                    let realign = paid.limit > 0 && paid.expires_at.is_some_and(|end| end < period.end);

                    if renews {
                        out.transactions.push(apply_credit(
                            &mut state.balance,
                            &CreditGrant {
                                bucket: BucketKind::Subscription,
                                amount: plan.credits,
                                limit: plan.credits,
                                expires_at: Some(period.end),
                                mode: CreditMode::Replace,
                                reason: reason::SUBSCRIPTION_RENEWAL.to_string(),
                                source_event_id: Some(ctx.event_id.clone()),
                            },
                        )?);
                        sub.price_id = Some(plan.price_id.clone());
                        sub.price_name = Some(plan.name.clone());
                        out.outcome = "renewed";
                        touched = true;
                    } else if realign {
                        // First invoice of a cycle whose checkout only had a
                        // fallback period
                        state.balance.paid.expires_at = Some(period.end);
                        out.outcome = "period_aligned";
                        touched = true;
                    }

                    if !matches!(sub.period_end, Some(end) if end >= period.end) {
                        sub.period_start = Some(period.start);
                        sub.period_end = Some(period.end);
                        touched = true;
                    }
                }

                if !touched {
                    return Ok(Decision::Skip {
                        outcome: "already_current",
                        value: (),
                    });
                }

                sub.updated_at = now;
                state.subscription = Some(sub);
                out.subscription_changed = true;
                Ok(Decision::Apply(out))
            })
            .await?;

        if mutation.is_applied() {
            tracing::info!(
                user_id = %user_id,
                invoice_id = %invoice.invoice_id,
                "Invoice payment applied"
            );
        }
        Ok(Self::outcome_of(mutation))
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &ParsedEvent,
        ctx: &EventContext,
        invoice: &InvoiceNotice,
    ) -> BillingResult<WebhookOutcome> {
        if invoice.subscription_id.is_none() {
            return self.record_without_effect(ctx, None, "not_subscription").await;
        }

        let user_id = self
            .require_user(
                None,
                invoice.subscription_id.as_deref(),
                invoice.customer_id.as_deref(),
            )
            .await?;

        let mutation = self
            .apply_status_signal(
                &user_id,
                ctx,
                event.created,
                invoice.subscription_id.as_deref(),
                SubscriptionSignal::PaymentFailed,
            )
            .await?;

        if mutation.is_applied() {
            tracing::warn!(
                user_id = %user_id,
                invoice_id = %invoice.invoice_id,
                "Subscription payment failed, marked past due"
            );
        }
        Ok(Self::outcome_of(mutation))
    }

    async fn handle_subscription_updated(
        &self,
        event: &ParsedEvent,
        ctx: &EventContext,
        notice: &SubscriptionNotice,
    ) -> BillingResult<WebhookOutcome> {
        let user_id = self
            .require_user(
                notice.user_id.as_ref(),
                Some(&notice.subscription_id),
                notice.customer_id.as_deref(),
            )
            .await?;

        let Some(target) = map_stripe_status(&notice.status) else {
            tracing::debug!(status = %notice.status, "Subscription status has no ledger meaning");
            return self
                .record_without_effect(ctx, Some(user_id), "status_ignored")
                .await;
        };

        let created = event.created;
        let price = notice
            .price_id
            .as_deref()
            .and_then(|id| self.ledger.config().price(id));

        let mutation = self
            .ledger
            .mutate(&user_id, true, Some(ctx), |state, now| {
                let mut sub = state.subscription.clone().unwrap_or_else(|| Subscription {
                    user_id: state.balance.user_id.clone(),
                    status: SubscriptionStatus::None,
                    price_id: None,
                    price_name: None,
                    stripe_subscription_id: None,
                    stripe_customer_id: None,
                    period_start: None,
                    period_end: None,
                    last_event_at: None,
                    updated_at: now,
                });

                if !same_subscription(&sub, Some(&notice.subscription_id)) {
                    return Ok(Decision::Skip {
                        outcome: "other_subscription",
                        value: (),
                    });
                }
                if is_stale(&sub, created) {
                    return Ok(Decision::Skip {
                        outcome: "stale",
                        value: (),
                    });
                }

                let step = transition(sub.status, SubscriptionSignal::ProviderStatus(target));
                let mut out = Plan::new(());
                match step {
                    Transition::Rejected { reason: why, .. } => {
                        tracing::info!(user_id = %sub.user_id, reason = why, "Status update rejected");
                        return Ok(Decision::Skip {
                            outcome: "rejected",
                            value: (),
                        });
                    }
                    Transition::Changed { to, .. } => {
                        sub.status = to;
                        sub.last_event_at = Some(created);
                    }
                    Transition::Unchanged(_) => out.outcome = "synced",
                }

                sub.stripe_subscription_id = Some(notice.subscription_id.clone());
                if notice.customer_id.is_some() {
                    sub.stripe_customer_id = notice.customer_id.clone();
                }
                if let Some(plan) = price {
                    sub.price_id = Some(plan.price_id.clone());
                    sub.price_name = Some(plan.name.clone());
                }
                if let Some(period) = notice.period {
                    sub.period_start = Some(period.start);
                    sub.period_end = Some(period.end);
                }
                sub.updated_at = now;

                state.subscription = Some(sub);
                out.subscription_changed = true;
                Ok(Decision::Apply(out))
            })
            .await?;

        Ok(Self::outcome_of(mutation))
    }

    async fn handle_subscription_deleted(
        &self,
        event: &ParsedEvent,
        ctx: &EventContext,
        notice: &SubscriptionNotice,
    ) -> BillingResult<WebhookOutcome> {
        let user_id = self
            .require_user(
                notice.user_id.as_ref(),
                Some(&notice.subscription_id),
                notice.customer_id.as_deref(),
            )
            .await?;

        let mutation = self
            .apply_status_signal(
                &user_id,
                ctx,
                event.created,
                Some(&notice.subscription_id),
                SubscriptionSignal::Canceled,
            )
            .await?;

        if mutation.is_applied() {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %notice.subscription_id,
                "Subscription canceled; paid credits remain until period end"
            );
        }
        Ok(Self::outcome_of(mutation))
    }

    /// Status-only transition on an existing subscription. A cancellation that
    /// arrives before its checkout leaves a canceled row behind so the late
    /// checkout cannot reactivate it; other signals wait for the checkout.
    async fn apply_status_signal(
        &self,
        user_id: &UserId,
        ctx: &EventContext,
        created: OffsetDateTime,
        stripe_subscription_id: Option<&str>,
        signal: SubscriptionSignal,
    ) -> BillingResult<Mutation<()>> {
        self.ledger
            .mutate(user_id, true, Some(ctx), |state, now| {
                let Some(mut sub) = state.subscription.clone() else {
                    if signal != SubscriptionSignal::Canceled {
                        return Err(BillingError::NotFound(format!(
                            "no subscription for user {} yet",
                            state.balance.user_id
                        )));
                    }
                    state.subscription = Some(Subscription {
                        user_id: state.balance.user_id.clone(),
                        status: SubscriptionStatus::Canceled,
                        price_id: None,
                        price_name: None,
                        stripe_subscription_id: stripe_subscription_id.map(str::to_string),
                        stripe_customer_id: None,
                        period_start: None,
                        period_end: None,
                        last_event_at: Some(created),
                        updated_at: now,
                    });
                    let mut out = Plan::new(());
                    out.outcome = "canceled_before_checkout";
                    out.subscription_changed = true;
                    return Ok(Decision::Apply(out));
                };
                if !same_subscription(&sub, stripe_subscription_id) {
                    return Ok(Decision::Skip {
                        outcome: "other_subscription",
                        value: (),
                    });
                }
                if is_stale(&sub, created) {
                    return Ok(Decision::Skip {
                        outcome: "stale",
                        value: (),
                    });
                }

                match transition(sub.status, signal) {
                    Transition::Changed { to, .. } => {
                        sub.status = to;
                        sub.last_event_at = Some(created);
                        sub.updated_at = now;
                        state.subscription = Some(sub);

                        let mut out = Plan::new(());
                        out.subscription_changed = true;
                        Ok(Decision::Apply(out))
                    }
                    Transition::Unchanged(_) => Ok(Decision::Skip {
                        outcome: "unchanged",
                        value: (),
                    }),
                    Transition::Rejected { .. } => Ok(Decision::Skip {
                        outcome: "rejected",
                        value: (),
                    }),
                }
            })
            .await
    }

    // ============ ADMIN OPERATIONS ============

    /// Most recently processed events first
    pub async fn list_processed(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ProcessedWebhookEvent>> {
        if !(1..=500).contains(&limit) || offset < 0 {
            return Err(BillingError::InvalidInput(
                "limit must be 1..=500 and offset non-negative".to_string(),
            ));
        }
        self.ledger.store().list_processed_events(limit, offset).await
    }

    /// Fetch an event from Stripe and run it through the normal path.
    ///
    /// Already-processed events come back as `Duplicate`, so a replay can
    /// only fill in an event that never committed.
    pub async fn replay_event(&self, event_id: &str) -> BillingResult<WebhookReplayResult> {
        let stripe = self.stripe.as_ref().ok_or_else(|| {
            BillingError::Config("STRIPE_SECRET_KEY is required for replay".to_string())
        })?;

        tracing::info!(event_id = %event_id, "Attempting to replay webhook event");

        let previously_processed = self.ledger.store().is_event_processed(event_id).await?;
        let value = stripe.retrieve_event_json(event_id).await?;
        let event = ParsedEvent::from_value(value)?;
        let event_type = event.event_type.clone();
        let outcome = self.handle_event(event).await?;

        tracing::info!(
            event_id = %event_id,
            previously_processed = previously_processed,
            outcome = ?outcome,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            event_id: event_id.to_string(),
            event_type,
            previously_processed,
            outcome,
        })
    }

    /// Drop registry rows older than the retention window
    pub async fn prune_processed(&self) -> BillingResult<u64> {
        let cutoff =
            self.ledger.now() - Duration::days(self.ledger.config().webhook_retention_days);
        let removed = self.ledger.store().prune_processed_events(cutoff).await?;
        tracing::info!(removed = removed, cutoff = %cutoff, "Pruned processed webhook events");
        Ok(removed)
    }
}
