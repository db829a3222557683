//! Typed Stripe events
//!
//! The webhook envelope is parsed once into [`BillingEvent`], a closed set of
//! the event kinds the ledger reacts to. Anything else becomes
//! [`BillingEvent::Unrecognized`] and is acknowledged without effect.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{SubscriptionStatus, UserId};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl BillingPeriod {
    fn from_unix(start: Option<i64>, end: Option<i64>) -> BillingResult<Option<Self>> {
        match (start, end) {
            (Some(start), Some(end)) => {
                let start = timestamp(start)?;
                let end = timestamp(end)?;
                if end <= start {
                    return Err(BillingError::MalformedEvent(
                        "billing period ends before it starts".to_string(),
                    ));
                }
                Ok(Some(Self { start, end }))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub user_id: Option<UserId>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    /// Present when the session carries an expanded subscription
    pub period: Option<BillingPeriod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePurchase {
    pub session_id: String,
    pub user_id: Option<UserId>,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
    /// Credit count from session metadata, used when the price is not in the catalog
    pub credits: Option<i64>,
    pub paid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceNotice {
    pub invoice_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    /// Service period of the first subscription line
    pub period: Option<BillingPeriod>,
    /// `subscription_create` for the first invoice, `subscription_cycle` for renewals
    pub billing_reason: Option<String>,
}

impl InvoiceNotice {
    pub fn is_initial(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionNotice {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub user_id: Option<UserId>,
    /// Raw Stripe status string
    pub status: String,
    pub price_id: Option<String>,
    pub period: Option<BillingPeriod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    SubscriptionCheckoutCompleted(CheckoutCompleted),
    OneTimePurchaseCompleted(OneTimePurchase),
    InvoicePaid(InvoiceNotice),
    InvoicePaymentFailed(InvoiceNotice),
    SubscriptionUpdated(SubscriptionNotice),
    SubscriptionDeleted(SubscriptionNotice),
    Unrecognized { event_type: String },
}

/// Verified event with its envelope fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub event: BillingEvent,
}

impl ParsedEvent {
    pub fn from_json(payload: &str) -> BillingResult<Self> {
        let value: Value = serde_json::from_str(payload)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> BillingResult<Self> {
        let envelope: WebhookEnvelope = serde_json::from_value(value)?;
        if envelope.id.is_empty() {
            return Err(BillingError::MalformedEvent("event id is empty".to_string()));
        }

        let created = timestamp(envelope.created)?;
        let object = envelope.data.object;

        let event = match envelope.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED | CHECKOUT_ASYNC_PAYMENT_SUCCEEDED => {
                parse_checkout(object)?
            }
            INVOICE_PAID | INVOICE_PAYMENT_SUCCEEDED => {
                BillingEvent::InvoicePaid(parse_invoice(object)?)
            }
            INVOICE_PAYMENT_FAILED => BillingEvent::InvoicePaymentFailed(parse_invoice(object)?),
            SUBSCRIPTION_UPDATED => {
                BillingEvent::SubscriptionUpdated(parse_subscription(object)?)
            }
            SUBSCRIPTION_DELETED => {
                BillingEvent::SubscriptionDeleted(parse_subscription(object)?)
            }
            other => BillingEvent::Unrecognized {
                event_type: other.to_string(),
            },
        };

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            created,
            event,
        })
    }
}

/// Map a Stripe subscription status onto the ledger lifecycle.
///
/// Statuses with no lifecycle meaning here (`incomplete`, `paused`) map to
/// `None` and leave the stored status alone.
pub fn map_stripe_status(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "active" | "trialing" => Some(SubscriptionStatus::Active),
        "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
        "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
        _ => None,
    }
}

fn timestamp(unix: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| BillingError::MalformedEvent(format!("invalid timestamp {}: {}", unix, e)))
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// Stripe field that is either an id or the expanded object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

#[derive(Debug, Deserialize)]
struct HasId {
    id: String,
}

impl Expandable<HasId> {
    fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(obj) => &obj.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionObject {
    id: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    customer: Option<Expandable<HasId>>,
    #[serde(default)]
    subscription: Option<Expandable<SubscriptionObject>>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    customer: Option<Expandable<HasId>>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    items: Option<ItemList>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

impl SubscriptionObject {
    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.as_ref().and_then(|list| list.data.first())
    }

    fn price_id(&self) -> Option<String> {
        self.first_item()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.clone())
    }

    /// Newer API versions moved the period onto the subscription item
    fn period(&self) -> BillingResult<Option<BillingPeriod>> {
        let item = self.first_item();
        BillingPeriod::from_unix(
            self.current_period_start
                .or_else(|| item.and_then(|i| i.current_period_start)),
            self.current_period_end
                .or_else(|| item.and_then(|i| i.current_period_end)),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    #[serde(default)]
    price: Option<HasId>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    customer: Option<Expandable<HasId>>,
    #[serde(default)]
    subscription: Option<Expandable<HasId>>,
    #[serde(default)]
    billing_reason: Option<String>,
    #[serde(default)]
    period_start: Option<i64>,
    #[serde(default)]
    period_end: Option<i64>,
    #[serde(default)]
    lines: Option<InvoiceLines>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLines {
    #[serde(default)]
    data: Vec<InvoiceLine>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLine {
    #[serde(default)]
    price: Option<HasId>,
    #[serde(default)]
    period: Option<LinePeriod>,
    #[serde(default)]
    subscription: Option<Expandable<HasId>>,
}

#[derive(Debug, Deserialize)]
struct LinePeriod {
    start: i64,
    end: i64,
}

fn metadata_user(metadata: &Option<HashMap<String, String>>) -> Option<UserId> {
    metadata
        .as_ref()
        .and_then(|m| m.get("user_id"))
        .filter(|id| !id.is_empty())
        .map(|id| UserId::new(id.as_str()))
}

fn parse_checkout(object: Value) -> BillingResult<BillingEvent> {
    let session: SessionObject = serde_json::from_value(object)?;

    let user_id = metadata_user(&session.metadata).or_else(|| {
        session
            .client_reference_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(UserId::from)
    });
    let customer_id = session.customer.as_ref().map(|c| c.id().to_string());
    let metadata_price = session
        .metadata
        .as_ref()
        .and_then(|m| m.get("price_id"))
        .cloned();

    match session.mode.as_deref() {
        Some("subscription") => {
            let (subscription_id, price_id, period) = match session.subscription {
                Some(Expandable::Object(sub)) => {
                    (Some(sub.id.clone()), sub.price_id(), sub.period()?)
                }
                Some(Expandable::Id(id)) => (Some(id), None, None),
                None => (None, None, None),
            };

            Ok(BillingEvent::SubscriptionCheckoutCompleted(CheckoutCompleted {
                session_id: session.id,
                user_id,
                customer_id,
                subscription_id,
                price_id: price_id.or(metadata_price),
                period,
            }))
        }
        Some("payment") => {
            let credits = match session.metadata.as_ref().and_then(|m| m.get("credits")) {
                Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                    BillingError::MalformedEvent(format!("invalid credits metadata '{}'", raw))
                })?),
                None => None,
            };
            let paid = matches!(
                session.payment_status.as_deref(),
                None | Some("paid") | Some("no_payment_required")
            );

            Ok(BillingEvent::OneTimePurchaseCompleted(OneTimePurchase {
                session_id: session.id,
                user_id,
                customer_id,
                price_id: metadata_price,
                credits,
                paid,
            }))
        }
        _ => Ok(BillingEvent::Unrecognized {
            event_type: format!(
                "{} (mode {})",
                CHECKOUT_SESSION_COMPLETED,
                session.mode.as_deref().unwrap_or("unknown")
            ),
        }),
    }
}

fn parse_invoice(object: Value) -> BillingResult<InvoiceNotice> {
    let invoice: InvoiceObject = serde_json::from_value(object)?;

    // The invoice-level period covers the previous cycle for subscription
    // invoices; the line period is the service period being paid for.
    let line = invoice.lines.as_ref().and_then(|l| l.data.first());
    let period = match line.and_then(|l| l.period.as_ref()) {
        Some(p) => BillingPeriod::from_unix(Some(p.start), Some(p.end))?,
        None => BillingPeriod::from_unix(invoice.period_start, invoice.period_end)?,
    };

    let subscription_id = invoice
        .subscription
        .as_ref()
        .map(|s| s.id().to_string())
        .or_else(|| {
            line.and_then(|l| l.subscription.as_ref())
                .map(|s| s.id().to_string())
        });

    Ok(InvoiceNotice {
        invoice_id: invoice.id,
        customer_id: invoice.customer.as_ref().map(|c| c.id().to_string()),
        subscription_id,
        price_id: line
            .and_then(|l| l.price.as_ref())
            .map(|p| p.id.clone()),
        period,
        billing_reason: invoice.billing_reason,
    })
}

fn parse_subscription(object: Value) -> BillingResult<SubscriptionNotice> {
    let sub: SubscriptionObject = serde_json::from_value(object)?;
    let period = sub.period()?;
    let price_id = sub.price_id();

    Ok(SubscriptionNotice {
        customer_id: sub.customer.as_ref().map(|c| c.id().to_string()),
        user_id: metadata_user(&sub.metadata),
        status: sub.status.clone().unwrap_or_default(),
        price_id,
        period,
        subscription_id: sub.id,
    })
}
