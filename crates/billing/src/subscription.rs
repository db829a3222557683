//! Subscription state machine
//!
//! ```text
//! none ──checkout──▶ active ──payment failed──▶ past_due
//!                     ▲  │                        │
//!                     │  └──renewal (self loop)   │
//!                     └─────payment succeeded─────┘
//! any ──cancellation──▶ canceled
//! active/past_due/canceled with now >= period_end ──(read only)──▶ expired
//! ```
//!
//! Transitions are computed against the stored status. `expired` is never
//! stored; it is derived by [`effective_status`] whenever a read happens after
//! the paid period ended without a renewal.

use time::OffsetDateTime;

use crate::models::{Subscription, SubscriptionStatus};

/// Lifecycle input derived from a provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionSignal {
    CheckoutCompleted,
    PaymentSucceeded,
    PaymentFailed,
    Canceled,
    /// Status reported verbatim by a subscription-updated notification
    ProviderStatus(SubscriptionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    /// Already in the target state; applying again is a no-op
    Unchanged(SubscriptionStatus),
    Rejected {
        from: SubscriptionStatus,
        reason: &'static str,
    },
}

impl Transition {
    /// Status after applying the transition
    pub fn resulting_status(&self) -> SubscriptionStatus {
        match *self {
            Transition::Changed { to, .. } => to,
            Transition::Unchanged(status) => status,
            Transition::Rejected { from, .. } => from,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

pub fn transition(current: SubscriptionStatus, signal: SubscriptionSignal) -> Transition {
    use SubscriptionStatus::*;

    let changed = |to| Transition::Changed { from: current, to };
    let rejected = |reason| Transition::Rejected {
        from: current,
        reason,
    };

    if current == Expired {
        return rejected("expired is derived and never stored");
    }

    match signal {
        SubscriptionSignal::CheckoutCompleted => match current {
            Active => Transition::Unchanged(Active),
            None | PastDue | Canceled => changed(Active),
            Expired => rejected("expired is derived and never stored"),
        },
        SubscriptionSignal::PaymentSucceeded => match current {
            Active => Transition::Unchanged(Active),
            PastDue => changed(Active),
            None => rejected("payment for an unknown subscription"),
            Canceled => rejected("payment for a canceled subscription"),
            Expired => rejected("expired is derived and never stored"),
        },
        SubscriptionSignal::PaymentFailed => match current {
            Active => changed(PastDue),
            PastDue => Transition::Unchanged(PastDue),
            None => rejected("payment failure for an unknown subscription"),
            Canceled => rejected("payment failure for a canceled subscription"),
            Expired => rejected("expired is derived and never stored"),
        },
        SubscriptionSignal::Canceled => match current {
            Canceled => Transition::Unchanged(Canceled),
            _ => changed(Canceled),
        },
        SubscriptionSignal::ProviderStatus(target) => {
            if target == current {
                return Transition::Unchanged(current);
            }
            match (current, target) {
                (None | PastDue, Active) => changed(Active),
                (Active, PastDue) => changed(PastDue),
                (_, Canceled) => changed(Canceled),
                (Canceled, _) => rejected("canceled subscriptions cannot be revived"),
                (_, None | Expired) => rejected("provider cannot report a derived status"),
                _ => rejected("transition not allowed"),
            }
        }
    }
}

/// Status as seen by readers at `now`
pub fn effective_status(
    subscription: Option<&Subscription>,
    now: OffsetDateTime,
) -> SubscriptionStatus {
    let Some(sub) = subscription else {
        return SubscriptionStatus::None;
    };

    match sub.status {
        SubscriptionStatus::Active | SubscriptionStatus::PastDue | SubscriptionStatus::Canceled
            if sub.period_end.is_some_and(|end| now >= end) =>
        {
            SubscriptionStatus::Expired
        }
        status => status,
    }
}

/// Whether the subscription bucket takes part in spending
pub fn has_live_subscription(subscription: Option<&Subscription>, now: OffsetDateTime) -> bool {
    matches!(
        effective_status(subscription, now),
        SubscriptionStatus::Active | SubscriptionStatus::PastDue | SubscriptionStatus::Canceled
    )
}
