//! Scheduled ledger maintenance
//!
//! Each job is a plain async function over the billing service so it can be
//! driven by the cron scheduler or called directly.

use creditline_billing::{BillingResult, BillingService, InvariantCheckSummary, Mutation};
use tracing::{error, info, warn};

/// Users refreshed per run of the free allotment job
pub const FREE_REFRESH_BATCH: i64 = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub candidates: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Re-grant the free allotment to users whose free bucket has expired
pub async fn refresh_free_allotments(
    billing: &BillingService,
    batch: i64,
) -> BillingResult<RefreshReport> {
    let ledger = &billing.ledger;
    let users = ledger
        .store()
        .list_users_with_expired_free(ledger.now(), batch)
        .await?;

    let mut report = RefreshReport {
        candidates: users.len(),
        ..RefreshReport::default()
    };

    for user_id in &users {
        match ledger.refresh_free_allotment(user_id).await {
            Ok(Mutation::Applied(_)) => report.refreshed += 1,
            Ok(_) => report.skipped += 1,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to refresh free allotment");
                report.errors += 1;
            }
        }
    }

    info!(
        candidates = report.candidates,
        refreshed = report.refreshed,
        skipped = report.skipped,
        errors = report.errors,
        "Free allotment refresh complete"
    );
    Ok(report)
}

/// Run every invariant over every user and log violations
pub async fn sweep_invariants(billing: &BillingService) -> BillingResult<InvariantCheckSummary> {
    let summary = billing.invariants.run_all_checks().await?;

    if summary.healthy {
        info!(
            users_checked = summary.users_checked,
            checks_run = summary.checks_run,
            "Ledger invariants hold"
        );
    } else {
        for violation in &summary.violations {
            error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            );
        }
        warn!(
            users_checked = summary.users_checked,
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Ledger invariant sweep found violations"
        );
    }

    Ok(summary)
}

/// Drop processed-event registry rows past the retention window
pub async fn prune_webhook_registry(billing: &BillingService) -> BillingResult<u64> {
    billing.webhooks.prune_processed().await
}
