//! Creditline Background Worker
//!
//! Handles scheduled jobs including:
//! - Free allotment refresh for expired free buckets (every 15 minutes)
//! - Ledger invariant sweep (hourly)
//! - Processed webhook registry pruning (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use creditline_billing::BillingService;
use creditline_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Creditline Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;
    let billing = Arc::new(BillingService::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Cron: every 15 minutes
    let refresh_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = refresh_billing.clone();
            Box::pin(async move {
                let batch = jobs::FREE_REFRESH_BATCH;
                if let Err(e) = jobs::refresh_free_allotments(&billing, batch).await {
                    error!(error = %e, "Free allotment refresh failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Free allotment refresh (every 15 minutes)");

    // Cron: at minute 0 of every hour
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running ledger invariant sweep");
                if let Err(e) = jobs::sweep_invariants(&billing).await {
                    error!(error = %e, "Ledger invariant sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant sweep (hourly)");

    let prune_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                match jobs::prune_webhook_registry(&billing).await {
                    Ok(deleted) => info!(deleted = deleted, "Pruned processed webhook events"),
                    Err(e) => error!(error = %e, "Webhook registry prune failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook registry prune (daily at 3:00 AM UTC)");

    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Creditline Worker started with 4 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
