//! Sitebill Background Worker
//!
//! Handles scheduled jobs:
//! - Pending-profile reconciliation sweep (every 10 minutes)
//! - Gateway notification log cleanup (daily at 3:00 UTC)
//! - Billing consistency checks (daily at 6:00 UTC)
//! - Health check heartbeat (every 5 minutes)

mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use sitebill_billing::invariants::InvariantChecker;
use sitebill_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::reconcile::ProfileSweep;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn notification_retention_days() -> i32 {
    std::env::var("NOTIFICATION_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(90)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Sitebill Worker");

    let pool = create_db_pool().await?;
    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: pending-profile reconciliation sweep (every 10 minutes).
    // Retries recurring-profile creation for settled checkout charges.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running pending-profile reconciliation sweep");
                match ProfileSweep::new(billing).run().await {
                    Ok(summary) => info!(
                        recovered = summary.recovered,
                        retried = summary.retried,
                        exhausted = summary.exhausted,
                        "Reconciliation sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Reconciliation sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Pending-profile reconciliation sweep (every 10 minutes)");

    // Job 2: notification log cleanup (daily at 3:00 UTC)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                let keep_days = notification_retention_days();
                match billing.store.cleanup_old_notifications(keep_days).await {
                    Ok(deleted) => {
                        info!(deleted, keep_days, "Notification log cleanup complete")
                    }
                    Err(e) => error!(error = %e, "Notification log cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Notification log cleanup (daily 3:00 UTC)");

    // Job 3: billing consistency checks (daily at 6:00 UTC)
    let invariant_pool = pool.clone();
    let known_levels = billing.config.plans.level_numbers();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let checker = InvariantChecker::new(invariant_pool.clone(), known_levels.clone());
            Box::pin(async move {
                info!("Running billing consistency checks");
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "All billing invariants hold")
                    }
                    Ok(summary) => {
                        for v in &summary.violations {
                            warn!(
                                invariant = %v.invariant,
                                severity = %v.severity,
                                tenant_ids = ?v.tenant_ids,
                                description = %v.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing consistency check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Billing consistency check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing consistency checks (daily 6:00 UTC)");

    // Job 4: health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, all jobs scheduled");

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
