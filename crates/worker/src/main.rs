//! BoxHQ Background Worker
//!
//! Handles scheduled billing jobs:
//! - Monthly overage billing run (daily at 2:00 AM UTC; idempotent per period)
//! - Grace period expiry + expiring-soon warnings (daily at 8:00 AM UTC)
//! - Period-end cancellation processing (hourly)
//! - Failed billing event retry (every 15 minutes)
//! - Nightly invariant checks (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use boxhq_billing::{
    BillingService, GracePeriod, NotificationDispatcher, NotificationPriority,
    NotificationRequest, RetryResult, MAX_EVENT_RETRIES,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

/// Create a database connection pool, retrying with backoff so a worker
/// restart during a database failover recovers on its own.
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(5);
    let pool = Retry::spawn(strategy, || async {
        PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database_url)
            .await
    })
    .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log per-event results of a retry pass
fn log_retry_results(results: &[RetryResult]) {
    let succeeded = results.iter().filter(|r| r.result.is_ok()).count();
    let failed = results.len() - succeeded;

    if !results.is_empty() {
        info!(
            total = results.len(),
            succeeded = succeeded,
            failed = failed,
            "Failed event retry cycle complete"
        );
    }

    for result in results {
        if let Err(e) = &result.result {
            error!(
                external_id = %result.external_id,
                error = %e,
                "Event retry failed again"
            );
        }
    }
}

/// Warn boxes whose grace periods end soon
async fn send_expiring_warnings(
    notifier: &dyn NotificationDispatcher,
    expiring: &[GracePeriod],
) {
    for period in expiring {
        let request = NotificationRequest::new(
            period.box_id,
            "grace_period_expiring",
            format!("grace_expiring_{}_{}", period.box_id, period.id),
        )
        .priority(NotificationPriority::Urgent)
        .title("Action needed on your billing")
        .message(format!(
            "Your grace period for '{}' ends on {}. Resolve it to avoid interruption.",
            period.reason,
            period.ends_at.date()
        ))
        .action_url("https://app.boxhq.io/billing")
        .data(serde_json::json!({
            "grace_period_id": period.id,
            "reason": period.reason,
            "ends_at": period.ends_at.to_string(),
        }));

        if let Err(e) = notifier.create_notification(request).await {
            warn!(
                box_id = %period.box_id,
                grace_period_id = %period.id,
                error = %e,
                "Failed to send expiring-grace warning"
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting BoxHQ Worker");

    let pool = create_db_pool().await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Stripe config nothing billing-related can run; stay up
            // so orchestration doesn't crash-loop, and surface the problem.
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let notifier: Arc<dyn NotificationDispatcher> = Arc::new(
        boxhq_billing::DbNotificationDispatcher::new(pool.clone()),
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Monthly overage billing run (daily at 2:00 AM UTC)
    // Runs daily but only bills periods that have actually ended; the
    // (box, period) unique constraint makes re-runs no-ops.
    let overage_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let billing = overage_billing.clone();
            Box::pin(async move {
                info!("Running monthly overage billing job");
                match billing.overage.process_monthly_overage_billing().await {
                    Ok(summary) => {
                        info!(
                            candidates = summary.candidates,
                            billed = summary.billed,
                            already_billed = summary.already_billed,
                            no_overage = summary.no_overage,
                            failed = summary.failed,
                            total_billed_cents = summary.total_billed_cents,
                            "Overage billing run complete"
                        );
                    }
                    Err(e) => error!(error = %e, "Overage billing run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Monthly overage billing (daily at 2:00 AM UTC)");

    // Job 2: Grace period expiry and expiring-soon warnings (daily at 8:00 AM UTC)
    let grace_billing = billing.clone();
    let grace_notifier = notifier.clone();
    scheduler
        .add(Job::new_async("0 0 8 * * *", move |_uuid, _l| {
            let billing = grace_billing.clone();
            let notifier = grace_notifier.clone();
            Box::pin(async move {
                info!("Running grace period sweep");

                match billing.grace.expire_overdue().await {
                    Ok(expired) => {
                        if !expired.is_empty() {
                            warn!(expired = expired.len(), "Auto-expired overdue grace periods");
                        }
                    }
                    Err(e) => error!(error = %e, "Grace period expiry failed"),
                }

                match billing.grace.sweep_expiring(2).await {
                    Ok(expiring) => {
                        if !expiring.is_empty() {
                            info!(
                                expiring = expiring.len(),
                                "Grace periods ending within 2 days"
                            );
                            send_expiring_warnings(notifier.as_ref(), &expiring).await;
                        }
                    }
                    Err(e) => error!(error = %e, "Expiring-grace sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Grace period sweep (daily at 8:00 AM UTC)");

    // Job 3: Period-end cancellation processing (hourly)
    let cancel_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = cancel_billing.clone();
            Box::pin(async move {
                match billing.subscriptions.process_period_end_cancellations().await {
                    Ok(0) => {}
                    Ok(processed) => {
                        info!(processed = processed, "Period-end cancellations applied")
                    }
                    Err(e) => error!(error = %e, "Period-end cancellation job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Period-end cancellation processing (hourly)");

    // Job 4: Failed billing event retry (every 15 minutes)
    let retry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = retry_billing.clone();
            Box::pin(async move {
                match billing.router.retry_failed(MAX_EVENT_RETRIES).await {
                    Ok(results) => log_retry_results(&results),
                    Err(e) => error!(error = %e, "Failed event retry pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed event retry (every 15 minutes)");

    // Job 5: Nightly invariant checks (daily at 3:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "All billing invariants hold"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                box_id = %violation.box_id,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 3:00 AM UTC)");

    // Job 6: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("BoxHQ Worker started successfully with {} scheduled jobs", 6);

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
