//! Fee Billing Background Worker
//!
//! Handles scheduled jobs including:
//! - Monthly fee job preparation (1st of the month, 00:01 UTC)
//! - Pending fee job execution in batches (hourly)
//! - Health check heartbeat (every 5 minutes)
//!
//! Also runs the fee charged event consumers (primary, retry, dead-letter)
//! against the in-process event transport. Scheduled jobs run under
//! Postgres advisory locks so that only one worker replica executes a
//! given job per tick.

use std::sync::Arc;
use std::time::Duration;

use feebill_billing::{
    BillingService, EventTransport, FeeChargedConsumer, FeeChargedDlqConsumer,
    FeeChargedRetryConsumer, InMemoryTransport, RetryStore, DEFAULT_BATCH_SIZE, TOPIC_FEE_CHARGED,
    TOPIC_FEE_CHARGED_DLQ, TOPIC_FEE_CHARGED_RETRY,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Lock name for the monthly preparation job
const LOCK_PREPARE: &str = "FEE_JOB_PREPARE_SCHEDULER";
/// Lock name for the hourly execution job
const LOCK_EXECUTE: &str = "FEE_JOB_EXECUTE_SCHEDULER";

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
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

    info!("Starting fee billing worker");

    // Create database pool and apply migrations
    let pool = create_db_pool().await?;
    feebill_billing::MIGRATOR.run(&pool).await?;
    info!("Migrations applied");

    // Event transport and billing service
    let transport = Arc::new(InMemoryTransport::new());
    let billing = Arc::new(BillingService::new(pool.clone(), transport.clone()));

    // Consumers take their topic receivers before anything publishes
    let primary_rx = transport.subscribe(TOPIC_FEE_CHARGED).await?;
    let retry_rx = transport.subscribe(TOPIC_FEE_CHARGED_RETRY).await?;
    let dlq_rx = transport.subscribe(TOPIC_FEE_CHARGED_DLQ).await?;

    let primary_consumer =
        FeeChargedConsumer::new(transport.clone(), RetryStore::new_postgres(pool.clone()));
    tokio::spawn(async move {
        primary_consumer.run(primary_rx).await;
    });

    let retry_consumer = FeeChargedRetryConsumer::new(transport.clone());
    tokio::spawn(async move {
        retry_consumer.run(retry_rx).await;
    });

    let dlq_consumer = FeeChargedDlqConsumer::new();
    tokio::spawn(async move {
        dlq_consumer.run(dlq_rx).await;
    });
    info!("Event consumers started");

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Prepare fee jobs for the new billing month
    // Cron: 00:01 UTC on the 1st of every month
    let prepare_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 1 0 1 * *", move |_uuid, _l| {
            let billing = prepare_billing.clone();
            Box::pin(async move {
                info!("Running monthly fee job preparation");
                let outcome = billing
                    .lock
                    .execute_with_lock(LOCK_PREPARE, || billing.preparer.prepare_current_month())
                    .await;
                match outcome {
                    Ok(Some(summary)) => info!(
                        created = summary.created,
                        skipped = summary.skipped,
                        errored = summary.errored,
                        "Fee job preparation complete"
                    ),
                    Ok(None) => info!("Preparation skipped, lock held by another worker"),
                    Err(e) => error!(error = %e, "Fee job preparation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Monthly fee job preparation (1st of month, 00:01 UTC)");

    // Job 2: Execute pending fee jobs in batches
    // Cron: At minute 0 of every hour
    let execute_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = execute_billing.clone();
            Box::pin(async move {
                info!("Running pending fee job execution");
                let outcome = billing
                    .lock
                    .execute_with_lock(LOCK_EXECUTE, || {
                        billing
                            .charge
                            .execute_pending_jobs(DEFAULT_BATCH_SIZE, &billing.producer)
                    })
                    .await;
                match outcome {
                    Ok(Some(summary)) => info!(
                        processed = summary.processed,
                        success = summary.success,
                        failed = summary.failed,
                        "Fee job execution complete"
                    ),
                    Ok(None) => info!("Execution skipped, lock held by another worker"),
                    Err(e) => error!(error = %e, "Fee job execution failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Pending fee job execution (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Fee billing worker started successfully with 3 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
