//! Monthly billing job preparation
//!
//! Materializes one `customer_fee_job` per active customer per billing
//! month. Idempotency is anchored on the unique `idempotency_key`
//! (`{customer_id}_{billing_month}`), not on in-memory state: reruns after
//! a partial failure only fill in the gaps.

use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, error, info};

use crate::error::BillingResult;
use crate::model::{BillingMonth, CustomerFeeJob, FeeJobStatus};

/// Counts reported by one preparation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrepareSummary {
    /// Jobs inserted this run
    pub created: u32,
    /// Customers that already had a job for the month
    pub skipped: u32,
    /// Customers whose insert failed; the batch continued past them
    pub errored: u32,
}

impl PrepareSummary {
    /// Fold one per-customer outcome into the run counters
    fn record(&mut self, outcome: &BillingResult<Option<CustomerFeeJob>>) {
        match outcome {
            Ok(Some(_)) => self.created += 1,
            Ok(None) => self.skipped += 1,
            Err(_) => self.errored += 1,
        }
    }
}

/// Creates `NEW` fee jobs for every active customer of a billing month
pub struct JobPreparer {
    pool: PgPool,
}

impl JobPreparer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Prepare jobs for the month containing today (the scheduler entry point)
    pub async fn prepare_current_month(&self) -> BillingResult<PrepareSummary> {
        self.prepare_monthly_jobs(BillingMonth::current()).await
    }

    /// Create one `NEW` job per active, non-deleted customer for the given
    /// billing month. Safe to re-run: existing idempotency keys are skipped,
    /// and per-customer failures are logged and counted without aborting
    /// the rest of the batch.
    pub async fn prepare_monthly_jobs(
        &self,
        billing_month: BillingMonth,
    ) -> BillingResult<PrepareSummary> {
        info!(billing_month = %billing_month, "Preparing fee jobs");

        let customer_ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM customer WHERE status = 'ACTIVE' AND deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        info!(count = customer_ids.len(), "Found active customers");

        let mut summary = PrepareSummary::default();
        for (customer_id,) in customer_ids {
            let outcome = self.prepare_job(customer_id, billing_month).await;
            match &outcome {
                Ok(Some(job)) => info!(customer_id, job_id = job.id, "Created fee job"),
                Ok(None) => {
                    debug!(customer_id, billing_month = %billing_month, "Job already exists")
                }
                Err(e) => error!(customer_id, error = %e, "Error creating job for customer"),
            }
            summary.record(&outcome);
        }

        info!(
            billing_month = %billing_month,
            created = summary.created,
            skipped = summary.skipped,
            errored = summary.errored,
            "Fee job preparation completed"
        );
        Ok(summary)
    }

    /// Insert a single job unless its idempotency key is already taken.
    /// The unique index backs the existence check: a concurrent insert of
    /// the same key makes this row a no-op instead of a duplicate.
    async fn prepare_job(
        &self,
        customer_id: i64,
        billing_month: BillingMonth,
    ) -> BillingResult<Option<CustomerFeeJob>> {
        let idempotency_key = billing_month.idempotency_key(customer_id);

        let job: Option<CustomerFeeJob> = sqlx::query_as(
            r#"
            INSERT INTO customer_fee_job (customer_id, billing_month, status, idempotency_key)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(customer_id)
        .bind(billing_month.to_string())
        .bind(FeeJobStatus::New)
        .bind(&idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }
}
