//! Read side for fee jobs: lookups and per-month operational stats

use serde::Serialize;
use sqlx::PgPool;
use tracing::info;

use crate::error::{BillingError, BillingResult};
use crate::model::{BillingMonth, CustomerFeeJob, FeeJobStatus};

/// Operational counters for one billing month, used by dashboards and
/// run verification after a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeeChargeStats {
    pub total_jobs: i64,
    pub done_jobs: i64,
    pub failed_jobs: i64,
    /// NEW plus IN_PROGRESS
    pub pending_jobs: i64,
    pub total_attempts: i64,
    pub success_attempts: i64,
    pub failed_attempts: i64,
}

/// Queries over `customer_fee_job`
pub struct JobService {
    pool: PgPool,
}

impl JobService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch a job by id, excluding soft-deleted rows
    pub async fn get_job(&self, job_id: i64) -> BillingResult<CustomerFeeJob> {
        sqlx::query_as("SELECT * FROM customer_fee_job WHERE id = $1 AND deleted_at IS NULL")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Job not found with id: {}", job_id)))
    }

    /// All of a customer's jobs, newest billing month first
    pub async fn get_jobs_by_customer(
        &self,
        customer_id: i64,
    ) -> BillingResult<Vec<CustomerFeeJob>> {
        let jobs = sqlx::query_as(
            r#"
            SELECT * FROM customer_fee_job
            WHERE customer_id = $1 AND deleted_at IS NULL
            ORDER BY billing_month DESC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// A page of jobs in the given status, oldest first (the order the
    /// executor drains them in)
    pub async fn get_jobs_by_status(
        &self,
        status: FeeJobStatus,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<CustomerFeeJob>> {
        let jobs = sqlx::query_as(
            r#"
            SELECT * FROM customer_fee_job
            WHERE status = $1 AND deleted_at IS NULL
            ORDER BY created_at
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// All jobs of a billing month
    pub async fn get_jobs_by_month(
        &self,
        billing_month: BillingMonth,
    ) -> BillingResult<Vec<CustomerFeeJob>> {
        let jobs = sqlx::query_as(
            r#"
            SELECT * FROM customer_fee_job
            WHERE billing_month = $1 AND deleted_at IS NULL
            ORDER BY customer_id
            "#,
        )
        .bind(billing_month.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// The single job for (customer, month), if one was prepared
    pub async fn get_job_for_customer_month(
        &self,
        customer_id: i64,
        billing_month: BillingMonth,
    ) -> BillingResult<Option<CustomerFeeJob>> {
        let job = sqlx::query_as(
            r#"
            SELECT * FROM customer_fee_job
            WHERE customer_id = $1 AND billing_month = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(customer_id)
        .bind(billing_month.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Job and attempt counters for a billing month
    pub async fn get_charge_stats(
        &self,
        billing_month: BillingMonth,
    ) -> BillingResult<FeeChargeStats> {
        let month = billing_month.to_string();

        let (total_jobs, done_jobs, failed_jobs, pending_jobs): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COUNT(*) FILTER (WHERE status = 'DONE'),
                       COUNT(*) FILTER (WHERE status = 'FAILED'),
                       COUNT(*) FILTER (WHERE status IN ('NEW', 'IN_PROGRESS'))
                FROM customer_fee_job
                WHERE billing_month = $1 AND deleted_at IS NULL
                "#,
            )
            .bind(&month)
            .fetch_one(&self.pool)
            .await?;

        let (total_attempts, success_attempts, failed_attempts): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status = 'SUCCESS'),
                   COUNT(*) FILTER (WHERE status = 'FAILED')
            FROM fee_charge_attempt
            WHERE billing_month = $1
            "#,
        )
        .bind(&month)
        .fetch_one(&self.pool)
        .await?;

        let stats = FeeChargeStats {
            total_jobs,
            done_jobs,
            failed_jobs,
            pending_jobs,
            total_attempts,
            success_attempts,
            failed_attempts,
        };

        info!(
            billing_month = %billing_month,
            total = stats.total_jobs,
            done = stats.done_jobs,
            failed = stats.failed_jobs,
            pending = stats.pending_jobs,
            "Fee charge stats"
        );
        Ok(stats)
    }
}
