//! Read side for the append-only charge attempt audit trail

use sqlx::PgPool;

use crate::error::BillingResult;
use crate::model::{AttemptStatus, BillingMonth, FeeChargeAttempt};

/// Queries over `fee_charge_attempt`
pub struct AttemptService {
    pool: PgPool,
}

impl AttemptService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Full attempt history for one job, in execution order
    pub async fn get_attempts_by_job(&self, job_id: i64) -> BillingResult<Vec<FeeChargeAttempt>> {
        let attempts = sqlx::query_as(
            "SELECT * FROM fee_charge_attempt WHERE job_id = $1 ORDER BY attempt_no",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// All attempts across a customer's jobs, newest first
    pub async fn get_attempts_by_customer(
        &self,
        customer_id: i64,
    ) -> BillingResult<Vec<FeeChargeAttempt>> {
        let attempts = sqlx::query_as(
            "SELECT * FROM fee_charge_attempt WHERE customer_id = $1 ORDER BY created_at DESC",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Failed attempts, newest first, for operator triage
    pub async fn get_failed_attempts(&self, limit: i64) -> BillingResult<Vec<FeeChargeAttempt>> {
        let attempts = sqlx::query_as(
            r#"
            SELECT * FROM fee_charge_attempt
            WHERE status = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(AttemptStatus::Failed)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Failed attempts within one billing month
    pub async fn get_failed_attempts_by_month(
        &self,
        billing_month: BillingMonth,
    ) -> BillingResult<Vec<FeeChargeAttempt>> {
        let attempts = sqlx::query_as(
            r#"
            SELECT * FROM fee_charge_attempt
            WHERE billing_month = $1 AND status = $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(billing_month.to_string())
        .bind(AttemptStatus::Failed)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }
}
