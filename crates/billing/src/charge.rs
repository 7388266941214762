//! Fee charge execution
//!
//! Drives a job through `NEW -> IN_PROGRESS -> {DONE, FAILED}` and records
//! one append-only `fee_charge_attempt` row per execution, success or
//! failure. The exactly-once control is layered: the batch only selects
//! `NEW` jobs, `charge_fee` rejects anything not `NEW`, and the status
//! flip to `IN_PROGRESS` is a compare-and-swap on the optimistic version,
//! so two racing executors cannot both charge the same job.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::calculation;
use crate::error::{BillingError, BillingResult};
use crate::events::FeeChargedProducer;
use crate::model::{
    AttemptStatus, BillingMonth, Customer, CustomerFeeConfig, CustomerFeeJob, FeeChargeResult,
    FeeJobStatus, FeeType,
};

/// Jobs processed per executor batch run
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Counts reported by one executor batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecuteSummary {
    pub processed: u32,
    pub success: u32,
    pub failed: u32,
}

/// Executes fee charges against prepared jobs
pub struct ChargeService {
    pool: PgPool,
}

impl ChargeService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Charge the fee for one job.
    ///
    /// Fails with `ENTITY_NOT_FOUND` if the job does not exist and with
    /// `JOB_INVALID_STATUS` if it is not `NEW` (re-entrant or racing
    /// invocations land here). Once the job is `IN_PROGRESS`, any failure
    /// in lookup or calculation is swallowed into a `FAILED` result so a
    /// batch loop can continue with the next job; the job ends in a
    /// terminal `FAILED` status rather than a stuck `IN_PROGRESS` one.
    pub async fn charge_fee(&self, job_id: i64) -> BillingResult<FeeChargeResult> {
        info!(job_id, "Charging fee for job");

        let job: CustomerFeeJob = sqlx::query_as(
            "SELECT * FROM customer_fee_job WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Job not found with id: {}", job_id)))?;

        require_new(job.status)?;

        // Flip to IN_PROGRESS before doing any work, so a crash mid-charge
        // leaves a visibly stuck job instead of a silently reprocessable one.
        // The version CAS loses the race if another executor got here first.
        self.transition(job.id, job.version, FeeJobStatus::InProgress, None)
            .await?;

        match self.execute_charge(&job).await {
            Ok(outcome) => {
                // CAS against version + 1: we hold the IN_PROGRESS write
                self.transition(job.id, job.version + 1, FeeJobStatus::Done, Some(outcome.amount))
                    .await?;
                self.record_attempt(&job, Some(&outcome), None).await;

                info!(job_id, amount = %outcome.amount, "Fee charged successfully");

                Ok(FeeChargeResult {
                    job_id,
                    customer_id: job.customer_id,
                    fee_config_id: Some(outcome.config_id),
                    charged_amount: Some(outcome.amount),
                    currency: Some(outcome.currency),
                    billing_month: job.billing_month.clone(),
                    status: "SUCCESS".to_string(),
                    error_message: None,
                    charged_at: OffsetDateTime::now_utc(),
                })
            }
            Err(e) => {
                error!(job_id, error = %e, "Error charging fee for job");

                self.transition(job.id, job.version + 1, FeeJobStatus::Failed, None)
                    .await?;
                self.record_attempt(&job, None, Some(&e)).await;

                Ok(FeeChargeResult {
                    job_id,
                    customer_id: job.customer_id,
                    fee_config_id: None,
                    charged_amount: None,
                    currency: None,
                    billing_month: job.billing_month.clone(),
                    status: "FAILED".to_string(),
                    error_message: Some(e.to_string()),
                    charged_at: OffsetDateTime::now_utc(),
                })
            }
        }
    }

    /// Fetch a page of `NEW` jobs (oldest first) and charge each one,
    /// publishing a `FeeChargedEvent` for every success. Per-job failures
    /// are isolated; one bad job never blocks the rest of the page.
    pub async fn execute_pending_jobs(
        &self,
        batch_size: i64,
        producer: &FeeChargedProducer,
    ) -> BillingResult<ExecuteSummary> {
        let jobs: Vec<CustomerFeeJob> = sqlx::query_as(
            r#"
            SELECT * FROM customer_fee_job
            WHERE status = $1 AND deleted_at IS NULL
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(FeeJobStatus::New)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        if jobs.is_empty() {
            info!("No NEW jobs to process");
            return Ok(ExecuteSummary::default());
        }

        info!(count = jobs.len(), "Found NEW jobs to process");

        let mut summary = ExecuteSummary::default();
        for job in jobs {
            summary.processed += 1;
            match self.charge_fee(job.id).await {
                Ok(result) if result.is_success() => {
                    producer.publish(&result).await;
                    summary.success += 1;
                }
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    error!(job_id = job.id, error = %e, "Error processing job");
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            success = summary.success,
            failed = summary.failed,
            "Job execution completed"
        );
        Ok(summary)
    }

    /// Steps 3-6 of the charge flow: resolve collaborators, compute the fee
    async fn execute_charge(&self, job: &CustomerFeeJob) -> BillingResult<ChargeOutcome> {
        let customer: Customer = sqlx::query_as(
            "SELECT * FROM customer WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(job.customer_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!("Customer not found with id: {}", job.customer_id))
        })?;

        if !customer.is_active() {
            return Err(BillingError::business(
                "CUSTOMER_INACTIVE",
                format!("Customer is not active: {}", customer.id),
            ));
        }

        // Fee configs are resolved against the first day of the billing month
        let billing_month: BillingMonth = job.billing_month.parse()?;
        let billing_date = billing_month.first_day();

        let config: CustomerFeeConfig = sqlx::query_as(
            r#"
            SELECT * FROM customer_fee_config
            WHERE customer_id = $1
              AND deleted_at IS NULL
              AND effective_from <= $2
              AND (effective_to IS NULL OR effective_to >= $2)
            "#,
        )
        .bind(job.customer_id)
        .bind(billing_date)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!(
                "No active fee config for customer: {}",
                job.customer_id
            ))
        })?;

        let fee_type: FeeType = sqlx::query_as(
            "SELECT * FROM fee_type WHERE id = $1 AND is_active = TRUE",
        )
        .bind(config.fee_type_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!("Fee type not found with id: {}", config.fee_type_id))
        })?;

        let amount = calculation::calculate_fee(
            &fee_type.calculation_type,
            config.monthly_fee_amount,
            config.calculation_params.as_ref(),
        )?;

        // Settlement against the account ledger is an external collaborator;
        // here it is a stub that always succeeds.
        info!(
            customer_id = customer.id,
            amount = %amount,
            currency = %config.currency,
            "Deducting fee from customer"
        );

        Ok(ChargeOutcome {
            config_id: config.id,
            amount,
            currency: config.currency,
        })
    }

    /// Status CAS; losing the version race means another writer touched the
    /// job since it was read, which must abort this charge
    async fn transition(
        &self,
        job_id: i64,
        expected_version: i64,
        status: FeeJobStatus,
        amount: Option<Decimal>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE customer_fee_job
            SET status = $3,
                amount = COALESCE($4, amount),
                updated_at = NOW(),
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(job_id)
        .bind(expected_version)
        .bind(status)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::StaleVersion {
                entity: "customer_fee_job",
                id: job_id,
            });
        }
        Ok(())
    }

    /// Append the audit row for this execution. The attempt log must never
    /// mask the charge outcome, so write failures are logged and dropped.
    async fn record_attempt(
        &self,
        job: &CustomerFeeJob,
        outcome: Option<&ChargeOutcome>,
        failure: Option<&BillingError>,
    ) {
        let (status, amount, error_code, error_message) = match (outcome, failure) {
            (Some(outcome), _) => (AttemptStatus::Success, outcome.amount, None, None),
            (None, Some(e)) => (
                AttemptStatus::Failed,
                Decimal::ZERO,
                Some(e.code().to_string()),
                Some(e.to_string()),
            ),
            (None, None) => return,
        };

        // The computed attempt_no can collide on UNIQUE (job_id, attempt_no)
        // if two executions race on one job; recompute and retry so the
        // audit row is not lost.
        for _ in 0..ATTEMPT_INSERT_RETRIES {
            let written = sqlx::query(
                r#"
                INSERT INTO fee_charge_attempt (
                    job_id,
                    customer_id,
                    billing_month,
                    amount,
                    attempt_no,
                    status,
                    error_code,
                    error_message
                )
                SELECT $1, $2, $3, $4,
                       COALESCE(MAX(attempt_no), 0) + 1,
                       $5, $6, $7
                FROM fee_charge_attempt
                WHERE job_id = $1
                "#,
            )
            .bind(job.id)
            .bind(job.customer_id)
            .bind(&job.billing_month)
            .bind(amount)
            .bind(status)
            .bind(&error_code)
            .bind(&error_message)
            .execute(&self.pool)
            .await;

            match written {
                Ok(_) => return,
                Err(e) if unique_violation(&e) => {
                    info!(job_id = job.id, "Attempt number taken, recomputing");
                }
                Err(e) => {
                    error!(job_id = job.id, error = %e, "Failed to record charge attempt");
                    return;
                }
            }
        }
        error!(
            job_id = job.id,
            "Failed to record charge attempt after {} tries", ATTEMPT_INSERT_RETRIES
        );
    }
}

/// Retries for the attempt_no race on the audit insert
const ATTEMPT_INSERT_RETRIES: u32 = 3;

/// Only `NEW` jobs may be charged; anything else is a re-entrant or
/// racing invocation
fn require_new(status: FeeJobStatus) -> BillingResult<()> {
    if status != FeeJobStatus::New {
        return Err(BillingError::business(
            "JOB_INVALID_STATUS",
            format!("Job is not in NEW status: {}", status),
        ));
    }
    Ok(())
}

fn unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map_or(false, |db| db.is_unique_violation())
}

struct ChargeOutcome {
    config_id: i64,
    amount: Decimal,
    currency: String,
}
