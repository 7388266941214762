//! Customer fee configuration management
//!
//! A customer is bound to a fee type by a time-ranged `customer_fee_config`
//! row. The invariant guarded here: the non-deleted configs of one customer
//! never have overlapping effective ranges, so at most one config applies on
//! any given date. The check is read-then-decide without locking; two
//! concurrent writes for the same customer can both pass it. Config changes
//! are low-frequency manual operations, so that race is accepted; callers
//! needing a strict guarantee must serialize config writes per customer.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use tracing::info;

use crate::calculation;
use crate::error::{BillingError, BillingResult};
use crate::model::{Customer, CustomerFeeConfig, FeeType};

/// Request to assign a fee policy to a customer
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFeeConfigRequest {
    pub customer_id: i64,
    pub fee_type_id: i64,
    pub monthly_fee_amount: Decimal,
    pub currency: String,
    pub effective_from: Date,
    pub effective_to: Option<Date>,
    pub calculation_params: Option<serde_json::Value>,
}

/// Partial update of an existing config; `None` fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateFeeConfigRequest {
    pub monthly_fee_amount: Option<Decimal>,
    pub currency: Option<String>,
    pub effective_from: Option<Date>,
    pub effective_to: Option<Date>,
    pub calculation_params: Option<serde_json::Value>,
}

/// Dry-run fee computation against the currently active config
#[derive(Debug, Clone, Serialize)]
pub struct FeePreview {
    pub customer_id: i64,
    pub fee_type_code: String,
    pub fee_type_name: String,
    pub calculation_type: String,
    pub monthly_fee_amount: Decimal,
    pub calculated_fee: Decimal,
    pub currency: String,
    pub calculation_params: Option<serde_json::Value>,
}

/// Inclusive date ranges overlap iff `a1 <= b2 && a2 <= b1`,
/// with a missing end treated as +infinity
pub fn ranges_overlap(
    from1: Date,
    to1: Option<Date>,
    from2: Date,
    to2: Option<Date>,
) -> bool {
    let end1_covers = to1.map_or(true, |end1| from2 <= end1);
    let end2_covers = to2.map_or(true, |end2| from1 <= end2);
    end1_covers && end2_covers
}

/// Find the first existing config whose range overlaps `[from, to]`,
/// skipping the config being updated
pub fn find_overlapping<'a>(
    existing: &'a [CustomerFeeConfig],
    from: Date,
    to: Option<Date>,
    exclude_config_id: Option<i64>,
) -> Option<&'a CustomerFeeConfig> {
    existing
        .iter()
        .filter(|config| Some(config.id) != exclude_config_id)
        .find(|config| ranges_overlap(from, to, config.effective_from, config.effective_to))
}

/// Service managing fee configs and their non-overlap invariant
pub struct FeeConfigService {
    pool: PgPool,
}

impl FeeConfigService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Assign a new fee policy to a customer.
    ///
    /// The customer must be active and the fee type active; the new range
    /// must not overlap any existing non-deleted config of the customer.
    pub async fn create_fee_config(
        &self,
        request: CreateFeeConfigRequest,
    ) -> BillingResult<CustomerFeeConfig> {
        info!(customer_id = request.customer_id, "Creating fee config");

        self.require_active_customer(request.customer_id).await?;
        self.require_active_fee_type(request.fee_type_id).await?;

        check_range_order(request.effective_from, request.effective_to)?;
        self.validate_config_range(
            request.customer_id,
            request.effective_from,
            request.effective_to,
            None,
        )
        .await?;

        let config: CustomerFeeConfig = sqlx::query_as(
            r#"
            INSERT INTO customer_fee_config (
                customer_id,
                fee_type_id,
                monthly_fee_amount,
                currency,
                effective_from,
                effective_to,
                calculation_params
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(request.customer_id)
        .bind(request.fee_type_id)
        .bind(request.monthly_fee_amount)
        .bind(&request.currency)
        .bind(request.effective_from)
        .bind(request.effective_to)
        .bind(&request.calculation_params)
        .fetch_one(&self.pool)
        .await?;

        info!(config_id = config.id, "Created fee config");
        Ok(config)
    }

    /// Non-deleted config by id
    pub async fn get_fee_config(&self, config_id: i64) -> BillingResult<CustomerFeeConfig> {
        sqlx::query_as(
            "SELECT * FROM customer_fee_config WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Fee config not found with id: {}", config_id)))
    }

    /// The config effective for a customer on the given date:
    /// `effective_from <= date` and `effective_to` null or `>= date`
    pub async fn get_active_config(
        &self,
        customer_id: i64,
        date: Date,
    ) -> BillingResult<CustomerFeeConfig> {
        sqlx::query_as(
            r#"
            SELECT * FROM customer_fee_config
            WHERE customer_id = $1
              AND deleted_at IS NULL
              AND effective_from <= $2
              AND (effective_to IS NULL OR effective_to >= $2)
            "#,
        )
        .bind(customer_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!(
                "No active fee config for customer: {}",
                customer_id
            ))
        })
    }

    /// All non-deleted configs of a customer, expired ones included
    pub async fn list_configs(&self, customer_id: i64) -> BillingResult<Vec<CustomerFeeConfig>> {
        self.require_active_customer(customer_id).await?;
        let configs = sqlx::query_as(
            r#"
            SELECT * FROM customer_fee_config
            WHERE customer_id = $1 AND deleted_at IS NULL
            ORDER BY effective_from
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(configs)
    }

    /// Partial update with optimistic concurrency: the write carries the
    /// version the row was read at and is rejected as stale if it moved.
    pub async fn update_fee_config(
        &self,
        config_id: i64,
        request: UpdateFeeConfigRequest,
    ) -> BillingResult<CustomerFeeConfig> {
        info!(config_id, "Updating fee config");

        let mut config = self.get_fee_config(config_id).await?;
        let read_version = config.version;

        if let Some(amount) = request.monthly_fee_amount {
            config.monthly_fee_amount = amount;
        }
        if let Some(currency) = request.currency {
            config.currency = currency;
        }
        if let Some(from) = request.effective_from {
            config.effective_from = from;
        }
        if let Some(to) = request.effective_to {
            config.effective_to = Some(to);
        }
        if let Some(params) = request.calculation_params {
            config.calculation_params = Some(params);
        }

        // Validate dates after all updates are applied
        check_range_order(config.effective_from, config.effective_to)?;
        self.validate_config_range(
            config.customer_id,
            config.effective_from,
            config.effective_to,
            Some(config_id),
        )
        .await?;

        let updated: Option<CustomerFeeConfig> = sqlx::query_as(
            r#"
            UPDATE customer_fee_config
            SET monthly_fee_amount = $3,
                currency = $4,
                effective_from = $5,
                effective_to = $6,
                calculation_params = $7,
                updated_at = NOW(),
                version = version + 1
            WHERE id = $1
              AND version = $2
              AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(config_id)
        .bind(read_version)
        .bind(config.monthly_fee_amount)
        .bind(&config.currency)
        .bind(config.effective_from)
        .bind(config.effective_to)
        .bind(&config.calculation_params)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or(BillingError::StaleVersion {
            entity: "customer_fee_config",
            id: config_id,
        })
    }

    /// Soft delete; the row stays for audit but stops participating in
    /// overlap checks and active lookups
    pub async fn delete_fee_config(&self, config_id: i64) -> BillingResult<()> {
        info!(config_id, "Deleting fee config");

        let result = sqlx::query(
            r#"
            UPDATE customer_fee_config
            SET deleted_at = NOW(),
                updated_at = NOW(),
                version = version + 1
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(config_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Fee config not found with id: {}",
                config_id
            )));
        }
        Ok(())
    }

    /// Reject `[from, to]` if it overlaps any non-deleted config of the
    /// customer, skipping `exclude_config_id` (the row being updated)
    pub async fn validate_config_range(
        &self,
        customer_id: i64,
        effective_from: Date,
        effective_to: Option<Date>,
        exclude_config_id: Option<i64>,
    ) -> BillingResult<()> {
        let existing: Vec<CustomerFeeConfig> = sqlx::query_as(
            "SELECT * FROM customer_fee_config WHERE customer_id = $1 AND deleted_at IS NULL",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        if let Some(conflict) =
            find_overlapping(&existing, effective_from, effective_to, exclude_config_id)
        {
            return Err(BillingError::Validation(format!(
                "Fee config overlaps with existing config (id: {}) for this customer",
                conflict.id
            )));
        }
        Ok(())
    }

    /// Compute the fee the active config would charge today, optionally
    /// overriding the stored calculation params with request-supplied ones
    pub async fn preview_fee(
        &self,
        customer_id: i64,
        params_override: Option<serde_json::Value>,
    ) -> BillingResult<FeePreview> {
        info!(customer_id, "Previewing fee");

        let today = OffsetDateTime::now_utc().date();
        let config = self.get_active_config(customer_id, today).await?;
        let fee_type = self.require_active_fee_type(config.fee_type_id).await?;

        let params = params_override.or_else(|| config.calculation_params.clone());
        let calculated_fee = calculation::calculate_fee(
            &fee_type.calculation_type,
            config.monthly_fee_amount,
            params.as_ref(),
        )?;

        Ok(FeePreview {
            customer_id,
            fee_type_code: fee_type.code,
            fee_type_name: fee_type.name,
            calculation_type: fee_type.calculation_type,
            monthly_fee_amount: config.monthly_fee_amount,
            calculated_fee,
            currency: config.currency,
            calculation_params: params,
        })
    }

    async fn require_active_customer(&self, customer_id: i64) -> BillingResult<Customer> {
        let customer: Customer =
            sqlx::query_as("SELECT * FROM customer WHERE id = $1 AND deleted_at IS NULL")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("Customer not found with id: {}", customer_id))
                })?;

        if !customer.is_active() {
            return Err(BillingError::NotFound(format!(
                "Customer not active with id: {}",
                customer_id
            )));
        }
        Ok(customer)
    }

    async fn require_active_fee_type(&self, fee_type_id: i64) -> BillingResult<FeeType> {
        sqlx::query_as("SELECT * FROM fee_type WHERE id = $1 AND is_active = TRUE")
            .bind(fee_type_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "Fee type not found or inactive with id: {}",
                    fee_type_id
                ))
            })
    }
}

fn check_range_order(from: Date, to: Option<Date>) -> BillingResult<()> {
    if let Some(to) = to {
        if from > to {
            return Err(BillingError::Validation(
                "Effective from date must be before effective to date".to_string(),
            ));
        }
    }
    Ok(())
}
