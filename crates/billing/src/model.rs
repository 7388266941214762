//! Core data model for the recurring fee billing system
//!
//! Row types map 1:1 to the tables created by `migrations/0001_init.sql`.
//! Mutable entities (`customer_fee_config`, `customer_fee_job`) carry an
//! optimistic `version` counter; writers compare-and-swap on it and reject
//! stale updates instead of silently overwriting.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

/// A `yyyy-MM` billing period identifying which month's fee a job represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BillingMonth {
    year: i32,
    month: u8,
}

impl BillingMonth {
    pub fn new(year: i32, month: u8) -> BillingResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(BillingError::Validation(format!(
                "Invalid billing month: {}",
                month
            )));
        }
        Ok(Self { year, month })
    }

    /// The billing month containing the given date
    pub fn from_date(date: Date) -> Self {
        Self {
            year: date.year(),
            month: date.month() as u8,
        }
    }

    /// The billing month for the current UTC date
    pub fn current() -> Self {
        Self::from_date(OffsetDateTime::now_utc().date())
    }

    /// First calendar day of the month; fee configs are resolved against it
    pub fn first_day(&self) -> Date {
        // month is validated on construction, so this cannot fail
        #[allow(clippy::unwrap_used)]
        Date::from_calendar_date(self.year, Month::try_from(self.month).unwrap(), 1).unwrap()
    }

    /// Deterministic key preventing duplicate job creation for (customer, month)
    pub fn idempotency_key(&self, customer_id: i64) -> String {
        format!("{}_{}", customer_id, self)
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingMonth {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| BillingError::Validation(format!("Invalid billing month: {}", s)))?;
        let year: i32 = year
            .parse()
            .map_err(|_| BillingError::Validation(format!("Invalid billing month: {}", s)))?;
        let month: u8 = month
            .parse()
            .map_err(|_| BillingError::Validation(format!("Invalid billing month: {}", s)))?;
        Self::new(year, month)
    }
}

/// Lifecycle of a fee job: `NEW -> IN_PROGRESS -> {DONE, FAILED}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeJobStatus {
    New,
    InProgress,
    Done,
    Failed,
}

impl fmt::Display for FeeJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeeJobStatus::New => "NEW",
            FeeJobStatus::InProgress => "IN_PROGRESS",
            FeeJobStatus::Done => "DONE",
            FeeJobStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a single charge attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Success,
    Failed,
}

/// Bank customer (read-side only; CRUD lives outside this core)
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Customer {
    pub id: i64,
    pub full_name: String,
    pub email: String,
    pub phone_number: String,
    /// ACTIVE or INACTIVE
    pub status: String,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
    pub version: i64,
}

impl Customer {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE" && self.deleted_at.is_none()
    }
}

/// Immutable fee catalog entry; deactivated rather than deleted
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeeType {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    /// FIXED, TIERED or PERCENTAGE
    pub calculation_type: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
}

/// A time-ranged policy binding one customer to one fee type
///
/// At most one non-deleted config may be effective for a customer on any
/// date. Policy changes create a new row with a later `effective_from`
/// instead of mutating the old one.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CustomerFeeConfig {
    pub id: i64,
    pub customer_id: i64,
    pub fee_type_id: i64,
    pub monthly_fee_amount: Decimal,
    pub currency: String,
    pub effective_from: Date,
    /// Inclusive; `None` means open-ended (treated as +infinity)
    pub effective_to: Option<Date>,
    /// Schema depends on the fee type's calculation discriminator
    pub calculation_params: Option<serde_json::Value>,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
    pub version: i64,
}

impl CustomerFeeConfig {
    /// Whether this config applies on the given date
    pub fn is_effective_on(&self, date: Date) -> bool {
        if self.deleted_at.is_some() {
            return false;
        }
        date >= self.effective_from && self.effective_to.map_or(true, |to| date <= to)
    }
}

/// One unit of "this customer owes a fee for this billing month"
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CustomerFeeJob {
    pub id: i64,
    pub customer_id: i64,
    /// Format: yyyy-MM
    pub billing_month: String,
    /// Null until computed by the charge executor
    pub amount: Option<Decimal>,
    pub status: FeeJobStatus,
    /// `{customer_id}_{billing_month}`, unique
    pub idempotency_key: String,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
    pub version: i64,
}

/// Append-only audit row, one per charge execution attempt against a job
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeeChargeAttempt {
    pub id: i64,
    pub job_id: i64,
    pub customer_id: i64,
    /// Denormalized from the job to avoid joins on the audit path
    pub billing_month: String,
    pub amount: Decimal,
    /// Monotonic per job, starting at 1
    pub attempt_no: i32,
    pub status: AttemptStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub external_txn_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Result of a `charge_fee` call, successful or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeChargeResult {
    pub job_id: i64,
    pub customer_id: i64,
    pub fee_config_id: Option<i64>,
    pub charged_amount: Option<Decimal>,
    pub currency: Option<String>,
    pub billing_month: String,
    /// SUCCESS or FAILED
    pub status: String,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub charged_at: OffsetDateTime,
}

impl FeeChargeResult {
    pub fn is_success(&self) -> bool {
        self.status == "SUCCESS"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_billing_month_display_and_parse() {
        let month = BillingMonth::new(2025, 1).unwrap();
        assert_eq!(month.to_string(), "2025-01");
        assert_eq!("2025-01".parse::<BillingMonth>().unwrap(), month);
        assert_eq!(month.first_day(), date!(2025 - 01 - 01));
    }

    #[test]
    fn test_billing_month_rejects_garbage() {
        assert!("2025-13".parse::<BillingMonth>().is_err());
        assert!("2025".parse::<BillingMonth>().is_err());
        assert!("202x-01".parse::<BillingMonth>().is_err());
    }

    #[test]
    fn test_idempotency_key_format() {
        let month = BillingMonth::new(2025, 3).unwrap();
        assert_eq!(month.idempotency_key(42), "42_2025-03");
    }

    #[test]
    fn test_customer_is_active() {
        let customer = Customer {
            id: 1,
            full_name: "Nguyen Van A".to_string(),
            email: "a@example.com".to_string(),
            phone_number: "0900000000".to_string(),
            status: "ACTIVE".to_string(),
            deleted_at: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
            version: 0,
        };
        assert!(customer.is_active());

        let inactive = Customer {
            status: "INACTIVE".to_string(),
            ..customer.clone()
        };
        assert!(!inactive.is_active());

        // Deleted customers are never active, whatever their status says
        let deleted = Customer {
            deleted_at: Some(OffsetDateTime::now_utc()),
            ..customer
        };
        assert!(!deleted.is_active());
    }

    #[test]
    fn test_config_effective_window() {
        let config = CustomerFeeConfig {
            id: 1,
            customer_id: 1,
            fee_type_id: 1,
            monthly_fee_amount: Decimal::new(10_000, 0),
            currency: "VND".to_string(),
            effective_from: date!(2025 - 01 - 01),
            effective_to: Some(date!(2025 - 06 - 30)),
            calculation_params: None,
            deleted_at: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
            version: 0,
        };

        assert!(config.is_effective_on(date!(2025 - 01 - 01)));
        assert!(config.is_effective_on(date!(2025 - 06 - 30)));
        assert!(!config.is_effective_on(date!(2024 - 12 - 31)));
        assert!(!config.is_effective_on(date!(2025 - 07 - 01)));

        let open_ended = CustomerFeeConfig {
            effective_to: None,
            ..config.clone()
        };
        assert!(open_ended.is_effective_on(date!(2099 - 12 - 31)));

        let deleted = CustomerFeeConfig {
            deleted_at: Some(OffsetDateTime::now_utc()),
            ..config
        };
        assert!(!deleted.is_effective_on(date!(2025 - 02 - 01)));
    }
}
