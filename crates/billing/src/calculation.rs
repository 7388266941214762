//! Fee calculation engine
//!
//! A closed sum type over the three supported calculation kinds with a pure
//! function per variant. Adding a fee kind means extending the enum, not
//! registering anything at runtime. All monetary arithmetic stays in
//! `Decimal`; only the percentage product is re-rounded (half-up, 2 dp),
//! the other variants return configured values exactly as stored.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{BillingError, BillingResult};

/// Currency scale for percentage computations
pub const MONEY_SCALE: u32 = 2;

/// Supported fee calculation kinds, keyed by the `fee_type.calculation_type`
/// discriminator column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationType {
    /// Flat monthly amount from the config, no parameters
    Fixed,
    /// Balance-tier lookup: first matching tier's fee wins
    Tiered,
    /// Percentage of balance, clamped to optional min/max
    Percentage,
}

impl CalculationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationType::Fixed => "FIXED",
            CalculationType::Tiered => "TIERED",
            CalculationType::Percentage => "PERCENTAGE",
        }
    }

    /// Parse the discriminator stored on a fee type. An unknown value is a
    /// data-configuration bug, not bad user input, so it maps to a business
    /// error rather than a validation error.
    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "FIXED" => Ok(CalculationType::Fixed),
            "TIERED" => Ok(CalculationType::Tiered),
            "PERCENTAGE" => Ok(CalculationType::Percentage),
            other => Err(BillingError::business(
                "INVALID_CALCULATION_TYPE",
                format!("No strategy found for calculation type: {}", other),
            )),
        }
    }
}

impl FromStr for CalculationType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Calculate the fee owed for one billing month.
///
/// Validates params first (fails fast on missing/malformed keys), then
/// dispatches on the calculation type.
pub fn calculate_fee(
    calculation_type: &str,
    base_monthly_amount: Decimal,
    params: Option<&Value>,
) -> BillingResult<Decimal> {
    let calc = CalculationType::parse(calculation_type)?;

    let empty = Map::new();
    let params = match params {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => &empty,
        Some(other) => {
            return Err(BillingError::Validation(format!(
                "Calculation params must be a JSON object, got: {}",
                other
            )))
        }
    };

    validate_params(calc, params)?;
    let fee = match calc {
        CalculationType::Fixed => base_monthly_amount,
        CalculationType::Tiered => tiered_fee(base_monthly_amount, params)?,
        CalculationType::Percentage => percentage_fee(params)?,
    };

    debug!(
        calculation_type = calc.as_str(),
        fee = %fee,
        "Calculated fee"
    );
    Ok(fee)
}

/// Validate the calculation params for the given kind without computing
pub fn validate_params(calc: CalculationType, params: &Map<String, Value>) -> BillingResult<()> {
    match calc {
        // Fixed monthly fee needs no additional parameters
        CalculationType::Fixed => Ok(()),
        CalculationType::Tiered => validate_tiered_params(params),
        CalculationType::Percentage => validate_percentage_params(params),
    }
}

/// Tiered balance fee: walk the configured tiers in order, the first tier
/// where `balance >= from && (to is null || balance <= to)` wins. No match
/// is an explicit fallback to the base amount, logged as a warning.
///
/// Example params:
/// ```json
/// {
///   "balance": 10000000,
///   "tiers": [
///     {"from": 0, "to": 50000000, "fee": 10000},
///     {"from": 50000001, "to": 200000000, "fee": 20000},
///     {"from": 200000001, "to": null, "fee": 50000}
///   ]
/// }
/// ```
fn tiered_fee(base_monthly_amount: Decimal, params: &Map<String, Value>) -> BillingResult<Decimal> {
    let balance = decimal_param(params, "balance")?;
    let tiers = tiers_param(params)?;

    for tier in tiers {
        let from = tier_decimal(tier, "from")?;
        let to = match tier.get("to") {
            Some(Value::Null) | None => None,
            Some(value) => Some(to_decimal(value, "to")?),
        };

        let matches_from = balance >= from;
        let matches_to = to.map_or(true, |to| balance <= to);

        if matches_from && matches_to {
            let fee = tier_decimal(tier, "fee")?;
            debug!(%balance, %from, to = ?to, %fee, "Balance matched tier");
            return Ok(fee);
        }
    }

    warn!(
        %balance,
        fallback = %base_monthly_amount,
        "No matching tier found, defaulting to monthly fee amount"
    );
    Ok(base_monthly_amount)
}

/// Percentage-of-balance fee: `round_half_up(balance * percentage, 2)`,
/// then clamp to `[min_fee, max_fee]` when provided (min first, then max).
///
/// Example params:
/// ```json
/// {"balance": 100000000, "percentage": 0.001, "min_fee": 10000, "max_fee": 50000}
/// ```
fn percentage_fee(params: &Map<String, Value>) -> BillingResult<Decimal> {
    let balance = decimal_param(params, "balance")?;
    let percentage = decimal_param(params, "percentage")?;

    let mut fee = (balance * percentage)
        .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);

    if let Some(min_fee) = opt_decimal_param(params, "min_fee")? {
        if fee < min_fee {
            debug!(raw = %fee, min = %min_fee, "Applying min cap");
            fee = min_fee;
        }
    }
    if let Some(max_fee) = opt_decimal_param(params, "max_fee")? {
        if fee > max_fee {
            debug!(raw = %fee, max = %max_fee, "Applying max cap");
            fee = max_fee;
        }
    }

    Ok(fee)
}

fn validate_tiered_params(params: &Map<String, Value>) -> BillingResult<()> {
    if params.is_empty() {
        return Err(BillingError::Validation(
            "Calculation params are required for tiered fee".to_string(),
        ));
    }
    decimal_param(params, "balance")?;

    let tiers = tiers_param(params)?;
    if tiers.is_empty() {
        return Err(BillingError::Validation(
            "'tiers' must not be empty".to_string(),
        ));
    }
    for tier in tiers {
        tier_decimal(tier, "from")?;
        tier_decimal(tier, "fee")?;
    }
    Ok(())
}

fn validate_percentage_params(params: &Map<String, Value>) -> BillingResult<()> {
    if params.is_empty() {
        return Err(BillingError::Validation(
            "Calculation params are required for percentage fee".to_string(),
        ));
    }
    decimal_param(params, "balance")?;

    let percentage = decimal_param(params, "percentage")?;
    if percentage <= Decimal::ZERO {
        return Err(BillingError::Validation(
            "Percentage must be greater than 0".to_string(),
        ));
    }
    if percentage > Decimal::ONE {
        return Err(BillingError::Validation(
            "Percentage must be less than or equal to 1 (100%)".to_string(),
        ));
    }
    Ok(())
}

fn tiers_param(params: &Map<String, Value>) -> BillingResult<&Vec<Value>> {
    match params.get("tiers") {
        Some(Value::Array(tiers)) => Ok(tiers),
        Some(_) => Err(BillingError::Validation(
            "'tiers' must be an array".to_string(),
        )),
        None => Err(BillingError::Validation(
            "'tiers' is required in calculation params for tiered fee".to_string(),
        )),
    }
}

fn tier_decimal(tier: &Value, key: &str) -> BillingResult<Decimal> {
    let value = tier
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| BillingError::Validation(format!("Tier is missing '{}'", key)))?;
    to_decimal(value, key)
}

fn decimal_param(params: &Map<String, Value>, key: &str) -> BillingResult<Decimal> {
    let value = params.get(key).filter(|v| !v.is_null()).ok_or_else(|| {
        BillingError::Validation(format!("'{}' is required in calculation params", key))
    })?;
    to_decimal(value, key)
}

fn opt_decimal_param(params: &Map<String, Value>, key: &str) -> BillingResult<Option<Decimal>> {
    match params.get(key) {
        Some(Value::Null) | None => Ok(None),
        Some(value) => to_decimal(value, key).map(Some),
    }
}

/// JSON numbers are converted through their decimal string form so values
/// like `0.001` stay exact instead of round-tripping through binary floats
fn to_decimal(value: &Value, key: &str) -> BillingResult<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|_| BillingError::Validation(format!("Invalid '{}' value: {}", key, n))),
        _ => Err(BillingError::Validation(format!(
            "Invalid '{}' value: expected a number",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_fixed_returns_base_unmodified() {
        let fee = calculate_fee("FIXED", dec!(55000), None).unwrap();
        assert_eq!(fee, dec!(55000));

        // Parameters are ignored for fixed fees, empty or not
        let fee = calculate_fee("FIXED", dec!(55000), Some(&json!({}))).unwrap();
        assert_eq!(fee, dec!(55000));
        let fee = calculate_fee("FIXED", dec!(55000), Some(&json!({"balance": 1}))).unwrap();
        assert_eq!(fee, dec!(55000));
    }

    #[test]
    fn test_unknown_calculation_type_is_business_error() {
        let err = calculate_fee("WEIGHTED", dec!(100), None).unwrap_err();
        assert_eq!(err.code(), "INVALID_CALCULATION_TYPE");
    }

    #[test]
    fn test_percentage_basic() {
        let params = json!({"balance": 100_000_000, "percentage": 0.001});
        let fee = calculate_fee("PERCENTAGE", dec!(0), Some(&params)).unwrap();
        assert_eq!(fee, dec!(100000.00));
    }

    #[test]
    fn test_percentage_min_cap_applied() {
        let params = json!({"balance": 100_000_000, "percentage": 0.001, "min_fee": 200_000});
        let fee = calculate_fee("PERCENTAGE", dec!(0), Some(&params)).unwrap();
        assert_eq!(fee, dec!(200000));
    }

    #[test]
    fn test_percentage_max_cap_applied() {
        let params = json!({"balance": 100_000_000, "percentage": 0.001, "max_fee": 50_000});
        let fee = calculate_fee("PERCENTAGE", dec!(0), Some(&params)).unwrap();
        assert_eq!(fee, dec!(50000));
    }

    #[test]
    fn test_percentage_rounds_half_up() {
        // 16700 * 0.00015 = 2.505, which must round up to 2.51
        let params = json!({"balance": 16700, "percentage": 0.00015});
        let fee = calculate_fee("PERCENTAGE", dec!(0), Some(&params)).unwrap();
        assert_eq!(fee, dec!(2.51));
    }

    #[test]
    fn test_percentage_validation() {
        let err = calculate_fee("PERCENTAGE", dec!(0), None).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let missing_pct = json!({"balance": 1000});
        let err = calculate_fee("PERCENTAGE", dec!(0), Some(&missing_pct)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let zero_pct = json!({"balance": 1000, "percentage": 0});
        let err = calculate_fee("PERCENTAGE", dec!(0), Some(&zero_pct)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let over_one = json!({"balance": 1000, "percentage": 1.5});
        let err = calculate_fee("PERCENTAGE", dec!(0), Some(&over_one)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        // Exactly 100% is allowed
        let one = json!({"balance": 1000, "percentage": 1});
        assert_eq!(calculate_fee("PERCENTAGE", dec!(0), Some(&one)).unwrap(), dec!(1000.00));
    }

    fn sample_tiers() -> Value {
        json!([
            {"from": 0, "to": 50_000_000, "fee": 10_000},
            {"from": 50_000_001, "to": 200_000_000, "fee": 20_000}
        ])
    }

    #[test]
    fn test_tiered_first_matching_tier_wins() {
        let params = json!({"balance": 30_000_000, "tiers": sample_tiers()});
        let fee = calculate_fee("TIERED", dec!(99999), Some(&params)).unwrap();
        assert_eq!(fee, dec!(10000));

        let params = json!({"balance": 150_000_000, "tiers": sample_tiers()});
        let fee = calculate_fee("TIERED", dec!(99999), Some(&params)).unwrap();
        assert_eq!(fee, dec!(20000));
    }

    #[test]
    fn test_tiered_boundaries_are_inclusive() {
        let params = json!({"balance": 50_000_000, "tiers": sample_tiers()});
        let fee = calculate_fee("TIERED", dec!(99999), Some(&params)).unwrap();
        assert_eq!(fee, dec!(10000));

        let params = json!({"balance": 50_000_001, "tiers": sample_tiers()});
        let fee = calculate_fee("TIERED", dec!(99999), Some(&params)).unwrap();
        assert_eq!(fee, dec!(20000));
    }

    #[test]
    fn test_tiered_open_ended_tier() {
        let tiers = json!([{"from": 200_000_001, "to": null, "fee": 50_000}]);
        let params = json!({"balance": 999_000_000_000i64, "tiers": tiers});
        let fee = calculate_fee("TIERED", dec!(0), Some(&params)).unwrap();
        assert_eq!(fee, dec!(50000));
    }

    #[test]
    fn test_tiered_no_match_falls_back_to_base() {
        let params = json!({"balance": 500_000_000, "tiers": sample_tiers()});
        let fee = calculate_fee("TIERED", dec!(30000), Some(&params)).unwrap();
        assert_eq!(fee, dec!(30000));
    }

    #[test]
    fn test_tiered_validation() {
        let err = calculate_fee("TIERED", dec!(0), None).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let no_balance = json!({"tiers": sample_tiers()});
        let err = calculate_fee("TIERED", dec!(0), Some(&no_balance)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let empty_tiers = json!({"balance": 100, "tiers": []});
        let err = calculate_fee("TIERED", dec!(0), Some(&empty_tiers)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let missing_fee = json!({"balance": 100, "tiers": [{"from": 0, "to": 10}]});
        let err = calculate_fee("TIERED", dec!(0), Some(&missing_fee)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_calculation_type_round_trip() {
        for s in ["FIXED", "TIERED", "PERCENTAGE"] {
            assert_eq!(CalculationType::parse(s).unwrap().as_str(), s);
        }
    }
}
