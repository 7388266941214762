// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Fee Billing Core
//!
//! Tests critical boundary conditions in:
//! - Fee calculation (rounding, clamp ordering, tier boundaries)
//! - Billing month parsing and date resolution
//! - Config range overlap at endpoints
//! - Event retry budgets and dead-letter routing
//! - Status serialization across the DB and event wire formats

#[cfg(test)]
mod calculation_boundary_tests {
    use crate::calculation::calculate_fee;
    use crate::error::BillingError;
    use rust_decimal_macros::dec;
    use serde_json::json;

    // =========================================================================
    // Percentage min cap is applied before max cap: a min above the max is
    // clamped back down to the max
    // =========================================================================
    #[test]
    fn test_percentage_min_above_max_resolves_to_max() {
        let params = json!({
            "balance": 1000,
            "percentage": 0.001,
            "min_fee": 100_000,
            "max_fee": 50_000
        });
        let fee = calculate_fee("PERCENTAGE", dec!(0), Some(&params)).unwrap();
        assert_eq!(fee, dec!(50000));
    }

    // =========================================================================
    // Midpoint rounding is away from zero, not banker's: x.xx5 rounds up
    // =========================================================================
    #[test]
    fn test_percentage_midpoint_always_rounds_up() {
        // 12500 * 0.0001 = 1.25 exactly, stays 1.25
        let exact = json!({"balance": 12_500, "percentage": 0.0001});
        assert_eq!(
            calculate_fee("PERCENTAGE", dec!(0), Some(&exact)).unwrap(),
            dec!(1.25)
        );

        // 2.5 with scale 0 digits at play: 25000 * 0.0001 = 2.50
        // and 2.505-style midpoints round to 2.51, never 2.50
        let midpoint = json!({"balance": 16_700, "percentage": 0.00015});
        assert_eq!(
            calculate_fee("PERCENTAGE", dec!(0), Some(&midpoint)).unwrap(),
            dec!(2.51)
        );
    }

    // =========================================================================
    // Zero balance with a min cap still yields the minimum fee
    // =========================================================================
    #[test]
    fn test_percentage_zero_balance_hits_min_cap() {
        let params = json!({"balance": 0, "percentage": 0.001, "min_fee": 10_000});
        let fee = calculate_fee("PERCENTAGE", dec!(0), Some(&params)).unwrap();
        assert_eq!(fee, dec!(10000));
    }

    // =========================================================================
    // Tier matching walks in configured order; a catch-all first tier
    // shadows every later one
    // =========================================================================
    #[test]
    fn test_tiered_order_is_significant() {
        let params = json!({
            "balance": 75_000_000,
            "tiers": [
                {"from": 0, "to": null, "fee": 1},
                {"from": 50_000_000, "to": 100_000_000, "fee": 99}
            ]
        });
        let fee = calculate_fee("TIERED", dec!(0), Some(&params)).unwrap();
        assert_eq!(fee, dec!(1));
    }

    // =========================================================================
    // A balance below every tier's `from` falls back to the base amount
    // =========================================================================
    #[test]
    fn test_tiered_balance_below_all_tiers_falls_back() {
        let params = json!({
            "balance": 100,
            "tiers": [{"from": 1_000, "to": null, "fee": 50_000}]
        });
        let fee = calculate_fee("TIERED", dec!(7777), Some(&params)).unwrap();
        assert_eq!(fee, dec!(7777));
    }

    // =========================================================================
    // Params that are valid JSON but not an object are rejected up front
    // =========================================================================
    #[test]
    fn test_non_object_params_rejected() {
        let err = calculate_fee("TIERED", dec!(0), Some(&json!([1, 2, 3]))).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = calculate_fee("PERCENTAGE", dec!(0), Some(&json!("0.001"))).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    // =========================================================================
    // String-typed numbers inside params are invalid, not coerced
    // =========================================================================
    #[test]
    fn test_stringly_typed_numbers_rejected() {
        let params = json!({"balance": "1000", "percentage": 0.001});
        let err = calculate_fee("PERCENTAGE", dec!(0), Some(&params)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}

#[cfg(test)]
mod billing_month_tests {
    use crate::model::BillingMonth;
    use time::macros::date;

    // =========================================================================
    // Month 0 and month 13 are both outside the valid range
    // =========================================================================
    #[test]
    fn test_month_bounds() {
        assert!("2025-00".parse::<BillingMonth>().is_err());
        assert!("2025-13".parse::<BillingMonth>().is_err());
        assert!("2025-01".parse::<BillingMonth>().is_ok());
        assert!("2025-12".parse::<BillingMonth>().is_ok());
    }

    // =========================================================================
    // Fee configs resolve against the first day even in leap February
    // =========================================================================
    #[test]
    fn test_first_day_of_leap_february() {
        let month: BillingMonth = "2024-02".parse().unwrap();
        assert_eq!(month.first_day(), date!(2024 - 02 - 01));
    }

    // =========================================================================
    // Keys for distinct (customer, month) pairs never collide
    // =========================================================================
    #[test]
    fn test_idempotency_keys_are_distinct() {
        let jan: BillingMonth = "2025-01".parse().unwrap();
        let feb: BillingMonth = "2025-02".parse().unwrap();

        let keys = [
            jan.idempotency_key(1),
            jan.idempotency_key(2),
            feb.idempotency_key(1),
            feb.idempotency_key(2),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    // =========================================================================
    // December/January boundary: from_date lands in the right month
    // =========================================================================
    #[test]
    fn test_from_date_at_year_boundary() {
        assert_eq!(
            BillingMonth::from_date(date!(2024 - 12 - 31)).to_string(),
            "2024-12"
        );
        assert_eq!(
            BillingMonth::from_date(date!(2025 - 01 - 01)).to_string(),
            "2025-01"
        );
    }
}

#[cfg(test)]
mod overlap_boundary_tests {
    use crate::config::ranges_overlap;
    use time::macros::date;

    // =========================================================================
    // Single-day ranges: identical days overlap, adjacent days do not
    // =========================================================================
    #[test]
    fn test_single_day_ranges() {
        let day = date!(2025 - 05 - 01);
        assert!(ranges_overlap(day, Some(day), day, Some(day)));
        assert!(!ranges_overlap(
            day,
            Some(day),
            date!(2025 - 05 - 02),
            Some(date!(2025 - 05 - 02)),
        ));
    }

    // =========================================================================
    // Overlap is symmetric in its two ranges
    // =========================================================================
    #[test]
    fn test_overlap_is_symmetric() {
        let cases = [
            (
                date!(2025 - 01 - 01),
                Some(date!(2025 - 06 - 30)),
                date!(2025 - 06 - 30),
                None,
            ),
            (
                date!(2025 - 01 - 01),
                None,
                date!(2024 - 01 - 01),
                Some(date!(2024 - 12 - 31)),
            ),
        ];
        for (a1, a2, b1, b2) in cases {
            assert_eq!(
                ranges_overlap(a1, a2, b1, b2),
                ranges_overlap(b1, b2, a1, a2),
            );
        }
    }
}

#[cfg(test)]
mod event_pipeline_tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::error::BillingError;
    use crate::events::{
        EventProcessor, FeeChargedConsumer, FeeChargedEvent, RetryStore, MAX_RETRY_ATTEMPTS,
        TOPIC_FEE_CHARGED_DLQ, TOPIC_FEE_CHARGED_RETRY,
    };
    use crate::model::FeeChargeResult;
    use crate::transport::{EventTransport, InMemoryTransport};
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn result_for_job(job_id: i64) -> FeeChargeResult {
        FeeChargeResult {
            job_id,
            customer_id: 1,
            fee_config_id: Some(1),
            charged_amount: Some(dec!(10000)),
            currency: Some("VND".to_string()),
            billing_month: "2025-01".to_string(),
            status: "SUCCESS".to_string(),
            error_message: None,
            charged_at: OffsetDateTime::now_utc(),
        }
    }

    fn failing_processor() -> EventProcessor {
        Arc::new(|_| Err(BillingError::Transport("down".to_string())))
    }

    // =========================================================================
    // Retry budgets are tracked per event id, not globally
    // =========================================================================
    #[tokio::test]
    async fn test_retry_budgets_are_independent_per_event() {
        let transport = Arc::new(InMemoryTransport::new());
        let consumer = FeeChargedConsumer::new(transport.clone(), RetryStore::new_in_memory())
            .with_processor(failing_processor());

        let a = serde_json::to_string(&FeeChargedEvent::from_result(&result_for_job(1))).unwrap();
        let b = serde_json::to_string(&FeeChargedEvent::from_result(&result_for_job(2))).unwrap();

        // Two failures for A, one for B: neither reaches the budget
        assert!(consumer.handle_message(&a).await.is_err());
        assert!(consumer.handle_message(&a).await.is_err());
        assert!(consumer.handle_message(&b).await.is_err());

        let mut dlq = transport.subscribe(TOPIC_FEE_CHARGED_DLQ).await.unwrap();
        assert!(dlq.try_recv().is_err());

        // A's third failure dead-letters A only
        consumer.handle_message(&a).await.unwrap();
        assert!(dlq.try_recv().is_ok());
        assert!(dlq.try_recv().is_err());
    }

    // =========================================================================
    // An event already over budget (e.g. from another replica) is routed
    // to the DLQ before the processor runs
    // =========================================================================
    #[tokio::test]
    async fn test_over_budget_event_skips_processing() {
        let transport = Arc::new(InMemoryTransport::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counting: EventProcessor = {
            let calls = calls.clone();
            Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let store = RetryStore::new_in_memory();
        let event = FeeChargedEvent::from_result(&result_for_job(3));
        for _ in 0..MAX_RETRY_ATTEMPTS {
            store.increment(&event.event_id).await.unwrap();
        }

        let consumer =
            FeeChargedConsumer::new(transport.clone(), store).with_processor(counting);
        let payload = serde_json::to_string(&event).unwrap();
        consumer.handle_message(&payload).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let mut dlq = transport.subscribe(TOPIC_FEE_CHARGED_DLQ).await.unwrap();
        assert_eq!(dlq.try_recv().unwrap().key, event.event_id);
    }

    // =========================================================================
    // A success between failures resets the budget: failures never
    // accumulate across successful deliveries of the same id
    // =========================================================================
    #[tokio::test]
    async fn test_success_resets_retry_budget() {
        let transport = Arc::new(InMemoryTransport::new());
        let fail_first = Arc::new(AtomicU32::new(0));
        let flaky: EventProcessor = {
            let fail_first = fail_first.clone();
            Arc::new(move |_| {
                if fail_first.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BillingError::Transport("down".to_string()))
                } else {
                    Ok(())
                }
            })
        };

        let consumer = FeeChargedConsumer::new(transport.clone(), RetryStore::new_in_memory())
            .with_processor(flaky);

        let event = FeeChargedEvent::from_result(&result_for_job(4));
        let payload = serde_json::to_string(&event).unwrap();

        // Two failures, then a success
        assert!(consumer.handle_message(&payload).await.is_err());
        assert!(consumer.handle_message(&payload).await.is_err());
        consumer.handle_message(&payload).await.unwrap();

        // Nothing dead-lettered, and the retry topic saw exactly two routings
        let mut dlq = transport.subscribe(TOPIC_FEE_CHARGED_DLQ).await.unwrap();
        assert!(dlq.try_recv().is_err());
        let mut retry = transport.subscribe(TOPIC_FEE_CHARGED_RETRY).await.unwrap();
        assert!(retry.try_recv().is_ok());
        assert!(retry.try_recv().is_ok());
        assert!(retry.try_recv().is_err());
    }
}

#[cfg(test)]
mod status_serialization_tests {
    use crate::model::{AttemptStatus, FeeJobStatus};

    // =========================================================================
    // DB column values and JSON wire values use the same SCREAMING_SNAKE
    // spelling as Display
    // =========================================================================
    #[test]
    fn test_job_status_spellings_agree() {
        let cases = [
            (FeeJobStatus::New, "NEW"),
            (FeeJobStatus::InProgress, "IN_PROGRESS"),
            (FeeJobStatus::Done, "DONE"),
            (FeeJobStatus::Failed, "FAILED"),
        ];
        for (status, expected) in cases {
            assert_eq!(status.to_string(), expected);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(expected.to_string())
            );
        }
    }

    #[test]
    fn test_attempt_status_spellings_agree() {
        assert_eq!(
            serde_json::to_value(AttemptStatus::Success).unwrap(),
            serde_json::Value::String("SUCCESS".to_string())
        );
        assert_eq!(
            serde_json::to_value(AttemptStatus::Failed).unwrap(),
            serde_json::Value::String("FAILED".to_string())
        );
    }
}
