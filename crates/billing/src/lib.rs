// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Recurring customer fee billing core
//!
//! Computes and charges monthly account-keeping fees for bank customers.
//!
//! ## Features
//!
//! - **Fee Configuration**: Time-ranged per-customer fee policies with
//!   overlap validation and optimistic-version updates
//! - **Fee Calculation**: FIXED, TIERED and PERCENTAGE strategies over a
//!   base amount and JSON calculation params
//! - **Job Preparation**: One idempotent `NEW` job per active customer per
//!   billing month
//! - **Charge Execution**: Batch executor driving jobs through
//!   `NEW -> IN_PROGRESS -> {DONE, FAILED}` with an append-only attempt log
//! - **Scheduler Locks**: Postgres advisory locks so only one worker
//!   replica runs a periodic task per tick
//! - **Events**: `FeeChargedEvent` publication with bounded retry and a
//!   dead-letter topic

pub mod attempts;
pub mod calculation;
pub mod charge;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod lock;
pub mod model;
pub mod preparer;
pub mod transport;

#[cfg(test)]
mod edge_case_tests;

// Attempts
pub use attempts::AttemptService;

// Calculation
pub use calculation::{calculate_fee, CalculationType, MONEY_SCALE};

// Charge
pub use charge::{ChargeService, ExecuteSummary, DEFAULT_BATCH_SIZE};

// Config
pub use config::{
    CreateFeeConfigRequest, FeeConfigService, FeePreview, UpdateFeeConfigRequest,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    EventProcessor, FeeChargedConsumer, FeeChargedDlqConsumer, FeeChargedEvent,
    FeeChargedProducer, FeeChargedRetryConsumer, RetryStore, MAX_RETRY_ATTEMPTS,
    TOPIC_FEE_CHARGED, TOPIC_FEE_CHARGED_DLQ, TOPIC_FEE_CHARGED_RETRY,
};

// Jobs
pub use jobs::{FeeChargeStats, JobService};

// Lock
pub use lock::{LockGuard, LockService};

// Model
pub use model::{
    AttemptStatus, BillingMonth, Customer, CustomerFeeConfig, CustomerFeeJob, FeeChargeAttempt,
    FeeChargeResult, FeeJobStatus, FeeType,
};

// Preparer
pub use preparer::{JobPreparer, PrepareSummary};

// Transport
pub use transport::{EventTransport, InMemoryTransport, TopicMessage};

use std::sync::Arc;

use sqlx::PgPool;

/// Embedded schema migrations, applied by the worker on startup
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub attempts: AttemptService,
    pub charge: ChargeService,
    pub config: FeeConfigService,
    pub jobs: JobService,
    pub lock: LockService,
    pub preparer: JobPreparer,
    pub producer: FeeChargedProducer,
}

impl BillingService {
    /// Wire all services against one pool and one event transport
    pub fn new(pool: PgPool, transport: Arc<dyn EventTransport>) -> Self {
        Self {
            attempts: AttemptService::new(pool.clone()),
            charge: ChargeService::new(pool.clone()),
            config: FeeConfigService::new(pool.clone()),
            jobs: JobService::new(pool.clone()),
            lock: LockService::new(pool.clone()),
            preparer: JobPreparer::new(pool),
            producer: FeeChargedProducer::new(transport),
        }
    }
}
