//! Fee charged event pipeline
//!
//! Successful charges are published as `FeeChargedEvent`s and flow through
//! a primary/retry/dead-letter topic chain:
//!
//! - primary consumer: processes the event; failures are retried through
//!   the retry topic up to [`MAX_RETRY_ATTEMPTS`], then dead-lettered
//! - retry consumer: one extra processing attempt, failure goes straight
//!   to the dead-letter topic (the retry lane is not a second full budget)
//! - dead-letter consumer: logs for manual investigation and never
//!   re-publishes (automatic DLQ reprocessing risks poison-message loops)
//!
//! Retry counts are tracked per event id in a [`RetryStore`], which can be
//! backed by Postgres so the budget holds across consumer replicas, or by
//! process memory for single-process deployments and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::model::FeeChargeResult;
use crate::transport::{EventTransport, TopicMessage};

/// Main topic - fee charged successfully
pub const TOPIC_FEE_CHARGED: &str = "payment.fee.charged.v1";
/// Retry topic - for failed message processing
pub const TOPIC_FEE_CHARGED_RETRY: &str = "payment.fee.charged.retry.v1";
/// Dead letter topic - for messages that failed after retries
pub const TOPIC_FEE_CHARGED_DLQ: &str = "payment.fee.charged.dlq.v1";

/// Processing failures tolerated per event id before dead-lettering
pub const MAX_RETRY_ATTEMPTS: i32 = 3;

/// Wire representation of a successful charge. Exists only on the
/// transport; never persisted by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeChargedEvent {
    pub event_id: String,
    /// ISO-8601
    pub event_time: String,
    pub job_id: i64,
    pub customer_id: i64,
    pub fee_config_id: Option<i64>,
    pub charged_amount: Option<Decimal>,
    pub currency: Option<String>,
    pub billing_month: String,
    pub event_type: String,
}

impl FeeChargedEvent {
    /// Build the event for a charge result: fresh random id, current time
    pub fn from_result(result: &FeeChargeResult) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_time: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            job_id: result.job_id,
            customer_id: result.customer_id,
            fee_config_id: result.fee_config_id,
            charged_amount: result.charged_amount,
            currency: result.currency.clone(),
            billing_month: result.billing_month.clone(),
            event_type: "FEE_CHARGED".to_string(),
        }
    }
}

/// Per-event-id retry counter.
///
/// The Postgres backend keeps the retry budget consistent across consumer
/// replicas; the in-memory backend is process-local and suits tests and
/// single-instance deployments.
pub enum RetryStore {
    InMemory(Mutex<HashMap<String, i32>>),
    Postgres(PgPool),
}

impl RetryStore {
    pub fn new_in_memory() -> Self {
        Self::InMemory(Mutex::new(HashMap::new()))
    }

    pub fn new_postgres(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }

    /// Current count for an event id (0 if never failed)
    pub async fn get(&self, event_id: &str) -> BillingResult<i32> {
        match self {
            RetryStore::InMemory(map) => {
                let map = map
                    .lock()
                    .map_err(|_| BillingError::Transport("retry store poisoned".to_string()))?;
                Ok(map.get(event_id).copied().unwrap_or(0))
            }
            RetryStore::Postgres(pool) => {
                let count: Option<(i32,)> =
                    sqlx::query_as("SELECT retry_count FROM event_retry_count WHERE event_id = $1")
                        .bind(event_id)
                        .fetch_optional(pool)
                        .await?;
                Ok(count.map(|(c,)| c).unwrap_or(0))
            }
        }
    }

    /// Bump the count for an event id and return the new value
    pub async fn increment(&self, event_id: &str) -> BillingResult<i32> {
        match self {
            RetryStore::InMemory(map) => {
                let mut map = map
                    .lock()
                    .map_err(|_| BillingError::Transport("retry store poisoned".to_string()))?;
                let count = map.entry(event_id.to_string()).or_insert(0);
                *count += 1;
                Ok(*count)
            }
            RetryStore::Postgres(pool) => {
                let (count,): (i32,) = sqlx::query_as(
                    r#"
                    INSERT INTO event_retry_count (event_id, retry_count)
                    VALUES ($1, 1)
                    ON CONFLICT (event_id)
                    DO UPDATE SET retry_count = event_retry_count.retry_count + 1,
                                  updated_at = NOW()
                    RETURNING retry_count
                    "#,
                )
                .bind(event_id)
                .fetch_one(pool)
                .await?;
                Ok(count)
            }
        }
    }

    /// Drop the counter so the next occurrence of the id starts fresh
    pub async fn clear(&self, event_id: &str) -> BillingResult<()> {
        match self {
            RetryStore::InMemory(map) => {
                let mut map = map
                    .lock()
                    .map_err(|_| BillingError::Transport("retry store poisoned".to_string()))?;
                map.remove(event_id);
                Ok(())
            }
            RetryStore::Postgres(pool) => {
                sqlx::query("DELETE FROM event_retry_count WHERE event_id = $1")
                    .bind(event_id)
                    .execute(pool)
                    .await?;
                Ok(())
            }
        }
    }
}

/// Publishes `FeeChargedEvent`s for successful charges
pub struct FeeChargedProducer {
    transport: Arc<dyn EventTransport>,
}

impl FeeChargedProducer {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self { transport }
    }

    /// Publish the event for a successful charge, keyed by customer id.
    /// The charge itself already succeeded and must not be undone by a
    /// delivery failure, so publish errors are logged and swallowed.
    pub async fn publish(&self, result: &FeeChargeResult) {
        if !result.is_success() {
            return;
        }

        let event = FeeChargedEvent::from_result(result);
        info!(
            customer_id = result.customer_id,
            amount = ?result.charged_amount,
            "Publishing FeeChargedEvent"
        );

        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(event_id = %event.event_id, error = %e, "Error serializing FeeChargedEvent");
                return;
            }
        };

        match self
            .transport
            .publish(TOPIC_FEE_CHARGED, &result.customer_id.to_string(), payload)
            .await
        {
            Ok(()) => info!(topic = TOPIC_FEE_CHARGED, "FeeChargedEvent published"),
            Err(e) => error!(error = %e, "Error publishing FeeChargedEvent"),
        }
    }
}

/// The downstream business side-effect applied to each event
/// (notification, analytics - opaque to this core)
pub type EventProcessor = Arc<dyn Fn(&FeeChargedEvent) -> BillingResult<()> + Send + Sync>;

fn default_processor() -> EventProcessor {
    Arc::new(|event| {
        info!(
            customer_id = event.customer_id,
            amount = ?event.charged_amount,
            billing_month = %event.billing_month,
            "Processing fee charged event"
        );
        if event.charged_amount.is_none() {
            return Err(BillingError::Validation(
                "Charged amount cannot be null".to_string(),
            ));
        }
        Ok(())
    })
}

/// Primary-topic consumer with a bounded per-event retry budget
pub struct FeeChargedConsumer {
    transport: Arc<dyn EventTransport>,
    retry_store: RetryStore,
    processor: EventProcessor,
}

impl FeeChargedConsumer {
    pub fn new(transport: Arc<dyn EventTransport>, retry_store: RetryStore) -> Self {
        Self {
            transport,
            retry_store,
            processor: default_processor(),
        }
    }

    /// Replace the processing side-effect (used by tests and embedders)
    pub fn with_processor(mut self, processor: EventProcessor) -> Self {
        self.processor = processor;
        self
    }

    /// Drain the primary topic. Each failed message is retried in place
    /// with exponential backoff (1s, 2s, 4s) before the loop moves on;
    /// `handle_message` has already routed it to retry/DLQ by then.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<TopicMessage>) {
        while let Some(message) = rx.recv().await {
            let backoff = tokio_retry::strategy::ExponentialBackoff::from_millis(2)
                .factor(500)
                .take(3);
            let outcome =
                tokio_retry::Retry::spawn(backoff, || self.handle_message(&message.payload)).await;
            if let Err(e) = outcome {
                warn!(error = %e, "Event processing failed after transport retries");
            }
        }
    }

    /// Process one payload from the primary topic.
    ///
    /// Returns `Err` only when the event should be redelivered (it has been
    /// routed to the retry topic); terminal routings (processed, or sent to
    /// the DLQ) return `Ok`.
    pub async fn handle_message(&self, payload: &str) -> BillingResult<()> {
        info!(topic = TOPIC_FEE_CHARGED, "Received message");

        let result = self.try_process(payload).await;
        let e = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        error!(error = %e, "Error processing FeeChargedEvent");

        let Some(event_id) = extract_event_id(payload) else {
            // Without an id the retry budget cannot be tracked
            error!("Cannot extract event_id, sending to DLQ");
            self.send_to_dlq(payload, "unknown").await;
            return Ok(());
        };

        let retries = self.retry_store.increment(&event_id).await?;
        if retries >= MAX_RETRY_ATTEMPTS {
            error!(event_id = %event_id, "Max retries reached, sending to DLQ");
            self.send_to_dlq(payload, &event_id).await;
            self.retry_store.clear(&event_id).await?;
            Ok(())
        } else {
            info!(
                event_id = %event_id,
                attempt = retries,
                max = MAX_RETRY_ATTEMPTS,
                "Sending event to retry topic"
            );
            self.send_to_retry(payload, &event_id).await;
            // Surface the failure so the consumer loop's backoff redelivers
            Err(e)
        }
    }

    async fn try_process(&self, payload: &str) -> BillingResult<()> {
        let event: FeeChargedEvent = serde_json::from_str(payload)?;

        info!(
            event_id = %event.event_id,
            customer_id = event.customer_id,
            "Processing FeeChargedEvent"
        );

        // A replica may have pushed this id over the budget already
        if self.retry_store.get(&event.event_id).await? >= MAX_RETRY_ATTEMPTS {
            error!(event_id = %event.event_id, "Event exceeded max retry attempts, sending to DLQ");
            self.send_to_dlq(payload, &event.event_id).await;
            self.retry_store.clear(&event.event_id).await?;
            return Ok(());
        }

        (self.processor)(&event)?;
        self.retry_store.clear(&event.event_id).await?;

        info!(event_id = %event.event_id, "FeeChargedEvent processed successfully");
        Ok(())
    }

    async fn send_to_retry(&self, payload: &str, event_id: &str) {
        match self
            .transport
            .publish(TOPIC_FEE_CHARGED_RETRY, event_id, payload.to_string())
            .await
        {
            Ok(()) => info!(event_id = %event_id, "Event sent to retry topic"),
            Err(e) => {
                error!(error = %e, "Error sending event to retry topic");
                self.send_to_dlq(payload, event_id).await;
            }
        }
    }

    async fn send_to_dlq(&self, payload: &str, event_id: &str) {
        if let Err(e) = self
            .transport
            .publish(TOPIC_FEE_CHARGED_DLQ, event_id, payload.to_string())
            .await
        {
            error!(error = %e, "CRITICAL: Failed to send event to DLQ");
        }
    }
}

/// Retry-topic consumer: one extra processing attempt, then dead-letter
pub struct FeeChargedRetryConsumer {
    transport: Arc<dyn EventTransport>,
    processor: EventProcessor,
}

impl FeeChargedRetryConsumer {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self {
            transport,
            processor: default_processor(),
        }
    }

    pub fn with_processor(mut self, processor: EventProcessor) -> Self {
        self.processor = processor;
        self
    }

    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<TopicMessage>) {
        while let Some(message) = rx.recv().await {
            self.handle_message(&message.payload).await;
        }
    }

    pub async fn handle_message(&self, payload: &str) {
        info!(topic = TOPIC_FEE_CHARGED_RETRY, "Received message from retry topic");

        let processed = serde_json::from_str::<FeeChargedEvent>(payload)
            .map_err(BillingError::from)
            .and_then(|event| {
                info!(event_id = %event.event_id, "Retry processing FeeChargedEvent");
                (self.processor)(&event)
            });

        match processed {
            Ok(()) => info!("Retry event processed successfully"),
            Err(e) => {
                error!(error = %e, "Retry processing failed, sending to DLQ");
                let event_id = extract_event_id(payload).unwrap_or_else(|| "unknown".to_string());
                if let Err(e) = self
                    .transport
                    .publish(TOPIC_FEE_CHARGED_DLQ, &event_id, payload.to_string())
                    .await
                {
                    error!(error = %e, "CRITICAL: Failed to send retry event to DLQ");
                }
            }
        }
    }
}

/// Dead-letter consumer: a read-only terminal sink.
///
/// Only logs failed events for manual investigation. Events here must
/// never be re-processed or re-published automatically.
pub struct FeeChargedDlqConsumer;

impl FeeChargedDlqConsumer {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<TopicMessage>) {
        while let Some(message) = rx.recv().await {
            self.handle_message(&message.payload).await;
        }
    }

    pub async fn handle_message(&self, payload: &str) {
        error!(topic = TOPIC_FEE_CHARGED_DLQ, "DLQ: received failed event");

        match serde_json::from_str::<FeeChargedEvent>(payload) {
            Ok(event) => error!(
                event_id = %event.event_id,
                customer_id = event.customer_id,
                job_id = event.job_id,
                amount = ?event.charged_amount,
                currency = ?event.currency,
                billing_month = %event.billing_month,
                event_time = %event.event_time,
                "DLQ: failed event details"
            ),
            Err(e) => error!(error = %e, raw = payload, "DLQ: cannot parse event JSON"),
        }

        error!("DLQ: this event requires manual investigation and resolution");
    }
}

impl Default for FeeChargedDlqConsumer {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort event id extraction from a possibly malformed payload
fn extract_event_id(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value
        .get("event_id")
        .and_then(|id| id.as_str())
        .map(|id| id.to_string())
}
