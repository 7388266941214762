//! Event transport abstraction
//!
//! The billing core only needs named topics with keyed, at-least-once
//! publish and a subscribe primitive; the concrete broker is an external
//! collaborator. `InMemoryTransport` is the process-local implementation
//! used by the worker's default wiring and by tests. Per-key ordering is a
//! property of the transport, not something this core enforces.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{BillingError, BillingResult};

/// A message on a topic: payload plus the partitioning key it was sent with
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub key: String,
    pub payload: String,
}

/// Publish/subscribe primitive over named topics
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish a payload to a topic, keyed for per-key ordering
    async fn publish(&self, topic: &str, key: &str, payload: String) -> BillingResult<()>;

    /// Take the consumer end of a topic. One consumer per topic.
    async fn subscribe(&self, topic: &str) -> BillingResult<mpsc::UnboundedReceiver<TopicMessage>>;
}

struct Topic {
    sender: mpsc::UnboundedSender<TopicMessage>,
    receiver: Option<mpsc::UnboundedReceiver<TopicMessage>>,
}

/// Process-local transport backed by unbounded tokio channels.
/// Messages published before a subscriber attaches are buffered.
#[derive(Default)]
pub struct InMemoryTransport {
    topics: Mutex<HashMap<String, Topic>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_topic<T>(&self, topic: &str, f: impl FnOnce(&mut Topic) -> T) -> BillingResult<T> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BillingError::Transport("transport state poisoned".to_string()))?;
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            Topic {
                sender,
                receiver: Some(receiver),
            }
        });
        Ok(f(entry))
    }
}

#[async_trait]
impl EventTransport for InMemoryTransport {
    async fn publish(&self, topic: &str, key: &str, payload: String) -> BillingResult<()> {
        debug!(topic, key, "Publishing message");
        let sent = self.with_topic(topic, |t| {
            t.sender.send(TopicMessage {
                key: key.to_string(),
                payload,
            })
        })?;
        sent.map_err(|_| BillingError::Transport(format!("topic '{}' is closed", topic)))
    }

    async fn subscribe(&self, topic: &str) -> BillingResult<mpsc::UnboundedReceiver<TopicMessage>> {
        let receiver = self.with_topic(topic, |t| t.receiver.take())?;
        receiver.ok_or_else(|| {
            BillingError::Transport(format!("topic '{}' already has a consumer", topic))
        })
    }
}
