//! Topic dispatch
//!
//! Both transports (push HTTP delivery and pull broker consumption) funnel
//! raw payloads through a [`Dispatcher`]. The production dispatcher is a
//! [`DispatchTable`]: a fixed map from exact topic string to handler, built
//! once at startup and never mutated afterwards.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::envelope::EventEnvelope;

/// Error type returned by handlers; carried into [`DispatchOutcome::HandlerFailed`]
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of dispatching one raw message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran and its side effects are durable
    Processed,
    /// No handler registered for the topic
    UnknownTopic,
    /// Payload could not be parsed into an envelope; retrying cannot help
    Malformed(String),
    /// Handler returned an error; the message may succeed on redelivery
    HandlerFailed(String),
}

impl DispatchOutcome {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Processed => "processed",
            DispatchOutcome::UnknownTopic => "unknown_topic",
            DispatchOutcome::Malformed(_) => "malformed",
            DispatchOutcome::HandlerFailed(_) => "handler_failed",
        }
    }
}

/// Transport-independent entry point for a raw message
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome;
}

/// Per-topic handler
///
/// Must return `Ok(())` only once its effects have been committed; the
/// transport acknowledges the message immediately afterwards.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: EventEnvelope) -> Result<(), HandlerError>;
}

/// Immutable topic → handler table
#[derive(Clone)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    /// Registered topics, sorted (used as the broker binding list)
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl Dispatcher for DispatchTable {
    async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(topic) else {
            return DispatchOutcome::UnknownTopic;
        };

        let envelope = match EventEnvelope::from_slice(topic, payload) {
            Ok(envelope) => envelope,
            Err(e) => return DispatchOutcome::Malformed(e.to_string()),
        };

        match handler.handle(envelope).await {
            Ok(()) => DispatchOutcome::Processed,
            Err(e) => DispatchOutcome::HandlerFailed(e.to_string()),
        }
    }
}

/// Collects routes before freezing them into a [`DispatchTable`]
#[derive(Default)]
pub struct DispatchTableBuilder {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl DispatchTableBuilder {
    /// Register a handler; a later route for the same topic replaces the earlier one
    pub fn route(mut self, topic: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        let topic = topic.into();
        if self.handlers.insert(topic.clone(), handler).is_some() {
            tracing::warn!(topic = %topic, "Duplicate dispatch route replaced");
        }
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self.handlers,
        }
    }
}
