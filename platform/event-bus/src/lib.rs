//! # Event Ingestion Bus
//!
//! Platform-level plumbing for services that *consume* events from many
//! upstream producers.
//!
//! ## Layers
//!
//! - **Envelope** ([`EventEnvelope`]): tolerant parsing of producer payloads,
//!   with documented fallbacks for every missing field
//! - **Dispatch** ([`DispatchTable`]): immutable topic → handler table,
//!   exact-match lookup, built once at startup
//! - **Broker seam** ([`BrokerConnector`], [`BrokerSession`], [`Delivery`]):
//!   connect + topology declaration, manual-ack delivery, dead-lettering
//! - **Pull consumer** ([`PullConsumer`]): reconnecting state machine with
//!   bounded exponential backoff and cooperative shutdown
//!
//! ## Implementations
//!
//! - **NatsConnector**: production broker using NATS JetStream
//! - **InMemoryBroker**: test/dev broker with failure injection
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{
//!     ConsumerConfig, DispatchTable, EventEnvelope, EventHandler, HandlerError,
//!     NatsConnector, PullConsumer,
//! };
//! use std::sync::Arc;
//!
//! struct PrintHandler;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for PrintHandler {
//!     async fn handle(&self, envelope: EventEnvelope) -> Result<(), HandlerError> {
//!         println!("{} from {}", envelope.event_type, envelope.source);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let table = DispatchTable::builder()
//!     .route("user.created", Arc::new(PrintHandler))
//!     .build();
//!
//! let config = ConsumerConfig::new("AUDIT_EVENTS", "audit-trail", table.topics());
//! let connector = NatsConnector::new("nats://localhost:4222");
//! let handle = PullConsumer::new(connector, Arc::new(table), config).start();
//!
//! // ... later
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod broker;
mod dispatch;
mod envelope;
mod inmemory_bus;
mod nats_bus;
mod pull_consumer;

pub use backoff::{BackoffConfig, ReconnectBackoff};
pub use broker::{BrokerConnector, BrokerSession, Delivery, Topology};
pub use dispatch::{
    DispatchOutcome, DispatchTable, DispatchTableBuilder, Dispatcher, EventHandler, HandlerError,
};
pub use envelope::{producer_for_topic, EnvelopeError, EventEnvelope};
pub use inmemory_bus::{DeadLetter, InMemoryBroker, StoredMessage};
pub use nats_bus::{NatsConnector, NatsDelivery, NatsSession};
pub use pull_consumer::{
    ConsumerConfig, ConsumerError, ConsumerHandle, ConsumerPhase, ConsumerStatus, PullConsumer,
};

/// Errors raised by broker implementations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to declare topology: {0}")]
    TopologyError(String),

    #[error("failed to start consuming: {0}")]
    SubscribeError(String),

    #[error("failed to acknowledge message: {0}")]
    AckError(String),

    #[error("failed to publish message: {0}")]
    PublishError(String),
}

/// Result type for broker operations
pub type BusResult<T> = Result<T, BusError>;
