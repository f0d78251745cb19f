//! Broker seam
//!
//! The pull consumer only talks to these traits. A connector opens a session
//! and declares the topology; a session yields deliveries that must each be
//! settled exactly once (ack, nack-with-requeue, or dead-letter).

use async_trait::async_trait;
use std::time::Duration;

use crate::BusResult;

/// Broker-side objects declared on every connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Durable topic exchange (JetStream: stream) receiving producer events
    pub exchange: String,
    /// Durable queue (JetStream: durable pull consumer) owned by this service
    pub queue: String,
    /// One binding per topic, exact match
    pub bindings: Vec<String>,
    /// Maximum unacknowledged deliveries held by this consumer
    pub prefetch: u16,
    /// Exchange receiving messages that repeatedly fail
    pub dead_letter_exchange: String,
    /// Subject prefix for dead-lettered messages (`<prefix>.<topic>`)
    pub dead_letter_prefix: String,
}

/// Opens broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Connect, apply the prefetch bound, and declare exchange, queue,
    /// dead-letter exchange and bindings. Declarations are idempotent.
    async fn connect(&self, topology: &Topology) -> BusResult<Self::Session>;
}

/// One live connection + channel
#[async_trait]
pub trait BrokerSession: Send {
    type Delivery: Delivery;

    /// Start manual-ack consumption on the declared queue
    async fn consume(&mut self) -> BusResult<()>;

    /// Next delivery. `None` or `Some(Err(_))` means the session is lost.
    async fn next_delivery(&mut self) -> Option<BusResult<Self::Delivery>>;

    /// Close the channel, then the connection
    async fn close(&mut self) -> BusResult<()>;
}

/// A single message awaiting settlement
#[async_trait]
pub trait Delivery: Send + Sync {
    fn routing_key(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// 1 on first delivery, incremented on every redelivery
    fn delivery_count(&self) -> u32;

    async fn ack(&self) -> BusResult<()>;

    /// Return to the queue; redelivered no earlier than `delay` from now
    async fn nack_requeue(&self, delay: Duration) -> BusResult<()>;

    /// Route to the dead-letter exchange and remove from the queue
    async fn dead_letter(&self, reason: &str) -> BusResult<()>;
}
