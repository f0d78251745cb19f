//! In-memory broker for testing and development
//!
//! Models the parts of a real broker the consumer depends on: a durable
//! queue that survives disconnects, per-message delivery counts, manual
//! acknowledgement, delayed requeue, dead-lettering, and connection loss. Failures
//! can be injected to exercise reconnect and redelivery paths.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{BrokerConnector, BrokerSession, Delivery, Topology};
use crate::{BusError, BusResult};

/// A message as held by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub delivery_count: u32,
}

/// A message routed to the dead-letter exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: StoredMessage,
    pub reason: String,
}

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<StoredMessage>,
    /// Nacked with a delay; held back until the instant passes
    delayed: Vec<(Instant, StoredMessage)>,
    unacked: HashMap<u64, StoredMessage>,
    acked: Vec<StoredMessage>,
    dead_letters: Vec<DeadLetter>,
    nack_delays: Vec<Duration>,
    next_id: u64,
    /// Bumped whenever the connection is lost; sessions and deliveries from
    /// an older generation are dead.
    generation: u64,
    failing_connects: u32,
    interrupt_next_ack: bool,
    connect_attempts: Vec<Instant>,
    topology: Option<Topology>,
    closed_sessions: usize,
}

impl BrokerState {
    /// Connection loss: every unacknowledged message goes back to the head
    /// of the queue, in original order.
    fn lose_connection(&mut self) {
        self.generation += 1;
        let mut pending: Vec<StoredMessage> = self.unacked.drain().map(|(_, m)| m).collect();
        pending.sort_by_key(|m| std::cmp::Reverse(m.id));
        for message in pending {
            self.ready.push_front(message);
        }
    }

    /// Move delayed messages whose time has come back to the head of the queue
    fn release_due(&mut self, now: Instant) {
        let (mut due, later): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = later;
        due.sort_by_key(|(_, m)| std::cmp::Reverse(m.id));
        for (_, message) in due {
            self.ready.push_front(message);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// Broker double implementing [`BrokerConnector`]
///
/// Every published message reaches the queue regardless of the declared
/// bindings, so unroutable topics can be fed to the consumer in tests.
///
/// # Example
/// ```rust
/// use event_bus::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.publish("user.created", br#"{"data":{}}"#.to_vec());
/// broker.fail_next_connects(2);
/// assert_eq!(broker.pending().len(), 1);
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test panicked mid-operation
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a message on `topic`
    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.ready.push_back(StoredMessage {
                id,
                topic: topic.to_string(),
                payload,
                delivery_count: 0,
            });
        }
        self.shared.notify.notify_waiters();
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Sever the live connection; unacked messages are requeued
    pub fn drop_connection(&self) {
        self.lock().lose_connection();
        self.shared.notify.notify_waiters();
    }

    /// The next ack fails as if the connection died mid-acknowledgement.
    ///
    /// The message stays unacknowledged and is redelivered after reconnect,
    /// even though the consumer already processed it.
    pub fn interrupt_next_ack(&self) {
        self.lock().interrupt_next_ack = true;
    }

    pub fn acked(&self) -> Vec<StoredMessage> {
        self.lock().acked.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Messages waiting for delivery, including delayed redeliveries
    pub fn pending(&self) -> Vec<StoredMessage> {
        let state = self.lock();
        let mut pending: Vec<StoredMessage> = state.ready.iter().cloned().collect();
        pending.extend(state.delayed.iter().map(|(_, m)| m.clone()));
        pending
    }

    /// Delay requested by every nack, in order
    pub fn nack_delays(&self) -> Vec<Duration> {
        self.lock().nack_delays.clone()
    }

    /// Delivered but neither acked nor requeued yet
    pub fn in_flight(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Instants at which `connect` was called (tokio clock, so paused-time
    /// tests observe exact backoff delays)
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    /// Topology declared by the most recent successful connect
    pub fn topology(&self) -> Option<Topology> {
        self.lock().topology.clone()
    }

    pub fn closed_sessions(&self) -> usize {
        self.lock().closed_sessions
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    type Session = InMemorySession;

    async fn connect(&self, topology: &Topology) -> BusResult<Self::Session> {
        let mut state = self.lock();
        state.connect_attempts.push(Instant::now());

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BusError::ConnectionError("connection refused".to_string()));
        }

        state.topology = Some(topology.clone());
        Ok(InMemorySession {
            broker: self.clone(),
            generation: state.generation,
            consuming: false,
            closed: false,
        })
    }
}

/// Session handed out by [`InMemoryBroker`]
pub struct InMemorySession {
    broker: InMemoryBroker,
    generation: u64,
    consuming: bool,
    closed: bool,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    type Delivery = InMemoryDelivery;

    async fn consume(&mut self) -> BusResult<()> {
        if self.broker.lock().generation != self.generation {
            return Err(BusError::SubscribeError("channel closed".to_string()));
        }
        self.consuming = true;
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<BusResult<Self::Delivery>> {
        if !self.consuming || self.closed {
            return None;
        }

        loop {
            // Register interest before inspecting state so a publish between
            // the check and the await is not missed.
            let notified = self.broker.shared.notify.notified();

            let wake_at = {
                let mut state = self.broker.lock();
                if state.generation != self.generation {
                    return Some(Err(BusError::ConnectionError(
                        "connection lost".to_string(),
                    )));
                }
                state.release_due(Instant::now());
                if let Some(mut message) = state.ready.pop_front() {
                    message.delivery_count += 1;
                    state.unacked.insert(message.id, message.clone());
                    return Some(Ok(InMemoryDelivery {
                        broker: self.broker.clone(),
                        generation: self.generation,
                        message,
                    }));
                }
                let next_due = state.delayed.iter().map(|(at, _)| *at).min();
                next_due
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn close(&mut self) -> BusResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.broker.lock();
        state.closed_sessions += 1;
        if state.generation == self.generation {
            state.lose_connection();
        }
        Ok(())
    }
}

/// Delivery handed out by [`InMemorySession`]
pub struct InMemoryDelivery {
    broker: InMemoryBroker,
    generation: u64,
    message: StoredMessage,
}

impl InMemoryDelivery {
    fn settle(&self) -> BusResult<(MutexGuard<'_, BrokerState>, StoredMessage)> {
        let mut state = self.broker.lock();
        if state.generation != self.generation {
            return Err(BusError::AckError("channel closed".to_string()));
        }
        let message = state
            .unacked
            .remove(&self.message.id)
            .ok_or_else(|| BusError::AckError("unknown delivery tag".to_string()))?;
        Ok((state, message))
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn routing_key(&self) -> &str {
        &self.message.topic
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_count(&self) -> u32 {
        self.message.delivery_count
    }

    async fn ack(&self) -> BusResult<()> {
        {
            let mut state = self.broker.lock();
            if state.interrupt_next_ack && state.generation == self.generation {
                state.interrupt_next_ack = false;
                state.lose_connection();
                drop(state);
                self.broker.shared.notify.notify_waiters();
                return Err(BusError::AckError("connection reset during ack".to_string()));
            }
        }

        let (mut state, message) = self.settle()?;
        state.acked.push(message);
        Ok(())
    }

    async fn nack_requeue(&self, delay: Duration) -> BusResult<()> {
        {
            let (mut state, message) = self.settle()?;
            state.nack_delays.push(delay);
            if delay.is_zero() {
                state.ready.push_front(message);
            } else {
                state.delayed.push((Instant::now() + delay, message));
            }
        }
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, reason: &str) -> BusResult<()> {
        let (mut state, message) = self.settle()?;
        state.dead_letters.push(DeadLetter {
            message,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
