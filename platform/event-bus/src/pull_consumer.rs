//! Pull consumer state machine
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Bound ─▶ Consuming
//!                     ▲                     │ connection / ack failure
//!                     └──── Reconnecting ◀──┘
//!                               │ budget exhausted
//!                               ▼
//!                             Failed          (stop() from anywhere ─▶ Stopped)
//! ```
//!
//! Messages are processed one at a time. A message is acknowledged only
//! after the dispatcher reports its effects durable; a failed ack is treated
//! as a lost connection and the broker redelivers (at-least-once).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::{BackoffConfig, ReconnectBackoff};
use crate::broker::{BrokerConnector, BrokerSession, Delivery, Topology};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::BusError;

/// Consumer settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub exchange: String,
    pub queue: String,
    pub bindings: Vec<String>,
    pub dead_letter_exchange: String,
    pub dead_letter_prefix: String,
    /// Maximum unacknowledged deliveries
    pub prefetch: u16,
    /// Deliveries after which a failing message is dead-lettered (0 = never)
    pub max_deliveries: u32,
    /// Spacing of redeliveries after a handler failure, indexed by delivery
    /// count. `max_attempts` is not consulted; `max_deliveries` bounds retries.
    pub redelivery: BackoffConfig,
    pub reconnect: BackoffConfig,
}

impl ConsumerConfig {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>, bindings: Vec<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            bindings,
            dead_letter_exchange: "AUDIT_DLQ".to_string(),
            dead_letter_prefix: "audit.dlq".to_string(),
            prefetch: 10,
            max_deliveries: 5,
            redelivery: BackoffConfig {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                max_attempts: 0,
            },
            reconnect: BackoffConfig::default(),
        }
    }

    pub fn topology(&self) -> Topology {
        Topology {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            bindings: self.bindings.clone(),
            prefetch: self.prefetch,
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            dead_letter_prefix: self.dead_letter_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerPhase {
    Disconnected,
    Connecting,
    Bound,
    Consuming,
    Reconnecting,
    Stopped,
    /// Reconnect budget exhausted; the process should exit
    Failed,
}

impl ConsumerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConsumerPhase::Stopped | ConsumerPhase::Failed)
    }
}

/// Point-in-time view of the consumer, exposed to readiness probes
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStatus {
    pub phase: ConsumerPhase,
    pub processed: u64,
    pub unknown_topic: u64,
    pub malformed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub reconnect_attempt: u32,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("broker reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("consumer task aborted: {0}")]
    Aborted(String),
}

/// Shared between the consumer task and its handle
struct ConsumerState {
    phase: watch::Sender<ConsumerPhase>,
    processed: AtomicU64,
    unknown_topic: AtomicU64,
    malformed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    reconnect_attempt: AtomicU32,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
}

impl ConsumerState {
    fn new() -> Self {
        let (phase, _) = watch::channel(ConsumerPhase::Disconnected);
        Self {
            phase,
            processed: AtomicU64::new(0),
            unknown_topic: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            reconnect_attempt: AtomicU32::new(0),
            last_message_at: Mutex::new(None),
        }
    }

    fn set_phase(&self, phase: ConsumerPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Consumer phase changed");
        }
    }

    fn mark_message(&self) {
        let mut last = self
            .last_message_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(Utc::now());
    }

    fn snapshot(&self) -> ConsumerStatus {
        ConsumerStatus {
            phase: *self.phase.borrow(),
            processed: self.processed.load(Ordering::Relaxed),
            unknown_topic: self.unknown_topic.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            reconnect_attempt: self.reconnect_attempt.load(Ordering::Relaxed),
            last_message_at: *self
                .last_message_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

/// Reconnecting broker consumer feeding a [`Dispatcher`]
pub struct PullConsumer<C: BrokerConnector> {
    connector: C,
    dispatcher: Arc<dyn Dispatcher>,
    config: ConsumerConfig,
}

impl<C: BrokerConnector> PullConsumer<C> {
    pub fn new(connector: C, dispatcher: Arc<dyn Dispatcher>, config: ConsumerConfig) -> Self {
        Self {
            connector,
            dispatcher,
            config,
        }
    }

    /// Spawn the consumer task; must be called within a tokio runtime
    pub fn start(self) -> ConsumerHandle {
        let state = Arc::new(ConsumerState::new());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(self, state.clone(), shutdown.clone()));

        ConsumerHandle {
            state,
            shutdown,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }
}

/// Control surface for a running consumer
pub struct ConsumerHandle {
    state: Arc<ConsumerState>,
    shutdown: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<(), ConsumerError>>>>,
}

impl ConsumerHandle {
    pub fn status(&self) -> ConsumerStatus {
        self.state.snapshot()
    }

    pub fn phase(&self) -> ConsumerPhase {
        *self.state.phase.borrow()
    }

    /// Resolves once the consumer reaches `Stopped` or `Failed`
    pub async fn terminated(&self) -> ConsumerPhase {
        let mut rx = self.state.phase.subscribe();
        let phase = match rx.wait_for(|phase| phase.is_terminal()).await {
            Ok(phase) => *phase,
            // Sender lives in `self.state`; unreachable while the handle exists
            Err(_) => ConsumerPhase::Stopped,
        };
        phase
    }

    /// Stop consuming and wait for the task to wind down.
    ///
    /// The in-flight message (if any) finishes and is settled, any pending
    /// reconnect timer is disarmed, and the session is closed. Safe to call
    /// before the first connect and safe to call twice.
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        self.shutdown.cancel();

        let task = self.task.lock().await.take();
        let result = match task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(ConsumerError::Aborted(e.to_string())),
            },
            None => Ok(()),
        };

        if !self.phase().is_terminal() {
            self.state.set_phase(ConsumerPhase::Stopped);
        }
        result
    }
}

enum SessionEnd {
    Shutdown,
    Lost(BusError),
}

async fn run<C: BrokerConnector>(
    consumer: PullConsumer<C>,
    state: Arc<ConsumerState>,
    shutdown: CancellationToken,
) -> Result<(), ConsumerError> {
    let topology = consumer.config.topology();
    let mut backoff = ReconnectBackoff::new(consumer.config.reconnect.clone());

    loop {
        state.set_phase(ConsumerPhase::Connecting);

        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = consumer.connector.connect(&topology) => result,
        };

        match connected {
            Ok(mut session) => {
                backoff.reset();
                state.reconnect_attempt.store(0, Ordering::Relaxed);
                state.set_phase(ConsumerPhase::Bound);
                info!(
                    exchange = %topology.exchange,
                    queue = %topology.queue,
                    bindings = topology.bindings.len(),
                    "Connected to broker"
                );

                let end = consume_session(&consumer, &mut session, &state, &shutdown).await;

                if let Err(e) = session.close().await {
                    debug!(error = %e, "Error while closing broker session");
                }

                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(e) => {
                        warn!(error = %e, "Broker connection lost");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Broker connection failed");
            }
        }

        state.set_phase(ConsumerPhase::Reconnecting);

        let Some(delay) = backoff.next_delay() else {
            let attempts = backoff.attempt();
            error!(
                attempts = attempts,
                "Broker reconnect attempts exhausted; consumer giving up"
            );
            state.set_phase(ConsumerPhase::Failed);
            return Err(ConsumerError::ReconnectExhausted { attempts });
        };

        state
            .reconnect_attempt
            .store(backoff.attempt(), Ordering::Relaxed);
        info!(
            attempt = backoff.attempt(),
            max_attempts = backoff.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling broker reconnect"
        );

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.set_phase(ConsumerPhase::Stopped);
    info!("Consumer stopped");
    Ok(())
}

async fn consume_session<C: BrokerConnector>(
    consumer: &PullConsumer<C>,
    session: &mut C::Session,
    state: &ConsumerState,
    shutdown: &CancellationToken,
) -> SessionEnd {
    if let Err(e) = session.consume().await {
        return SessionEnd::Lost(e);
    }
    state.set_phase(ConsumerPhase::Consuming);

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return SessionEnd::Shutdown,
            next = session.next_delivery() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => return SessionEnd::Lost(e),
            None => {
                return SessionEnd::Lost(BusError::ConnectionError(
                    "delivery stream closed".to_string(),
                ))
            }
        };

        let span = info_span!(
            "dispatch",
            routing_key = %delivery.routing_key(),
            delivery_count = delivery.delivery_count()
        );

        // Not raced against shutdown: the in-flight message always settles
        if let Err(e) = settle(consumer, &delivery, state).instrument(span).await {
            return SessionEnd::Lost(e);
        }
    }
}

async fn settle<C: BrokerConnector>(
    consumer: &PullConsumer<C>,
    delivery: &<C::Session as BrokerSession>::Delivery,
    state: &ConsumerState,
) -> Result<(), BusError> {
    let routing_key = delivery.routing_key();
    let outcome = consumer
        .dispatcher
        .dispatch(routing_key, delivery.payload())
        .await;

    state.mark_message();

    match outcome {
        DispatchOutcome::Processed => {
            delivery.ack().await?;
            state.processed.fetch_add(1, Ordering::Relaxed);
        }
        DispatchOutcome::UnknownTopic => {
            warn!(routing_key = %routing_key, "No handler for topic; acknowledging");
            delivery.ack().await?;
            state.unknown_topic.fetch_add(1, Ordering::Relaxed);
        }
        DispatchOutcome::Malformed(reason) => {
            warn!(routing_key = %routing_key, error = %reason, "Discarding malformed event");
            delivery.ack().await?;
            state.malformed.fetch_add(1, Ordering::Relaxed);
        }
        DispatchOutcome::HandlerFailed(reason) => {
            state.failed.fetch_add(1, Ordering::Relaxed);
            let deliveries = delivery.delivery_count();
            let max = consumer.config.max_deliveries;

            error!(
                routing_key = %routing_key,
                delivery_count = deliveries,
                error = %reason,
                "Event handler failed"
            );

            if max > 0 && deliveries >= max {
                warn!(
                    routing_key = %routing_key,
                    delivery_count = deliveries,
                    dead_letter_exchange = %consumer.config.dead_letter_exchange,
                    "Delivery limit reached; routing to dead-letter exchange"
                );
                delivery.dead_letter(&reason).await?;
                state.dead_lettered.fetch_add(1, Ordering::Relaxed);
            } else {
                let delay = consumer.config.redelivery.delay_for(deliveries);
                debug!(
                    routing_key = %routing_key,
                    delay_ms = delay.as_millis() as u64,
                    "Requeueing for redelivery"
                );
                delivery.nack_requeue(delay).await?;
            }
        }
    }

    Ok(())
}
