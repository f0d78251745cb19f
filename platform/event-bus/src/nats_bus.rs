//! NATS JetStream implementation of the broker seam
//!
//! Mapping onto JetStream:
//! - topic exchange → file-backed stream whose subjects are the bound topics
//! - durable queue → durable pull consumer with explicit acks
//! - prefetch → `max_ack_pending`
//! - dead-letter exchange → second stream on `<prefix>.>`; dead-lettering
//!   republishes there with reason headers, then terminates the original

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, Consumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType, Stream},
    AckKind,
};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use crate::broker::{BrokerConnector, BrokerSession, Delivery, Topology};
use crate::{BusError, BusResult};

const DEAD_LETTER_REASON_HEADER: &str = "Audit-Dead-Letter-Reason";
const ORIGINAL_SUBJECT_HEADER: &str = "Audit-Original-Subject";
const DELIVERY_COUNT_HEADER: &str = "Audit-Delivery-Count";

/// Connects to a NATS server and declares the JetStream topology
///
/// # Example
/// ```rust,no_run
/// use event_bus::{BrokerConnector, NatsConnector, Topology};
///
/// # async fn example(topology: Topology) -> Result<(), Box<dyn std::error::Error>> {
/// let connector = NatsConnector::new("nats://localhost:4222")
///     .with_client_name("audit-trail");
/// let session = connector.connect(&topology).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct NatsConnector {
    url: String,
    client_name: String,
    connect_timeout: Duration,
    stream_max_age: Duration,
    dead_letter_max_age: Duration,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: "event-bus".to_string(),
            connect_timeout: Duration::from_secs(5),
            stream_max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            dead_letter_max_age: Duration::from_secs(60 * 60 * 24 * 30), // 30 days
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Create the stream, or update its subjects when it already exists
    async fn ensure_stream(js: &jetstream::Context, config: StreamConfig) -> BusResult<()> {
        let name = config.name.clone();
        if js.get_stream(&name).await.is_ok() {
            js.update_stream(&config)
                .await
                .map_err(|e| BusError::TopologyError(format!("update stream {name}: {e}")))?;
        } else {
            js.create_stream(config)
                .await
                .map_err(|e| BusError::TopologyError(format!("create stream {name}: {e}")))?;
        }
        Ok(())
    }

    /// Create the durable consumer, or bring an existing one in line with
    /// the current bindings and prefetch
    async fn ensure_consumer(
        stream: &Stream,
        config: pull::Config,
    ) -> BusResult<Consumer<pull::Config>> {
        let name = config.durable_name.clone().unwrap_or_default();
        if stream.consumer_info(&name).await.is_ok() {
            stream
                .update_consumer(config)
                .await
                .map_err(|e| BusError::TopologyError(format!("update consumer {name}: {e}")))
        } else {
            stream
                .create_consumer(config)
                .await
                .map_err(|e| BusError::TopologyError(format!("create consumer {name}: {e}")))
        }
    }
}

/// Durable pull consumer settings for a topology
fn consumer_config(topology: &Topology) -> pull::Config {
    pull::Config {
        durable_name: Some(topology.queue.clone()),
        ack_policy: AckPolicy::Explicit,
        max_ack_pending: i64::from(topology.prefetch),
        filter_subjects: topology.bindings.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    type Session = NatsSession;

    async fn connect(&self, topology: &Topology) -> BusResult<Self::Session> {
        let client = ConnectOptions::new()
            .name(&self.client_name)
            .connection_timeout(self.connect_timeout)
            .connect(&self.url)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let js = jetstream::new(client.clone());

        Self::ensure_stream(
            &js,
            StreamConfig {
                name: topology.exchange.clone(),
                subjects: topology.bindings.clone(),
                storage: StorageType::File,
                retention: RetentionPolicy::Limits,
                max_age: self.stream_max_age,
                ..Default::default()
            },
        )
        .await?;

        Self::ensure_stream(
            &js,
            StreamConfig {
                name: topology.dead_letter_exchange.clone(),
                subjects: vec![format!("{}.>", topology.dead_letter_prefix)],
                storage: StorageType::File,
                max_age: self.dead_letter_max_age,
                ..Default::default()
            },
        )
        .await?;

        let stream = js
            .get_stream(&topology.exchange)
            .await
            .map_err(|e| BusError::TopologyError(e.to_string()))?;

        let consumer = Self::ensure_consumer(&stream, consumer_config(topology)).await?;

        tracing::info!(
            stream = %topology.exchange,
            consumer = %topology.queue,
            bindings = topology.bindings.len(),
            prefetch = topology.prefetch,
            "JetStream topology declared"
        );

        Ok(NatsSession {
            client: Some(client),
            context: js,
            consumer,
            messages: None,
            dead_letter_prefix: topology.dead_letter_prefix.clone(),
        })
    }
}

/// Live JetStream connection bound to the durable consumer
pub struct NatsSession {
    client: Option<Client>,
    context: jetstream::Context,
    consumer: Consumer<pull::Config>,
    messages: Option<pull::Stream>,
    dead_letter_prefix: String,
}

#[async_trait]
impl BrokerSession for NatsSession {
    type Delivery = NatsDelivery;

    async fn consume(&mut self) -> BusResult<()> {
        let messages = self
            .consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;
        self.messages = Some(messages);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<BusResult<Self::Delivery>> {
        let messages = self.messages.as_mut()?;
        match messages.next().await? {
            Ok(message) => Some(Ok(NatsDelivery {
                message,
                context: self.context.clone(),
                dead_letter_prefix: self.dead_letter_prefix.clone(),
            })),
            Err(e) => Some(Err(BusError::ConnectionError(e.to_string()))),
        }
    }

    async fn close(&mut self) -> BusResult<()> {
        // Channel first: stop pulling, then drain and drop the connection
        self.messages = None;
        if let Some(client) = self.client.take() {
            client
                .flush()
                .await
                .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        }
        Ok(())
    }
}

/// A JetStream message awaiting settlement
pub struct NatsDelivery {
    message: jetstream::Message,
    context: jetstream::Context,
    dead_letter_prefix: String,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn routing_key(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_count(&self) -> u32 {
        self.message
            .info()
            .map(|info| u32::try_from(info.delivered).unwrap_or(u32::MAX))
            .unwrap_or(1)
    }

    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nack_requeue(&self, delay: Duration) -> BusResult<()> {
        let delay = (!delay.is_zero()).then_some(delay);
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn dead_letter(&self, reason: &str) -> BusResult<()> {
        let subject = format!("{}.{}", self.dead_letter_prefix, self.routing_key());

        let mut headers = HeaderMap::new();
        headers.insert(DEAD_LETTER_REASON_HEADER, reason);
        headers.insert(ORIGINAL_SUBJECT_HEADER, self.routing_key());
        headers.insert(
            DELIVERY_COUNT_HEADER,
            self.delivery_count().to_string().as_str(),
        );

        self.context
            .publish_with_headers(subject, headers, self.message.payload.clone())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}
