//! NATS transport: core pub/sub for control traffic, JetStream for work.

use crate::bus::{
    AckKind, Acker, ConsumerSpec, Delivery, MessageBus, MessageStream, ReceivedMessage,
    StreamSpec, WorkStream,
};
use crate::error::BusError;
use async_nats::client::RequestErrorKind;
use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, Config as DurableConfig, Consumer};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, Context};
use async_nats::{header, Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// [`MessageBus`] backed by a NATS connection.
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: Context,
}

impl NatsBus {
    /// Connect to the server at `url`.
    pub async fn connect(url: &str, connection_name: Option<&str>) -> Result<Self, BusError> {
        let mut options = ConnectOptions::new();
        if let Some(name) = connection_name {
            options = options.name(name);
        }

        let client = options
            .connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        info!(url = %url, "Connected to NATS");

        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn consumer_config(spec: &ConsumerSpec) -> ConsumerConfig {
    ConsumerConfig {
        durable_name: Some(spec.durable_name.clone()),
        name: Some(spec.durable_name.clone()),
        ack_policy: AckPolicy::Explicit,
        ack_wait: spec.ack_wait,
        max_deliver: spec.max_deliver,
        filter_subject: spec.filter_subject.clone(),
        ..Default::default()
    }
}

/// Settings of an existing durable that differ from what the pump expects.
fn config_drift(existing: &DurableConfig, spec: &ConsumerSpec) -> Vec<&'static str> {
    let mut drift = Vec::new();
    if existing.max_deliver != spec.max_deliver {
        drift.push("max_deliver");
    }
    if existing.ack_wait != spec.ack_wait {
        drift.push("ack_wait");
    }
    if existing.filter_subject != spec.filter_subject {
        drift.push("filter_subject");
    }
    if existing.ack_policy != AckPolicy::Explicit {
        drift.push("ack_policy");
    }
    drift
}

fn received(message: async_nats::Message) -> ReceivedMessage {
    ReceivedMessage {
        subject: message.subject.to_string(),
        payload: message.payload.to_vec(),
        reply: message.reply.map(|r| r.to_string()),
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(BusError::publish)
    }

    async fn publish_work(
        &self,
        subject: &str,
        message_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64, BusError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::NATS_MESSAGE_ID, message_id);

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(BusError::publish)?
            .await
            .map_err(BusError::publish)?;

        debug!(subject = %subject, sequence = ack.sequence, "Work published");
        Ok(ack.sequence)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<ReceivedMessage, BusError> {
        let request = self.client.request(subject.to_string(), payload.into());
        let timed_out = || BusError::Timeout {
            subject: subject.to_string(),
            timeout,
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(message)) => Ok(received(message)),
            Ok(Err(e)) => match e.kind() {
                RequestErrorKind::NoResponders => Err(BusError::NoResponders(subject.to_string())),
                RequestErrorKind::TimedOut => Err(timed_out()),
                _ => Err(BusError::Connection(e.to_string())),
            },
            Err(_) => Err(timed_out()),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn MessageStream>, BusError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Box::new(NatsSubscription { subscriber }))
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError> {
        match self.jetstream.get_stream(&spec.name).await {
            Ok(mut stream) => {
                let info = stream.info().await.map_err(BusError::consumer)?;
                debug!(
                    stream = %spec.name,
                    messages = info.state.messages,
                    "Stream already exists"
                );
                Ok(())
            }
            Err(_) => {
                info!(stream = %spec.name, subjects = ?spec.subjects, "Creating stream");
                self.jetstream
                    .create_stream(StreamConfig {
                        name: spec.name.clone(),
                        subjects: spec.subjects.clone(),
                        max_messages: spec.max_messages,
                        max_age: spec.max_age,
                        ..Default::default()
                    })
                    .await
                    .map_err(BusError::consumer)?;
                Ok(())
            }
        }
    }

    async fn bind_work_stream(&self, spec: &ConsumerSpec) -> Result<Box<dyn WorkStream>, BusError> {
        let stream = self
            .jetstream
            .get_stream(&spec.stream)
            .await
            .map_err(|_| BusError::StreamNotFound(spec.stream.clone()))?;

        // The server creates the durable or updates it in place, so a changed
        // max_deliver or ack_wait takes effect on the next bind.
        match stream.consumer_info(&spec.durable_name).await {
            Ok(existing) => {
                let drift = config_drift(&existing.config, spec);
                if drift.is_empty() {
                    debug!(consumer = %spec.durable_name, "Consumer already exists");
                } else {
                    info!(
                        consumer = %spec.durable_name,
                        stream = %spec.stream,
                        changed = ?drift,
                        "Updating consumer configuration"
                    );
                }
            }
            Err(_) => {
                info!(
                    consumer = %spec.durable_name,
                    stream = %spec.stream,
                    filter = %spec.filter_subject,
                    "Creating consumer"
                );
            }
        }

        let consumer: Consumer<ConsumerConfig> = stream
            .create_consumer(consumer_config(spec))
            .await
            .map_err(BusError::consumer)?;

        Ok(Box::new(NatsWorkStream { consumer }))
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }
}

struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl MessageStream for NatsSubscription {
    async fn next(&mut self) -> Option<ReceivedMessage> {
        self.subscriber.next().await.map(received)
    }
}

struct NatsWorkStream {
    consumer: Consumer<ConsumerConfig>,
}

#[async_trait]
impl WorkStream for NatsWorkStream {
    async fn fetch(
        &mut self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .map_err(BusError::consumer)?;

        let mut batch = Vec::new();
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Error receiving message from batch");
                    continue;
                }
            };

            let (sequence, delivery_count) = match message.info() {
                Ok(info) => (
                    info.stream_sequence,
                    u32::try_from(info.delivered.max(1)).unwrap_or(u32::MAX),
                ),
                Err(e) => {
                    warn!(error = %e, "Failed to get message info, using defaults");
                    (0, 1)
                }
            };
            let message_id = message
                .headers
                .as_ref()
                .and_then(|h| h.get(header::NATS_MESSAGE_ID))
                .map(|v| v.as_str().to_string());
            let subject = message.subject.to_string();
            let payload = message.payload.to_vec();

            batch.push(Delivery::new(
                subject,
                payload,
                sequence,
                delivery_count,
                message_id,
                Box::new(NatsAcker { message }),
            ));
        }

        Ok(batch)
    }

    async fn pending(&mut self) -> Result<u64, BusError> {
        let info = self.consumer.info().await.map_err(BusError::consumer)?;
        Ok(info.num_pending)
    }

    async fn close(self: Box<Self>) -> Result<(), BusError> {
        // The durable consumer outlives this binding; unacked messages redeliver after ack_wait.
        Ok(())
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn settle(&self, kind: AckKind) -> Result<(), BusError> {
        let kind = match kind {
            AckKind::Ack => jetstream::AckKind::Ack,
            AckKind::Nak(delay) => jetstream::AckKind::Nak(delay),
            AckKind::Term => jetstream::AckKind::Term,
        };
        self.message.ack_with(kind).await.map_err(BusError::ack)
    }
}
