//! Broker-agnostic message bus contract.
//!
//! Two transports implement [`MessageBus`]: the NATS adapter (feature `nats`) and the
//! [`InMemoryBus`](crate::memory::InMemoryBus) used by tests and local tooling.
//! Everything above this module talks to `Arc<dyn MessageBus>`.

use crate::error::BusError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// A message received on a plain (non-persistent) subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Subject the sender expects a reply on (request/reply).
    pub reply: Option<String>,
}

impl ReceivedMessage {
    /// Deserialize the payload as JSON.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Stream of messages from a plain subscription.
///
/// Dropping the stream unsubscribes.
#[async_trait]
pub trait MessageStream: Send {
    /// Next message, or `None` once the subscription is closed.
    async fn next(&mut self) -> Option<ReceivedMessage>;
}

/// Persistent stream definition.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_messages: i64,
    pub max_age: Duration,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            max_messages: 100_000,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    pub fn with_max_messages(mut self, max_messages: i64) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

/// Durable pull consumer definition. Acknowledgement is always explicit.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub durable_name: String,
    pub filter_subject: String,
    /// Maximum deliveries per message; zero or negative means unlimited.
    pub max_deliver: i64,
    /// Time an unacknowledged delivery stays in flight before redelivery.
    pub ack_wait: Duration,
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processed; never redeliver.
    Ack,
    /// Redeliver, optionally after a delay.
    Nak(Option<Duration>),
    /// Never redeliver; processing is abandoned.
    Term,
}

/// Transport hook that settles one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(&self, kind: AckKind) -> Result<(), BusError>;
}

/// One delivery of a persistent work message.
///
/// Settlement methods consume the delivery, so it is settled at most once.
pub struct Delivery {
    subject: String,
    payload: Vec<u8>,
    sequence: u64,
    delivery_count: u32,
    message_id: Option<String>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        sequence: u64,
        delivery_count: u32,
        message_id: Option<String>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            sequence,
            delivery_count,
            message_id,
            acker,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Stream sequence number of the underlying message.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// How many times this message has been delivered, including this delivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Publisher-assigned message id (`Nats-Msg-Id`), if any.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.settle(AckKind::Ack).await
    }

    pub async fn nak(self, delay: Option<Duration>) -> Result<(), BusError> {
        self.acker.settle(AckKind::Nak(delay)).await
    }

    pub async fn term(self) -> Result<(), BusError> {
        self.acker.settle(AckKind::Term).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("delivery_count", &self.delivery_count)
            .field("message_id", &self.message_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A bound durable consumer that work is pulled from.
#[async_trait]
pub trait WorkStream: Send {
    /// Pull up to `max_messages`, waiting at most `expires` for the first one.
    ///
    /// An empty batch is not an error.
    async fn fetch(
        &mut self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Delivery>, BusError>;

    /// Messages waiting to be delivered to this consumer.
    async fn pending(&mut self) -> Result<u64, BusError>;

    /// Release the binding. Unsettled deliveries become eligible for redelivery.
    async fn close(self: Box<Self>) -> Result<(), BusError>;
}

/// The transport every microservice runs on.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish on a plain subject.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Persist a work message; returns the stream sequence it was stored at.
    ///
    /// `message_id` is attached as the deduplication/correlation id.
    async fn publish_work(
        &self,
        subject: &str,
        message_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64, BusError>;

    /// Request/reply on a plain subject.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<ReceivedMessage, BusError>;

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn MessageStream>, BusError>;

    /// Create the stream if it does not exist yet.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError>;

    /// Bind (creating if absent) the durable consumer described by `spec`.
    async fn bind_work_stream(&self, spec: &ConsumerSpec) -> Result<Box<dyn WorkStream>, BusError>;

    /// Flush buffered outgoing messages.
    async fn flush(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingAcker(Arc<Mutex<Vec<AckKind>>>);

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn settle(&self, kind: AckKind) -> Result<(), BusError> {
            self.0.lock().unwrap().push(kind);
            Ok(())
        }
    }

    fn delivery(count: u32, log: Arc<Mutex<Vec<AckKind>>>) -> Delivery {
        Delivery::new(
            "work.sample",
            br#"{"type":"sample"}"#.to_vec(),
            42,
            count,
            Some("abc".into()),
            Box::new(RecordingAcker(log)),
        )
    }

    #[tokio::test]
    async fn test_delivery_settles_through_acker() {
        let log = Arc::new(Mutex::new(Vec::new()));

        delivery(1, log.clone()).ack().await.unwrap();
        delivery(2, log.clone())
            .nak(Some(Duration::from_secs(2)))
            .await
            .unwrap();
        delivery(3, log.clone()).term().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                AckKind::Ack,
                AckKind::Nak(Some(Duration::from_secs(2))),
                AckKind::Term
            ]
        );
    }

    #[test]
    fn test_delivery_accessors() {
        let d = delivery(2, Arc::new(Mutex::new(Vec::new())));
        assert_eq!(d.subject(), "work.sample");
        assert_eq!(d.sequence(), 42);
        assert!(d.is_redelivery());
        assert_eq!(d.message_id(), Some("abc"));
        assert!(format!("{d:?}").contains("payload_len"));
    }

    #[test]
    fn test_received_message_payload() {
        let msg = ReceivedMessage {
            subject: "sample.system".into(),
            payload: br#"{"cmd":"hello"}"#.to_vec(),
            reply: Some("_INBOX.1".into()),
        };
        let value: serde_json::Value = msg.parse_payload().unwrap();
        assert_eq!(value["cmd"], "hello");
        assert_eq!(msg.payload_str(), r#"{"cmd":"hello"}"#);
    }
}
