//! Dead-letter publishing.
//!
//! Terminated work units are republished as [`DeadLetterEntry`] documents on
//! `deadletter.<service>`, captured by the `<STREAM>_DLQ` stream.

use chrono::{DateTime, Utc};
use messaging::{BusError, Delivery, MessageBus, StreamSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tracing::{debug, info};
use uuid::Uuid;

/// Why a work unit left the stream without being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeadLetterReason {
    /// Discriminator missing or unknown to this binary
    UnknownType,
    /// Processor reported a permanent failure or does not support the variant
    Permanent,
    /// Retryable failure hit the delivery limit
    MaxDeliveries,
}

/// Entry stored in the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub service: String,
    /// Work subject the unit was delivered on
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_type: Option<String>,
    pub correlation_id: String,
    pub reason: DeadLetterReason,
    pub error: String,
    pub original_sequence: u64,
    pub delivery_count: u32,
    /// The original payload: JSON when it parsed, otherwise the raw text
    pub payload: Value,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        service: &str,
        delivery: &Delivery,
        work_type: Option<&str>,
        correlation_id: &str,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        let payload = serde_json::from_slice(delivery.payload()).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(delivery.payload()).into_owned())
        });

        Self {
            service: service.to_string(),
            subject: delivery.subject().to_string(),
            work_type: work_type.map(str::to_string),
            correlation_id: correlation_id.to_string(),
            reason,
            error: error.into(),
            original_sequence: delivery.sequence(),
            delivery_count: delivery.delivery_count(),
            payload,
            failed_at: Utc::now(),
        }
    }
}

/// Publishes dead letters for one service.
#[derive(Clone)]
pub struct DeadLetterPublisher {
    bus: Arc<dyn MessageBus>,
    stream: StreamSpec,
    subject: String,
}

impl DeadLetterPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, stream: StreamSpec, subject: impl Into<String>) -> Self {
        Self {
            bus,
            stream,
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Ensure the dead-letter stream exists.
    pub async fn ensure_stream(&self) -> Result<(), BusError> {
        self.bus.ensure_stream(&self.stream).await?;
        info!(stream = %self.stream.name, subject = %self.subject, "Dead-letter stream ready");
        Ok(())
    }

    /// Publish an entry; returns its dead-letter stream sequence.
    pub async fn publish(&self, entry: &DeadLetterEntry) -> Result<u64, BusError> {
        let payload = serde_json::to_vec(entry).map_err(BusError::publish)?;
        let message_id = Uuid::new_v4().to_string();

        let sequence = self
            .bus
            .publish_work(&self.subject, &message_id, payload)
            .await?;

        debug!(
            correlation_id = %entry.correlation_id,
            reason = %entry.reason,
            sequence,
            "Moved work unit to dead-letter stream"
        );

        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::{AckKind, Acker, InMemoryBus};
    use serde_json::json;

    struct NoopAcker;

    #[async_trait::async_trait]
    impl Acker for NoopAcker {
        async fn settle(&self, _kind: AckKind) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn delivery(payload: &[u8]) -> Delivery {
        Delivery::new(
            "work.sample".to_string(),
            payload.to_vec(),
            42,
            3,
            Some("abc".to_string()),
            Box::new(NoopAcker),
        )
    }

    #[test]
    fn test_entry_keeps_json_payload() {
        let entry = DeadLetterEntry::new(
            "sample",
            &delivery(br#"{"type":"bogus"}"#),
            None,
            "abc",
            DeadLetterReason::UnknownType,
            "unknown work data type 'bogus'",
        );
        assert_eq!(entry.payload, json!({"type": "bogus"}));
        assert_eq!(entry.original_sequence, 42);
        assert_eq!(entry.delivery_count, 3);

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["reason"], "unknown_type");
        assert_eq!(value["correlationId"], "abc");
        assert!(value.get("workType").is_none());
    }

    #[test]
    fn test_entry_falls_back_to_text_payload() {
        let entry = DeadLetterEntry::new(
            "sample",
            &delivery(b"not json"),
            Some("sample"),
            "abc",
            DeadLetterReason::Permanent,
            "nope",
        );
        assert_eq!(entry.payload, Value::String("not json".into()));
        assert_eq!(entry.work_type.as_deref(), Some("sample"));
    }

    #[tokio::test]
    async fn test_publish_lands_in_dead_letter_stream() {
        let bus = InMemoryBus::new();
        let stream = StreamSpec::new("work_DLQ", vec!["deadletter.>".to_string()]);
        let publisher = DeadLetterPublisher::new(Arc::new(bus.clone()), stream, "deadletter.sample");
        publisher.ensure_stream().await.unwrap();

        let entry = DeadLetterEntry::new(
            "sample",
            &delivery(br#"{"type":"sample","sampleField":"X"}"#),
            Some("sample"),
            "abc",
            DeadLetterReason::MaxDeliveries,
            "still failing",
        );
        let sequence = publisher.publish(&entry).await.unwrap();
        assert_eq!(sequence, 1);

        let stored = bus.stream_messages("work_DLQ").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].subject, "deadletter.sample");
        let decoded: DeadLetterEntry = serde_json::from_slice(&stored[0].payload).unwrap();
        assert_eq!(decoded, entry);
    }

    #[tokio::test]
    async fn test_publish_without_stream_fails() {
        let bus = InMemoryBus::new();
        let stream = StreamSpec::new("work_DLQ", vec!["deadletter.>".to_string()]);
        let publisher = DeadLetterPublisher::new(Arc::new(bus), stream, "deadletter.sample");
        let entry = DeadLetterEntry::new(
            "sample",
            &delivery(b"{}"),
            None,
            "abc",
            DeadLetterReason::UnknownType,
            "missing type",
        );
        assert!(matches!(
            publisher.publish(&entry).await,
            Err(BusError::StreamNotFound(_))
        ));
    }
}
