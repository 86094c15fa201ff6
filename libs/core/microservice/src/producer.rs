//! Work sender for enqueueing work units on another service's subject.

use crate::error::ConsumerError;
use domain_workdata::{WorkData, WorkTask};
use messaging::MessageBus;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Publishes work units through the durable path.
///
/// Each unit gets a fresh message id, which the receiving pump logs as the
/// correlation id.
#[derive(Clone)]
pub struct WorkSender {
    bus: Arc<dyn MessageBus>,
    subject: String,
}

/// Receipt of one published unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentWork {
    pub message_id: String,
    pub sequence: u64,
}

impl WorkSender {
    pub fn new(bus: Arc<dyn MessageBus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    /// Sender for the default work subject of `service_name` (`work.<service>`).
    pub fn for_service(bus: Arc<dyn MessageBus>, service_name: &str) -> Self {
        Self::new(bus, format!("work.{}", service_name))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish a work unit; returns its id and stream sequence.
    pub async fn send(&self, work: &WorkData) -> Result<SentWork, ConsumerError> {
        self.publish(work.kind().tag(), work.to_json()?).await
    }

    /// Publish a work unit wrapped in a [`WorkTask`] envelope.
    pub async fn send_task(&self, task: &WorkTask) -> Result<SentWork, ConsumerError> {
        let payload = serde_json::to_vec(task)?;
        self.publish(task.work_data.kind().tag(), payload).await
    }

    /// Publish several units in order; stops at the first failure.
    pub async fn send_batch(&self, work: &[WorkData]) -> Result<Vec<SentWork>, ConsumerError> {
        let mut receipts = Vec::with_capacity(work.len());
        for unit in work {
            receipts.push(self.send(unit).await?);
        }
        Ok(receipts)
    }

    async fn publish(&self, work_type: &str, payload: Vec<u8>) -> Result<SentWork, ConsumerError> {
        let message_id = Uuid::new_v4().to_string();
        let sequence = self
            .bus
            .publish_work(&self.subject, &message_id, payload)
            .await?;

        debug!(
            subject = %self.subject,
            work_type,
            correlation_id = %message_id,
            sequence,
            "Published work unit"
        );

        Ok(SentWork {
            message_id,
            sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain_workdata::SampleWorkData;
    use messaging::{InMemoryBus, StreamSpec};

    async fn bus_with_stream() -> InMemoryBus {
        let bus = InMemoryBus::new();
        bus.ensure_stream(&StreamSpec::new("work", vec!["work.>".to_string()]))
            .await
            .unwrap();
        bus
    }

    fn sample(field: &str) -> WorkData {
        SampleWorkData {
            sample_field: field.into(),
        }
        .into()
    }

    #[tokio::test]
    async fn test_send_persists_with_message_id() {
        let bus = bus_with_stream().await;
        let sender = WorkSender::for_service(Arc::new(bus.clone()), "sample");
        assert_eq!(sender.subject(), "work.sample");

        let sent = sender.send(&sample("X")).await.unwrap();
        assert_eq!(sent.sequence, 1);

        let stored = bus.stream_messages("work").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message_id.as_deref(), Some(sent.message_id.as_str()));
        assert_eq!(WorkData::decode(&stored[0].payload).unwrap(), sample("X"));
    }

    #[tokio::test]
    async fn test_send_task_is_decodable() {
        let bus = bus_with_stream().await;
        let sender = WorkSender::for_service(Arc::new(bus.clone()), "sample");

        sender
            .send_task(&WorkTask::new("import", sample("Y")))
            .await
            .unwrap();

        let stored = bus.stream_messages("work").await;
        assert_eq!(WorkData::decode(&stored[0].payload).unwrap(), sample("Y"));
    }

    #[tokio::test]
    async fn test_send_batch_keeps_order() {
        let bus = bus_with_stream().await;
        let sender = WorkSender::for_service(Arc::new(bus), "sample");

        let receipts = sender
            .send_batch(&[sample("a"), sample("b"), sample("c")])
            .await
            .unwrap();
        let sequences: Vec<u64> = receipts.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_send_without_stream_fails() {
        let sender = WorkSender::for_service(Arc::new(InMemoryBus::new()), "sample");
        let err = sender.send(&sample("X")).await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}
