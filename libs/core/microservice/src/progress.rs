//! Progress reporting for long running work units.

use crate::state::WorkerState;
use domain_workdata::{ProgressMessage, SystemMessage, PROGRESS_SUBJECT};
use messaging::{BusError, MessageBus};
use std::sync::Arc;
use tracing::debug;

/// Handle a processor keeps to publish progress on the fleet `progress` subject.
///
/// Reports also update the worker state, so `status` shows the latest one.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<dyn MessageBus>,
    state: WorkerState,
}

impl ProgressReporter {
    pub fn new(bus: Arc<dyn MessageBus>, state: WorkerState) -> Self {
        Self { bus, state }
    }

    /// Report `percent` (clamped to 0..=100) with free-form details.
    pub async fn report(
        &self,
        task_id: Option<&str>,
        percent: i32,
        details: impl Into<String>,
    ) -> Result<(), BusError> {
        let progress_percent = percent.clamp(0, 100) as u8;
        let details = details.into();
        self.state.set_progress(progress_percent, details.clone()).await;

        let message = SystemMessage::Progress(ProgressMessage {
            name: self.state.name().to_string(),
            task_id: task_id.map(str::to_string),
            progress_percent,
            details,
        });
        let payload = message.to_json().map_err(BusError::publish)?;
        self.bus.publish(PROGRESS_SUBJECT, payload).await?;

        debug!(task_id = ?task_id, progress_percent, "Reported progress");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::InMemoryBus;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_report_publishes_and_updates_state() {
        let bus = InMemoryBus::new();
        let mut progress = bus.subscribe(PROGRESS_SUBJECT).await.unwrap();
        let state = WorkerState::new("spdx");
        let reporter = ProgressReporter::new(Arc::new(bus), state.clone());

        reporter.report(Some("run-1"), 40, "parsing").await.unwrap();

        let message = progress.next().await.unwrap();
        let value: Value = message.parse_payload().unwrap();
        assert_eq!(
            value,
            json!({"type":"progress","name":"spdx","taskId":"run-1","progressPercent":40,"details":"parsing"})
        );

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.progress_percent, 40);
        assert_eq!(snapshot.details, "parsing");
    }

    #[tokio::test]
    async fn test_percent_is_clamped() {
        let bus = InMemoryBus::new();
        let mut progress = bus.subscribe(PROGRESS_SUBJECT).await.unwrap();
        let reporter = ProgressReporter::new(Arc::new(bus), WorkerState::new("spdx"));

        reporter.report(None, 140, "").await.unwrap();
        reporter.report(None, -3, "").await.unwrap();

        let high: ProgressMessage = progress.next().await.unwrap().parse_payload().unwrap();
        let low: ProgressMessage = progress.next().await.unwrap().parse_payload().unwrap();
        assert_eq!(high.progress_percent, 100);
        assert_eq!(low.progress_percent, 0);
        assert!(high.task_id.is_none());
    }
}
