//! Shared worker state.
//!
//! One [`WorkerState`] per service instance is written by the pump and the
//! progress reporter and read by the `status` command and the health probes.

use domain_workdata::{StatusDescriptor, WorkerStatus};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Cheaply cloneable handle to the state of one service instance.
#[derive(Clone)]
pub struct WorkerState {
    name: Arc<str>,
    status: Arc<watch::Sender<WorkerStatus>>,
    inner: Arc<RwLock<StateInner>>,
    started_at: Instant,
}

#[derive(Default)]
struct StateInner {
    progress_percent: u8,
    details: String,
    received: u64,
    processed: u64,
    failed: u64,
    dead_lettered: u64,
    pending: Option<u64>,
    last_error: Option<String>,
    active: usize,
}

impl WorkerState {
    pub fn new(name: impl Into<String>) -> Self {
        let (status, _) = watch::channel(WorkerStatus::Init);
        Self {
            name: Arc::from(name.into()),
            status: Arc::new(status),
            inner: Arc::new(RwLock::new(StateInner::default())),
            started_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: WorkerStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(service = %self.name, from = %previous, to = %status, "Worker status changed");
        }
    }

    /// Stream bound and not shutting down.
    pub fn is_ready(&self) -> bool {
        matches!(self.status(), WorkerStatus::Idle | WorkerStatus::Working)
    }

    /// Only a fatal pump exit makes the instance dead; a broker hiccup does not.
    pub fn is_alive(&self) -> bool {
        self.status() != WorkerStatus::Failed
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status(), WorkerStatus::Stopped | WorkerStatus::Failed)
    }

    /// Resolve once the pump has stopped or failed.
    pub async fn wait_until_finished(&self) -> WorkerStatus {
        let mut rx = self.status.subscribe();
        let status = match rx
            .wait_for(|s| matches!(s, WorkerStatus::Stopped | WorkerStatus::Failed))
            .await
        {
            Ok(status) => *status,
            // The sender lives as long as `self`.
            Err(_) => self.status(),
        };
        status
    }

    /// Enter `Stopping` unless the pump already finished or is stopping.
    ///
    /// Returns whether the status changed.
    pub fn begin_stopping(&self) -> bool {
        self.transition(|s| {
            !matches!(
                s,
                WorkerStatus::Stopping | WorkerStatus::Stopped | WorkerStatus::Failed
            )
        }, WorkerStatus::Stopping)
    }

    /// Enter `Idle` after binding, unless a stop was requested meanwhile.
    pub fn mark_bound(&self) -> bool {
        self.transition(|s| s == WorkerStatus::Init, WorkerStatus::Idle)
    }

    fn transition(&self, allowed: impl Fn(WorkerStatus) -> bool, to: WorkerStatus) -> bool {
        let mut from = None;
        let changed = self.status.send_if_modified(|s| {
            if allowed(*s) {
                from = Some(*s);
                *s = to;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            debug!(service = %self.name, from = %from, to = %to, "Worker status changed");
        }
        changed
    }

    /// A work unit entered dispatch.
    pub async fn begin_work(&self) {
        self.inner.write().await.active += 1;
        self.status.send_if_modified(|s| {
            if *s == WorkerStatus::Idle {
                *s = WorkerStatus::Working;
                true
            } else {
                false
            }
        });
    }

    /// A work unit left dispatch.
    pub async fn end_work(&self) {
        let idle = {
            let mut inner = self.inner.write().await;
            inner.active = inner.active.saturating_sub(1);
            inner.active == 0
        };
        if idle {
            self.status.send_if_modified(|s| {
                if *s == WorkerStatus::Working {
                    *s = WorkerStatus::Idle;
                    true
                } else {
                    false
                }
            });
        }
    }

    pub async fn record_received(&self) {
        self.inner.write().await.received += 1;
    }

    pub async fn record_processed(&self) {
        self.inner.write().await.processed += 1;
    }

    pub async fn record_failed(&self, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.failed += 1;
        inner.last_error = Some(error.into());
    }

    pub async fn record_dead_lettered(&self) {
        self.inner.write().await.dead_lettered += 1;
    }

    pub async fn set_pending(&self, pending: u64) {
        self.inner.write().await.pending = Some(pending);
    }

    pub async fn set_progress(&self, percent: u8, details: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.progress_percent = percent.min(100);
        inner.details = details.into();
    }

    pub async fn set_error(&self, error: impl Into<String>) {
        self.inner.write().await.last_error = Some(error.into());
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.read().await.last_error.clone()
    }

    /// Snapshot answered to `status`.
    pub async fn snapshot(&self) -> StatusDescriptor {
        let inner = self.inner.read().await;
        StatusDescriptor {
            name: self.name.to_string(),
            ready: self.is_ready(),
            status: self.status(),
            progress_percent: inner.progress_percent,
            details: inner.details.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            pending: inner.pending,
            received: inner.received,
            processed: inner.processed,
            failed: inner.failed,
            dead_lettered: inner.dead_lettered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initial_snapshot() {
        let state = WorkerState::new("sample");
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.name, "sample");
        assert_eq!(snapshot.status, WorkerStatus::Init);
        assert!(!snapshot.ready);
        assert_eq!(snapshot.pending, None);
        assert!(state.is_alive());
    }

    #[tokio::test]
    async fn test_working_transitions_track_active_units() {
        let state = WorkerState::new("sample");
        state.set_status(WorkerStatus::Idle);

        state.begin_work().await;
        state.begin_work().await;
        assert_eq!(state.status(), WorkerStatus::Working);

        state.end_work().await;
        assert_eq!(state.status(), WorkerStatus::Working);
        state.end_work().await;
        assert_eq!(state.status(), WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_end_work_does_not_override_stopping() {
        let state = WorkerState::new("sample");
        state.set_status(WorkerStatus::Idle);
        state.begin_work().await;
        state.set_status(WorkerStatus::Stopping);
        state.end_work().await;
        assert_eq!(state.status(), WorkerStatus::Stopping);
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_counters_and_progress() {
        let state = WorkerState::new("spdx");
        state.record_received().await;
        state.record_received().await;
        state.record_processed().await;
        state.record_failed("boom").await;
        state.record_dead_lettered().await;
        state.set_pending(7).await;
        state.set_progress(250, "parsing").await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.pending, Some(7));
        assert_eq!(snapshot.progress_percent, 100);
        assert_eq!(snapshot.details, "parsing");
        assert_eq!(state.last_error().await.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_wait_until_finished() {
        let state = WorkerState::new("sample");
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_until_finished().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.set_status(WorkerStatus::Failed);
        let status = waiter.await.unwrap();
        assert_eq!(status, WorkerStatus::Failed);
        assert!(!state.is_alive());
        assert!(state.is_finished());
    }

    #[tokio::test]
    async fn test_wait_until_finished_when_already_stopped() {
        let state = WorkerState::new("sample");
        state.set_status(WorkerStatus::Stopped);
        assert_eq!(state.wait_until_finished().await, WorkerStatus::Stopped);
    }

    #[test]
    fn test_begin_stopping_never_reopens_a_finished_pump() {
        let state = WorkerState::new("sample");
        state.set_status(WorkerStatus::Idle);
        assert!(state.begin_stopping());
        assert_eq!(state.status(), WorkerStatus::Stopping);
        assert!(!state.begin_stopping());

        state.set_status(WorkerStatus::Stopped);
        assert!(!state.begin_stopping());
        assert_eq!(state.status(), WorkerStatus::Stopped);

        state.set_status(WorkerStatus::Failed);
        assert!(!state.begin_stopping());
        assert_eq!(state.status(), WorkerStatus::Failed);
    }

    #[test]
    fn test_mark_bound_keeps_a_pending_stop() {
        let state = WorkerState::new("sample");
        assert!(state.begin_stopping());
        assert!(!state.mark_bound());
        assert_eq!(state.status(), WorkerStatus::Stopping);

        let fresh = WorkerState::new("sample");
        assert!(fresh.mark_bound());
        assert_eq!(fresh.status(), WorkerStatus::Idle);
    }
}
