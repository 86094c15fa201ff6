//! Scripted processor for pump and control-plane tests.

use async_trait::async_trait;
use domain_workdata::{
    ProcessResult, SampleWorkData, ScannerSendWorkData, SpdxWorkData, WorkData, WorkDataKind,
    WorkDataProcessor,
};
use messaging::ProcessingError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};

/// What the next handler call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Transient,
    Permanent,
    RateLimited(Duration),
    Panic,
}

/// A processor whose results follow a script.
///
/// Handles `sample`, `scannerdata_send` and `spdx_task`; every call is recorded.
/// Once the script runs out, the fallback outcome applies.
pub struct ScriptedProcessor {
    accepted: Vec<WorkDataKind>,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    seen: Mutex<Vec<WorkData>>,
    calls: AtomicUsize,
    gate: Option<Gate>,
}

struct Gate {
    entered: Notify,
    permits: Semaphore,
}

impl Default for ScriptedProcessor {
    fn default() -> Self {
        Self::succeeding()
    }
}

impl ScriptedProcessor {
    /// Succeeds on every call.
    pub fn succeeding() -> Self {
        Self {
            accepted: vec![
                WorkDataKind::Sample,
                WorkDataKind::ScannerSend,
                WorkDataKind::Spdx,
            ],
            script: Mutex::new(VecDeque::new()),
            fallback: Outcome::Succeed,
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Plays `script` first, then `fallback`.
    pub fn scripted(script: impl IntoIterator<Item = Outcome>, fallback: Outcome) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            ..Self::succeeding()
        }
    }

    /// Same outcome on every call.
    pub fn always(outcome: Outcome) -> Self {
        Self::scripted([], outcome)
    }

    /// Restrict the accepted kinds.
    pub fn accepting(mut self, kinds: &[WorkDataKind]) -> Self {
        self.accepted = kinds.to_vec();
        self
    }

    /// Block every call until [`release`](Self::release) hands out a permit.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Gate {
            entered: Notify::new(),
            permits: Semaphore::new(0),
        });
        self
    }

    /// Wait until a call is blocked on the gate.
    pub async fn entered(&self) {
        if let Some(gate) = &self.gate {
            gate.entered.notified().await;
        }
    }

    /// Let `n` gated calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.permits.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn seen(&self) -> Vec<WorkData> {
        self.seen.lock().await.clone()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    async fn record(&self, work: WorkData) -> ProcessResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push(work);

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            if let Ok(permit) = gate.permits.acquire().await {
                permit.forget();
            }
        }

        let outcome = self.script.lock().await.pop_front().unwrap_or(self.fallback);
        match outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Transient => Err(ProcessingError::transient("scripted transient failure")),
            Outcome::Permanent => Err(ProcessingError::permanent("scripted permanent failure")),
            Outcome::RateLimited(retry_after) => Err(ProcessingError::rate_limited_with_retry(
                "scripted rate limit",
                retry_after,
            )),
            Outcome::Panic => panic!("scripted panic"),
        }
    }
}

#[async_trait]
impl WorkDataProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn accepted(&self) -> &[WorkDataKind] {
        &self.accepted
    }

    async fn process_sample(&self, data: &SampleWorkData) -> ProcessResult {
        self.record(data.clone().into()).await
    }

    async fn process_scanner_send(&self, data: &ScannerSendWorkData) -> ProcessResult {
        self.record(data.clone().into()).await
    }

    async fn process_spdx(&self, data: &SpdxWorkData) -> ProcessResult {
        self.record(data.clone().into()).await
    }
}
