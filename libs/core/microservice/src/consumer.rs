//! The work consumer: a durable pull pump feeding one processor.
//!
//! ```text
//! bind (retry) ─▶ fetch ─▶ decode ─▶ dispatch ─▶ ack / nak / term
//!                   ▲                                   │
//!                   └───────────────────────────────────┘
//! ```
//!
//! The pump runs on its own task. [`WorkConsumer::terminate`] flips a watch
//! channel: the pump stops pulling, lets in-flight units settle, then closes
//! its binding. Unsettled deliveries go back to the broker.

use crate::config::ConsumerSettings;
use crate::dlq::{DeadLetterEntry, DeadLetterPublisher, DeadLetterReason};
use crate::error::ConsumerError;
use crate::metrics::WorkMetrics;
use crate::state::WorkerState;
use domain_workdata::{WorkData, WorkDataKind, WorkDataProcessor, WorkerStatus};
use futures::FutureExt;
use messaging::{AckKind, Delivery, MessageBus, ProcessingError, WorkStream};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Drains one work subject into a [`WorkDataProcessor`].
pub struct WorkConsumer {
    pump: Arc<Pump>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkConsumer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        processor: Arc<dyn WorkDataProcessor>,
        settings: ConsumerSettings,
        state: WorkerState,
    ) -> Self {
        let metrics = WorkMetrics::new(&settings.service_name, &settings.stream_name);
        let dead_letters = settings.dead_letter_enabled.then(|| {
            DeadLetterPublisher::new(
                bus.clone(),
                settings.dead_letter_stream_spec(),
                settings.dead_letter_subject(),
            )
        });
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            pump: Arc::new(Pump {
                bus,
                processor,
                settings,
                state,
                metrics,
                dead_letters,
            }),
            started: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.pump.settings
    }

    pub fn state(&self) -> &WorkerState {
        &self.pump.state
    }

    /// Spawn the pump and return immediately.
    ///
    /// Binding and every later failure happen on the pump task; watch the
    /// [`WorkerState`] to learn how it ends.
    pub fn start(&self) -> Result<(), ConsumerError> {
        if *self.shutdown_tx.borrow() {
            return Err(ConsumerError::Terminated);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyStarted);
        }

        let pump = self.pump.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let state = pump.state.clone();
            match AssertUnwindSafe(pump.run(shutdown_rx)).catch_unwind().await {
                Ok(Ok(())) => state.set_status(WorkerStatus::Stopped),
                Ok(Err(e)) => {
                    error!(error = %e, "Work consumer exited with a fatal error");
                    state.set_error(e.to_string()).await;
                    state.set_status(WorkerStatus::Failed);
                }
                Err(_) => {
                    error!("Work consumer task panicked");
                    state.set_error("work consumer task panicked").await;
                    state.set_status(WorkerStatus::Failed);
                }
            }
        });

        Ok(())
    }

    /// Stop pulling, let the in-flight unit settle and release the binding.
    ///
    /// Idempotent and callable from any task; every caller returns once the
    /// pump has finished. On a consumer that never started it only marks the
    /// state stopped.
    pub async fn terminate(&self) {
        let already = self.shutdown_tx.send_replace(true);

        if !self.started.load(Ordering::SeqCst) {
            if !already {
                self.pump.state.set_status(WorkerStatus::Stopped);
            }
            return;
        }

        if !already {
            info!(
                service = %self.pump.settings.service_name,
                "Terminating work consumer"
            );
            self.pump.state.begin_stopping();
        }

        self.pump.state.wait_until_finished().await;
    }
}

struct Pump {
    bus: Arc<dyn MessageBus>,
    processor: Arc<dyn WorkDataProcessor>,
    settings: ConsumerSettings,
    state: WorkerState,
    metrics: WorkMetrics,
    dead_letters: Option<DeadLetterPublisher>,
}

impl Pump {
    async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        info!(
            service = %self.settings.service_name,
            stream = %self.settings.stream_name,
            subject = %self.settings.subject,
            durable = %self.settings.durable_name,
            max_concurrent = self.settings.max_concurrent,
            "Starting work consumer"
        );

        let Some(mut stream) = self.bind(&mut shutdown_rx).await? else {
            info!("Work consumer terminated before binding");
            return Ok(());
        };
        if !*shutdown_rx.borrow() {
            self.state.mark_bound();
        }

        let concurrent = self.settings.max_concurrent > 1;
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent));
        let mut failures = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let batch_size = if concurrent {
                permits.available_permits().max(1)
            } else {
                1
            };

            let fetched = tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = stream.fetch(batch_size, self.settings.fetch_timeout) => result,
            };

            match fetched {
                Ok(batch) => {
                    failures = 0;
                    if batch.is_empty() {
                        self.refresh_pending(&mut *stream).await;
                        continue;
                    }

                    for delivery in batch {
                        if concurrent {
                            let Ok(permit) = permits.clone().acquire_owned().await else {
                                break;
                            };
                            let pump = self.clone();
                            tokio::spawn(async move {
                                pump.handle(delivery).await;
                                drop(permit);
                            });
                        } else {
                            self.handle(delivery).await;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    if !e.is_transient() || failures >= self.settings.bind_attempts {
                        let _ = stream.close().await;
                        return Err(ConsumerError::exhausted("fetch", failures, e));
                    }

                    let delay = self.settings.reconnect_backoff.delay(failures - 1);
                    warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if concurrent {
            info!("Waiting for in-flight work units");
            let _ = permits
                .acquire_many(self.settings.max_concurrent as u32)
                .await;
        }

        if let Err(e) = stream.close().await {
            warn!(error = %e, "Failed to release work stream binding");
        }
        info!(service = %self.settings.service_name, "Work consumer stopped");
        Ok(())
    }

    /// Ensure streams and bind the durable consumer, retrying transient failures.
    ///
    /// `Ok(None)` means termination was requested while waiting to retry.
    async fn bind(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Option<Box<dyn WorkStream>>, ConsumerError> {
        let stream_spec = self.settings.stream_spec();
        let consumer_spec = self.settings.consumer_spec();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let bound = async {
                self.bus.ensure_stream(&stream_spec).await?;
                if let Some(dead_letters) = &self.dead_letters {
                    dead_letters.ensure_stream().await?;
                }
                self.bus.bind_work_stream(&consumer_spec).await
            }
            .await;

            match bound {
                Ok(stream) => {
                    info!(
                        stream = %consumer_spec.stream,
                        durable = %consumer_spec.durable_name,
                        subject = %consumer_spec.filter_subject,
                        "Bound to work stream"
                    );
                    return Ok(Some(stream));
                }
                Err(e) if e.is_transient() && attempt < self.settings.bind_attempts => {
                    let delay = self.settings.reconnect_backoff.delay(attempt - 1);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to bind work stream, retrying"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(ConsumerError::exhausted("bind", attempt, e)),
            }
        }
    }

    async fn refresh_pending(&self, stream: &mut dyn WorkStream) {
        match stream.pending().await {
            Ok(pending) => {
                self.state.set_pending(pending).await;
                self.metrics.pending(pending);
            }
            Err(e) => debug!(error = %e, "Could not read pending count"),
        }
    }

    /// Turn one delivery into exactly one settlement.
    async fn handle(&self, delivery: Delivery) {
        self.metrics.message_received();
        self.state.record_received().await;

        let correlation_id = delivery
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", self.settings.stream_name, delivery.sequence()));

        if delivery.is_redelivery() {
            debug!(
                correlation_id = %correlation_id,
                sequence = delivery.sequence(),
                delivery_count = delivery.delivery_count(),
                "Processing redelivered work unit"
            );
        }

        let work = match WorkData::decode(delivery.payload()) {
            Ok(work) => work,
            Err(e) if e.is_schema_mismatch() => {
                error!(
                    correlation_id = %correlation_id,
                    sequence = delivery.sequence(),
                    error = %e,
                    "Undecodable work unit, acknowledging without processing"
                );
                self.metrics.message_failed("schema");
                self.state.record_failed(e.to_string()).await;
                self.dead_letter(
                    &delivery,
                    None,
                    &correlation_id,
                    DeadLetterReason::UnknownType,
                    &e.to_string(),
                )
                .await;
                self.settle(delivery, AckKind::Ack, &correlation_id).await;
                return;
            }
            Err(e) => {
                let kind = e.kind();
                let error = ProcessingError::transient_with_source("malformed payload", e);
                self.fail(delivery, kind, error, &correlation_id).await;
                return;
            }
        };

        let kind = work.kind();
        debug!(
            work_type = %kind,
            correlation_id = %correlation_id,
            sequence = delivery.sequence(),
            "Dispatching work unit"
        );

        self.state.begin_work().await;
        let start = Instant::now();
        let result = work.dispatch(self.processor.as_ref()).await;
        let duration = start.elapsed();
        self.state.end_work().await;

        match result {
            Ok(()) => {
                self.settle(delivery, AckKind::Ack, &correlation_id).await;
                self.metrics.message_processed(duration);
                self.state.record_processed().await;
                debug!(
                    work_type = %kind,
                    correlation_id = %correlation_id,
                    duration_ms = duration.as_millis() as u64,
                    "Work unit processed"
                );
            }
            Err(error) => self.fail(delivery, Some(kind), error, &correlation_id).await,
        }
    }

    async fn fail(
        &self,
        delivery: Delivery,
        kind: Option<WorkDataKind>,
        error: ProcessingError,
        correlation_id: &str,
    ) {
        let category = error.category();
        let attempts = delivery.delivery_count();
        let work_type = kind.map(WorkDataKind::tag).unwrap_or("unknown");

        self.metrics.message_failed(category.as_str());
        self.state.record_failed(error.to_string()).await;

        let max_deliver = self.settings.max_deliver;
        let exhausted = max_deliver > 0 && i64::from(attempts) >= max_deliver;

        if !category.is_retryable() {
            error!(
                work_type,
                correlation_id,
                error = %error,
                "Permanent failure, terminating work unit"
            );
            self.dead_letter(
                &delivery,
                kind,
                correlation_id,
                DeadLetterReason::Permanent,
                &error.to_string(),
            )
            .await;
            self.settle(delivery, AckKind::Term, correlation_id).await;
        } else if exhausted {
            error!(
                work_type,
                correlation_id,
                delivery_count = attempts,
                error = %error,
                "Poison message: delivery limit reached"
            );
            self.dead_letter(
                &delivery,
                kind,
                correlation_id,
                DeadLetterReason::MaxDeliveries,
                &error.to_string(),
            )
            .await;
            self.settle(delivery, AckKind::Term, correlation_id).await;
        } else {
            let delay = self.settings.retry.delay_for(&error, attempts);
            warn!(
                work_type,
                correlation_id,
                delivery_count = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Work unit failed, requesting redelivery"
            );
            self.metrics.redelivery_requested();
            self.settle(delivery, AckKind::Nak(Some(delay)), correlation_id)
                .await;
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        kind: Option<WorkDataKind>,
        correlation_id: &str,
        reason: DeadLetterReason,
        error: &str,
    ) {
        let Some(dead_letters) = &self.dead_letters else {
            return;
        };

        let entry = DeadLetterEntry::new(
            &self.settings.service_name,
            delivery,
            kind.map(WorkDataKind::tag),
            correlation_id,
            reason,
            error,
        );
        match dead_letters.publish(&entry).await {
            Ok(_) => {
                self.metrics.dead_lettered(reason.as_ref());
                self.state.record_dead_lettered().await;
            }
            Err(e) => error!(
                correlation_id,
                error = %e,
                "Failed to publish dead letter"
            ),
        }
    }

    /// Settlement failures are logged; the broker redelivers after ack wait.
    async fn settle(&self, delivery: Delivery, kind: AckKind, correlation_id: &str) {
        let sequence = delivery.sequence();
        let result = match kind {
            AckKind::Ack => delivery.ack().await,
            AckKind::Nak(delay) => delivery.nak(delay).await,
            AckKind::Term => delivery.term().await,
        };
        if let Err(e) = result {
            warn!(
                correlation_id,
                sequence,
                ack = ?kind,
                error = %e,
                "Failed to settle work unit"
            );
        }
    }
}
