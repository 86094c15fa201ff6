//! Runtime wiring of one microservice instance.

use crate::config::ConsumerSettings;
use crate::consumer::WorkConsumer;
use crate::error::ConsumerError;
use crate::health::HealthServer;
use crate::progress::ProgressReporter;
use crate::state::WorkerState;
use crate::system::SystemHandler;
use domain_workdata::{validate_wiring, MicroserviceDescriptor, WorkDataProcessor, WorkerStatus};
use eyre::{eyre, Result, WrapErr};
use messaging::MessageBus;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// One service instance: descriptor, control plane and work consumer on a shared bus.
pub struct Microservice {
    bus: Arc<dyn MessageBus>,
    descriptor: MicroserviceDescriptor,
    settings: ConsumerSettings,
    state: WorkerState,
    health: Option<(u16, Option<PrometheusHandle>)>,
}

impl Microservice {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        descriptor: MicroserviceDescriptor,
        settings: ConsumerSettings,
    ) -> Self {
        let state = WorkerState::new(descriptor.name.clone());
        Self {
            bus,
            descriptor,
            settings,
            state,
            health: None,
        }
    }

    /// Serve the probe endpoints (and `/metrics` when a handle is given) on `port`.
    pub fn with_health_server(mut self, port: u16, metrics: Option<PrometheusHandle>) -> Self {
        self.health = Some((port, metrics));
        self
    }

    pub fn descriptor(&self) -> &MicroserviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> WorkerState {
        self.state.clone()
    }

    /// Progress handle for the processor this service runs.
    pub fn progress_reporter(&self) -> ProgressReporter {
        ProgressReporter::new(self.bus.clone(), self.state.clone())
    }

    /// Run until `shutdown` resolves, `exit` arrives or the pump fails.
    ///
    /// Teardown drains the pump before the control plane stops answering.
    /// Returns an error when the pump died fatally or a control subscription
    /// was lost.
    pub async fn run<F>(self, processor: Arc<dyn WorkDataProcessor>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let accepted = validate_wiring(&self.descriptor, processor.as_ref())
            .wrap_err("descriptor does not match processor")?;

        info!(
            service = %self.descriptor.name,
            version = %self.descriptor.version,
            processor = processor.name(),
            accepted = ?accepted,
            "Starting microservice"
        );

        let consumer = Arc::new(WorkConsumer::new(
            self.bus.clone(),
            processor,
            self.settings.clone(),
            self.state.clone(),
        ));

        let handler = Arc::new(SystemHandler::new(
            self.bus.clone(),
            self.descriptor.clone(),
            self.state.clone(),
            consumer.clone(),
        ));
        let mut exit_rx = handler.exit_requested();
        let control = handler
            .clone()
            .subscribe_to_system_subject()
            .await
            .wrap_err("failed to subscribe to control subject")?;

        let (health_stop_tx, health_stop_rx) = watch::channel(false);
        let health_task = self.health.map(|(port, metrics)| {
            let mut server = HealthServer::new(port, self.state.clone());
            if let Some(handle) = metrics {
                server = server.with_metrics(handle);
            }
            let mut stop_rx = health_stop_rx;
            tokio::spawn(async move {
                let stop = async move {
                    let _ = stop_rx.wait_for(|stop| *stop).await;
                };
                if let Err(e) = server.run(stop).await {
                    error!(error = %e, "Health server failed");
                }
            })
        });

        consumer.start()?;

        tokio::pin!(shutdown);
        let control_failure = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                None
            }
            exit = exit_rx.wait_for(|exit| *exit) => match exit {
                Ok(_) => {
                    info!("Exit command received");
                    None
                }
                Err(_) => Some(ConsumerError::ControlPlaneLost {
                    subject: self.descriptor.control_subject(),
                }),
            },
            lost = control.lost() => Some(lost),
            status = self.state.wait_until_finished() => {
                info!(status = %status, "Work consumer finished on its own");
                None
            }
        };

        consumer.terminate().await;
        control.stop().await;
        drop(handler);

        // A pump that failed on its own keeps its reason.
        if let Some(e) = control_failure {
            if self.state.status() != WorkerStatus::Failed {
                error!(error = %e, "Control plane lost, stopping");
                self.state.set_error(e.to_string()).await;
                self.state.set_status(WorkerStatus::Failed);
            }
        }

        health_stop_tx.send_replace(true);
        if let Some(task) = health_task {
            let _ = task.await;
        }

        if self.state.status() == WorkerStatus::Failed {
            let reason = self
                .state
                .last_error()
                .await
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(eyre!("work consumer failed: {}", reason));
        }

        info!(service = %self.descriptor.name, "Microservice stopped");
        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
