//! The control plane: `hello`, `status` and `exit` on `<service>.system`.
//!
//! Requests are answered one at a time on listener tasks of their own, so a
//! slow reply never holds up the pump. The fleet broadcast subject `system` is
//! served too, for discovery only.

use crate::consumer::WorkConsumer;
use crate::error::ConsumerError;
use crate::state::WorkerState;
use domain_workdata::{
    AckReply, ControlCommand, ControlRequest, ErrorReply, MicroserviceDescriptor, SystemMessage,
    SYSTEM_SUBJECT,
};
use messaging::{BusError, MessageBus, MessageStream, ReceivedMessage};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Where a control request arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOrigin {
    /// `<service>.system`
    Service,
    /// Fleet-wide `system`
    Broadcast,
}

/// Answers control requests for one service instance.
pub struct SystemHandler {
    bus: Arc<dyn MessageBus>,
    descriptor: MicroserviceDescriptor,
    state: WorkerState,
    consumer: Arc<WorkConsumer>,
    exit_tx: watch::Sender<bool>,
}

impl SystemHandler {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        descriptor: MicroserviceDescriptor,
        state: WorkerState,
        consumer: Arc<WorkConsumer>,
    ) -> Self {
        let (exit_tx, _) = watch::channel(false);
        Self {
            bus,
            descriptor,
            state,
            consumer,
            exit_tx,
        }
    }

    pub fn descriptor(&self) -> &MicroserviceDescriptor {
        &self.descriptor
    }

    /// Flips to `true` once `exit` has been accepted.
    pub fn exit_requested(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }

    /// Subscribe to the control subjects and serve them until stopped.
    ///
    /// Both subscriptions are in place when this returns, so the service is
    /// diagnosable before its pump pulls anything.
    pub async fn subscribe_to_system_subject(
        self: Arc<Self>,
    ) -> Result<ControlPlane, BusError> {
        let subject = self.descriptor.control_subject();
        let service = self.bus.subscribe(&subject).await?;
        let broadcast = self.bus.subscribe(SYSTEM_SUBJECT).await?;

        info!(
            subject = %subject,
            broadcast = SYSTEM_SUBJECT,
            "Control plane subscribed"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let lost_tx = Arc::new(watch::Sender::new(None));
        let tasks = vec![
            tokio::spawn(self.clone().listen(
                service,
                ControlOrigin::Service,
                stop_rx.clone(),
                lost_tx.clone(),
            )),
            tokio::spawn(self.clone().listen(
                broadcast,
                ControlOrigin::Broadcast,
                stop_rx,
                lost_tx.clone(),
            )),
        ];

        Ok(ControlPlane {
            subject,
            stop_tx,
            lost_tx,
            tasks,
        })
    }

    async fn listen(
        self: Arc<Self>,
        mut messages: Box<dyn MessageStream>,
        origin: ControlOrigin,
        mut stop_rx: watch::Receiver<bool>,
        lost_tx: Arc<watch::Sender<Option<ControlOrigin>>>,
    ) {
        loop {
            let message = tokio::select! {
                _ = stop_rx.changed() => break,
                message = messages.next() => message,
            };
            let Some(message) = message else {
                if *stop_rx.borrow() {
                    debug!(origin = ?origin, "Control subscription closed");
                } else {
                    error!(origin = ?origin, "Control subscription closed unexpectedly");
                    lost_tx.send_if_modified(|lost| {
                        if lost.is_some() {
                            return false;
                        }
                        *lost = Some(origin);
                        true
                    });
                }
                break;
            };
            self.handle(message, origin).await;
        }
    }

    /// Answer one request.
    pub async fn handle(&self, message: ReceivedMessage, origin: ControlOrigin) {
        let request = ControlRequest::parse(&message.payload);
        trace!(subject = %message.subject, request = ?request, "Control request");

        match (origin, request) {
            (ControlOrigin::Service, ControlRequest::Command(ControlCommand::Exit)) => {
                self.exit(message.reply.as_deref()).await;
            }
            (_, ControlRequest::Command(command @ (ControlCommand::Hello | ControlCommand::Status))) => {
                let reply = match self.answer(command).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(command = %command, error = %e, "Failed to build control reply");
                        reply_payload(&ErrorReply::internal(e.to_string()))
                    }
                };
                let target = match (message.reply.as_deref(), origin) {
                    (Some(reply), _) => Some(reply),
                    (None, ControlOrigin::Broadcast) => Some(SYSTEM_SUBJECT),
                    (None, ControlOrigin::Service) => None,
                };
                match target {
                    Some(target) => self.send(target, reply).await,
                    None => debug!(command = %command, "Control request without reply subject"),
                }
            }
            (ControlOrigin::Service, ControlRequest::Unsupported(cmd)) => {
                debug!(cmd = %cmd, "Unsupported control command");
                if let Some(reply) = message.reply.as_deref() {
                    self.send(reply, reply_payload(&ErrorReply::unsupported(cmd)))
                        .await;
                }
            }
            // Broadcast traffic includes other services' descriptors and our own replies.
            (ControlOrigin::Broadcast, request) => {
                trace!(request = ?request, "Ignoring broadcast message");
            }
        }
    }

    async fn answer(&self, command: ControlCommand) -> Result<Vec<u8>, serde_json::Error> {
        match command {
            ControlCommand::Hello => self.descriptor.to_json(),
            ControlCommand::Status => SystemMessage::Status(self.state.snapshot().await).to_json(),
            ControlCommand::Exit => serde_json::to_vec(&AckReply::accepted()),
        }
    }

    /// Reply first, then stop the pump off this task.
    async fn exit(&self, reply: Option<&str>) {
        if let Some(reply) = reply {
            self.send(reply, reply_payload(&AckReply::accepted())).await;
            if let Err(e) = self.bus.flush().await {
                warn!(error = %e, "Failed to flush exit acknowledgement");
            }
        }

        info!(service = %self.descriptor.name, "Exit requested over control subject");
        self.exit_tx.send_replace(true);

        let consumer = self.consumer.clone();
        tokio::spawn(async move { consumer.terminate().await });
    }

    async fn send(&self, subject: &str, payload: Vec<u8>) {
        if let Err(e) = self.bus.publish(subject, payload).await {
            warn!(subject = %subject, error = %e, "Failed to send control reply");
        }
    }
}

fn reply_payload<T: Serialize>(reply: &T) -> Vec<u8> {
    serde_json::to_vec(reply).unwrap_or_else(|_| br#"{"error":"internal"}"#.to_vec())
}

/// Running control-plane listeners.
pub struct ControlPlane {
    subject: String,
    stop_tx: watch::Sender<bool>,
    lost_tx: Arc<watch::Sender<Option<ControlOrigin>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    /// Resolve once a control subscription ends without [`ControlPlane::stop`].
    pub async fn lost(&self) -> ConsumerError {
        let mut rx = self.lost_tx.subscribe();
        let origin = match rx.wait_for(Option::is_some).await {
            Ok(lost) => *lost,
            Err(_) => None,
        };
        let subject = match origin {
            Some(ControlOrigin::Broadcast) => SYSTEM_SUBJECT.to_string(),
            _ => self.subject.clone(),
        };
        ConsumerError::ControlPlaneLost { subject }
    }

    /// Stop answering and drop the subscriptions.
    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Control listener ended abnormally");
            }
        }
        info!("Control plane stopped");
    }
}
