//! Messages exchanged on the control plane: system messages published by
//! services, and the request/reply vocabulary of `<service>.system`.

use crate::descriptor::MicroserviceDescriptor;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};

/// Fleet-wide broadcast subject for discovery.
pub const SYSTEM_SUBJECT: &str = "system";

/// Fleet-wide subject for progress updates.
pub const PROGRESS_SUBJECT: &str = "progress";

/// Lifecycle of a service's work consumer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum WorkerStatus {
    /// Constructed, not yet bound to its stream.
    #[default]
    Init,
    /// Bound and waiting for work.
    Idle,
    /// Dispatching a work unit.
    Working,
    /// Terminate requested, draining.
    Stopping,
    /// Binding released.
    Stopped,
    /// Pump exited on a fatal error.
    Failed,
}

/// Health snapshot answered to `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDescriptor {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    pub status: WorkerStatus,
    pub progress_percent: u8,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub uptime_seconds: u64,
    /// Queue depth, when the broker reported it.
    #[serde(default)]
    pub pending: Option<u64>,
    #[serde(default)]
    pub received: u64,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub dead_lettered: u64,
}

/// Progress of a long running task, published on [`PROGRESS_SUBJECT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub progress_percent: u8,
    #[serde(default)]
    pub details: String,
}

/// Everything a service publishes about itself, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SystemMessage {
    Descriptor(MicroserviceDescriptor),
    Status(StatusDescriptor),
    Progress(ProgressMessage),
}

impl SystemMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Commands understood on the control subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ControlCommand {
    Hello,
    Status,
    Exit,
}

/// A parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Command(ControlCommand),
    Unsupported(String),
}

#[derive(Deserialize)]
struct CommandBody {
    cmd: String,
}

impl ControlRequest {
    /// Accepts `{"cmd":"hello"}` as well as the bare word `hello`, case-insensitively.
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();

        let word = if text.starts_with('{') {
            match serde_json::from_str::<CommandBody>(text) {
                Ok(body) => body.cmd,
                Err(_) => return ControlRequest::Unsupported(text.to_string()),
            }
        } else {
            text.trim_matches('"').to_string()
        };

        match ControlCommand::from_str(word.trim()) {
            Ok(command) => ControlRequest::Command(command),
            Err(_) => ControlRequest::Unsupported(word),
        }
    }
}

/// Acceptance of a control command (`{"ack":true}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckReply {
    pub ack: bool,
}

impl AckReply {
    pub fn accepted() -> Self {
        Self { ack: true }
    }
}

/// Error-shaped control reply so callers never have to rely on a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorReply {
    pub fn unsupported(cmd: impl Into<String>) -> Self {
        Self {
            error: "unsupported".to_string(),
            cmd: Some(cmd.into()),
            message: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            error: "internal".to_string(),
            cmd: None,
            message: Some(message.into()),
        }
    }
}
