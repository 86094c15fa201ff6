//! Error types for the microservice runtime.

use core_config::ConfigError;
use domain_workdata::{DescriptorError, WiringError};
use messaging::BusError;
use thiserror::Error;

/// Errors raised by the work consumer, the control plane and their wiring.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Bus operation failed
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// A bus operation kept failing after every retry
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: BusError,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Descriptor could not be loaded
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Descriptor and processor do not fit together
    #[error("wiring error: {0}")]
    Wiring(#[from] WiringError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A control subscription ended while the service was still running
    #[error("control plane lost: subscription on '{subject}' closed")]
    ControlPlaneLost { subject: String },

    #[error("work consumer already started")]
    AlreadyStarted,

    #[error("work consumer was terminated")]
    Terminated,
}

impl ConsumerError {
    pub fn exhausted(operation: &'static str, attempts: u32, source: BusError) -> Self {
        Self::Exhausted {
            operation,
            attempts,
            source,
        }
    }

    /// Whether the pump gave up on the broker rather than on its own setup.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ConsumerError::Bus(_)
                | ConsumerError::Exhausted { .. }
                | ConsumerError::ControlPlaneLost { .. }
        )
    }
}
