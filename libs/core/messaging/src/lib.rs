//! Messaging primitives shared by every microservice.
//!
//! - [`MessageBus`]: the transport contract (plain pub/sub, request/reply, durable work streams)
//! - [`InMemoryBus`]: in-process implementation for tests and local runs
//! - `NatsBus` (feature `nats`): NATS core + JetStream implementation
//! - [`ProcessingError`] / [`ErrorCategory`]: how business logic reports failures
//! - [`RetryPolicy`]: redelivery backoff for retryable failures

pub mod bus;
pub mod config;
pub mod error;
pub mod memory;
pub mod subject;

#[cfg(feature = "nats")]
pub mod nats;

pub use bus::{
    AckKind, Acker, ConsumerSpec, Delivery, MessageBus, MessageStream, ReceivedMessage,
    StreamSpec, WorkStream,
};
pub use config::{BackoffStrategy, RetryPolicy};
pub use error::{BusError, ErrorCategory, ProcessingError};
pub use memory::{ConsumerStats, InMemoryBus, StoredMessage};
pub use subject::{is_valid_subject, subject_matches};

#[cfg(feature = "nats")]
pub use nats::NatsBus;
