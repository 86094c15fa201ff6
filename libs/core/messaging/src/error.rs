//! Error types for message processing and bus transport.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error categories determine how a failed work unit is settled.
///
/// - **Transient**: temporary failure, left for redelivery with backoff
/// - **Permanent**: unrecoverable, terminated and dead-lettered immediately
/// - **RateLimited**: upstream throttling, redelivered honouring any retry-after hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transient,
    Permanent,
    RateLimited,
}

impl ErrorCategory {
    /// Whether a message failing with this category may be redelivered.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }

    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by business logic for one work unit.
///
/// Processors return this instead of throwing, so the consumer's ack decision is
/// a pure function of the returned category.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Transient error (network timeout, temporary unavailability)
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Permanent error (invalid data, business rule violation)
    #[error("permanent error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Rate limited by upstream service
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The processor has no handler for this kind of work
    #[error("work type '{work_type}' is not supported by this processor")]
    Unsupported { work_type: String },

    /// Serialization error inside business logic
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProcessingError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited_with_retry(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn unsupported(work_type: impl Into<String>) -> Self {
        Self::Unsupported {
            work_type: work_type.into(),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessingError::Transient { .. } => ErrorCategory::Transient,
            ProcessingError::Permanent { .. } => ErrorCategory::Permanent,
            ProcessingError::RateLimited { .. } => ErrorCategory::RateLimited,
            ProcessingError::Unsupported { .. } => ErrorCategory::Permanent,
            ProcessingError::Serialization(_) => ErrorCategory::Permanent,
        }
    }

    /// Retry-after hint supplied by a rate limited upstream, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProcessingError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Error raised by the message bus itself (transport, streams, acknowledgements).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request to '{subject}' timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    #[error("no responders on subject '{0}'")]
    NoResponders(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("acknowledgement error: {0}")]
    Ack(String),

    #[error("message bus is closed")]
    Closed,
}

impl BusError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Missing streams and consumers are configuration problems; everything
    /// else may clear up after a reconnect.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BusError::StreamNotFound(_))
    }

    pub fn consumer(msg: impl fmt::Display) -> Self {
        Self::Consumer(msg.to_string())
    }

    pub fn publish(msg: impl fmt::Display) -> Self {
        Self::Publish(msg.to_string())
    }

    pub fn ack(msg: impl fmt::Display) -> Self {
        Self::Ack(msg.to_string())
    }
}
