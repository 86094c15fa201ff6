//! Error types for the work data domain.

use crate::models::WorkDataKind;
use std::path::PathBuf;
use thiserror::Error;

/// Why a work payload could not be turned into a [`WorkData`](crate::WorkData).
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not a JSON object at all.
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// JSON without a string `type` discriminator.
    #[error("payload has no 'type' discriminator")]
    MissingType,

    /// Discriminator names a variant this binary does not know.
    #[error("unknown work data type '{0}'")]
    UnknownType(String),

    /// Known discriminator, but the fields do not fit the variant.
    #[error("malformed '{kind}' payload: {source}")]
    Malformed {
        kind: WorkDataKind,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Schema mismatches cannot be fixed by redelivering the same bytes.
    pub fn is_schema_mismatch(&self) -> bool {
        !matches!(self, DecodeError::Malformed { .. })
    }

    /// The variant the payload claimed to be, when known.
    pub fn kind(&self) -> Option<WorkDataKind> {
        match self {
            DecodeError::Malformed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Errors loading or validating a microservice descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read descriptor from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid descriptor JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected system message of type 'descriptor', found '{0}'")]
    WrongType(String),

    #[error("descriptor field '{0}' must not be empty")]
    EmptyField(&'static str),
}

/// A descriptor and processor that do not fit together.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WiringError {
    #[error("descriptor lists unknown work data type '{0}'")]
    UnknownWorkData(String),

    #[error("processor '{processor}' does not handle work data type '{kind}' listed in the descriptor")]
    NotAccepted {
        processor: String,
        kind: WorkDataKind,
    },

    #[error("processor '{0}' accepts no work data types")]
    NothingAccepted(String),
}
