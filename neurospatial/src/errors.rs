//! Error and result types for spatial index operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while building, persisting or querying an index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Struct version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Count {0} overflows the 32-bit range of collective primitives")]
    CountOverflow(u64),

    #[error("Communication failure: {0}")]
    Comm(String),

    #[error("Total number of elements not known before finalize()")]
    NotFinalized,

    #[error("Operation canceled")]
    Canceled,
}

/// Result type for spatial index operations.
pub type IndexResult<T> = Result<T, IndexError>;

impl IndexError {
    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        IndexError::Serialization(err.to_string())
    }

    pub(crate) fn comm(err: impl std::fmt::Display) -> Self {
        IndexError::Comm(err.to_string())
    }
}
