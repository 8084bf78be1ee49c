//! Error Module - PGAS Error Types
//!
//! Defines all error types used by the runtime. Each variant corresponds to
//! one failure kind; callers match on the variant to decide whether an
//! operation can be retried at a higher level.

use std::sync::PoisonError;
use thiserror::Error;

/// Main error type for all PGAS operations
#[derive(Debug, Error)]
pub enum PgasError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to open shared region: {0}")]
    RegionOpen(String),

    #[error("Peer bring-up connected {connected} of {expected} peers")]
    ConnectIncomplete { connected: usize, expected: usize },

    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Pointer {node_id}:{offset:#x} does not translate on this node")]
    Translate { node_id: u16, offset: u64 },

    #[error("Communication with node {node_id} failed: {reason}")]
    Communication { node_id: u16, reason: String },

    #[error("Invalid remote metadata: {0}")]
    InvalidRemoteMetadata(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PgasError {
    /// Check if the caller may retry the surrounding operation
    ///
    /// The runtime itself never retries; communication and allocation
    /// failures are reported up and the collaborator decides.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PgasError::OutOfMemory { .. }
                | PgasError::Communication { .. }
                | PgasError::Translate { .. }
                | PgasError::InvalidRemoteMetadata(_)
        )
    }

    /// Check if this error terminates initialization
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgasError::Config(_) | PgasError::RegionOpen(_) | PgasError::ConnectIncomplete { .. }
        )
    }

    /// Check if this error indicates a bug in the runtime
    pub fn is_bug(&self) -> bool {
        matches!(self, PgasError::Internal(_) | PgasError::LockPoisoned(_))
    }
}

impl<T> From<PoisonError<T>> for PgasError {
    fn from(err: PoisonError<T>) -> Self {
        PgasError::LockPoisoned(err.to_string())
    }
}

/// Result type alias for PGAS operations
pub type Result<T> = std::result::Result<T, PgasError>;
