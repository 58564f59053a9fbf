//! Reconciliation error taxonomy.

use thiserror::Error;

/// Errors surfaced by a reconciliation.
///
/// Any error aborts the whole flow; no partial response is produced.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Neither email nor phone supplied, or a value failed syntax validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Store I/O failure, lock timeout or contention. Not retried here.
    #[error("storage failure: {0:#}")]
    StorageFailure(#[from] anyhow::Error),

    /// The store holds a state the reconciliation rules forbid.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ReconcileError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Whether the caller is at fault (client-side rejection).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;
