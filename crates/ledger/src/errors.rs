//! Error types for the ledger and audit trail

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("No ledger entry for handle {handle}")]
    NoAccount { handle: String },

    #[error("Cannot transfer from {handle} to itself")]
    SelfTransfer { handle: String },

    #[error("Balance of {handle} would overflow")]
    Overflow { handle: String },

    #[error("Actor not found: {actor}")]
    ActorNotFound { actor: String },

    #[error("Actor {actor} has no active handle")]
    NoActiveHandle { actor: String },

    #[error("Audit delivery failed: {0}")]
    Audit(#[from] AuditError),

    #[error("Ledger storage error: {0}")]
    StorageError(#[from] anyhow::Error),
}

/// Errors reported by an audit channel.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit channel backend error: {0}")]
    Backend(String),
    #[error("no audit channel for actor {0}")]
    UnknownChannel(String),
}

impl From<anyhow::Error> for AuditError {
    fn from(value: anyhow::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
