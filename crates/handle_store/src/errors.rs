//! Error types for the handle store

use masque_ledger::LedgerError;
use masque_types::{HandleType, TypeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandleStoreError {
    #[error("Handle already exists: {handle} (owned by {owner})")]
    AlreadyExists { handle: String, owner: String },

    #[error("Handles of type {handle_type} cannot be created")]
    UnsupportedType { handle_type: HandleType },

    #[error("Handle not found: {handle}")]
    HandleNotFound { handle: String },

    #[error("Handle {handle} is burnt")]
    Burnt { handle: String },

    #[error("Actor not found: {actor}")]
    ActorNotFound { actor: String },

    #[error("Handle integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Handle storage error: {0}")]
    StorageError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HandleStoreError>;
