//! Error types for the identity service

use masque_handle_store::HandleStoreError;
use masque_ledger::LedgerError;
use masque_types::{HandleType, TypeError, COIN};
use thiserror::Error;

/// Coarse classification of identity errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input: invalid or reserved name, wrong type, unknown handle.
    Validation,
    /// The request collides with existing state.
    Conflict,
    InsufficientFunds,
    /// The coordinator lease could not be obtained in time.
    LockTimeout,
    /// Stored state contradicts itself.
    Integrity,
    Internal,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid handle: {handle}")]
    InvalidHandle { handle: String },

    #[error("Reserved handle: {handle}")]
    ReservedHandle { handle: String },

    #[error("Handle {handle} is {actual}, not {expected}")]
    WrongType {
        handle: String,
        actual: HandleType,
        expected: HandleType,
    },

    #[error("Handle {handle} is not a burner")]
    NotABurner { handle: String },

    #[error("Handle not found: {handle}")]
    UnknownHandle { handle: String },

    #[error("Actor not registered: {actor}")]
    UnknownActor { actor: String },

    #[error("No actor for user {user}")]
    UnknownUser { user: String },

    #[error("Actor {actor} is already registered")]
    AlreadyRegistered { actor: String },

    #[error("Handle {handle} belongs to another actor")]
    OwnedByOther { handle: String },

    #[error("Handle {handle} is not accessible to the caller")]
    NoAccess { handle: String },

    #[error("Handle {handle} is no longer available")]
    Unavailable { handle: String },

    #[error("Removing {handle} would leave its actor without {missing}")]
    WouldOrphan { handle: String, missing: String },

    #[error("Insufficient funds on {handle}: balance {balance}, requested {amount}")]
    InsufficientFunds {
        handle: String,
        balance: u64,
        amount: u64,
    },

    #[error("Lock acquisition timed out for {key}")]
    LockTimeout { key: String },

    #[error("Identity integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    HandleStore(#[from] HandleStoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Identity storage error: {0}")]
    StorageError(#[from] anyhow::Error),
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::InvalidHandle { .. }
            | IdentityError::ReservedHandle { .. }
            | IdentityError::WrongType { .. }
            | IdentityError::NotABurner { .. }
            | IdentityError::UnknownHandle { .. }
            | IdentityError::UnknownActor { .. }
            | IdentityError::UnknownUser { .. }
            | IdentityError::Type(_) => ErrorKind::Validation,
            IdentityError::AlreadyRegistered { .. }
            | IdentityError::OwnedByOther { .. }
            | IdentityError::NoAccess { .. }
            | IdentityError::Unavailable { .. }
            | IdentityError::WouldOrphan { .. } => ErrorKind::Conflict,
            IdentityError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            IdentityError::LockTimeout { .. } => ErrorKind::LockTimeout,
            IdentityError::Integrity(_) => ErrorKind::Integrity,
            IdentityError::HandleStore(err) => match err {
                HandleStoreError::AlreadyExists { .. } | HandleStoreError::Burnt { .. } => {
                    ErrorKind::Conflict
                }
                HandleStoreError::UnsupportedType { .. }
                | HandleStoreError::HandleNotFound { .. }
                | HandleStoreError::Type(_) => ErrorKind::Validation,
                HandleStoreError::ActorNotFound { .. } | HandleStoreError::Integrity(_) => {
                    ErrorKind::Integrity
                }
                HandleStoreError::Ledger(_) | HandleStoreError::StorageError(_) => {
                    ErrorKind::Internal
                }
            },
            IdentityError::Ledger(err) => match err {
                LedgerError::NoAccount { .. }
                | LedgerError::SelfTransfer { .. }
                | LedgerError::ActorNotFound { .. }
                | LedgerError::NoActiveHandle { .. } => ErrorKind::Integrity,
                LedgerError::Overflow { .. }
                | LedgerError::Audit(_)
                | LedgerError::StorageError(_) => ErrorKind::Internal,
            },
            IdentityError::StorageError(_) => ErrorKind::Internal,
        }
    }

    /// Text shown to the player who issued the command.
    pub fn user_message(&self) -> String {
        match self {
            IdentityError::InvalidHandle { handle } => format!(
                "Error: cannot create handle {handle}. Handles can only contain letters a-z \
                 (lowercase), numbers 0-9, and \\_ (underscore). May not start or end with \\_, \
                 may not have more than one \\_ in a row."
            ),
            IdentityError::ReservedHandle { handle } => {
                format!("Error: the handle {handle} is reserved and cannot be claimed.")
            }
            IdentityError::WrongType {
                handle,
                actual: HandleType::Regular,
                expected: HandleType::Burner,
            } => format!(
                "Handle **{handle}** already exists but is not a burner handle. \
                 Use \".handle {handle}\" to switch to it."
            ),
            IdentityError::WrongType {
                handle,
                actual,
                expected,
            } => format!(
                "Error: handle **{handle}** is a {actual} handle and cannot be used as a {expected} handle."
            ),
            IdentityError::NotABurner { handle } => format!(
                "Error: **{handle}** is not a burner handle, cannot be destroyed. \
                 To stop using it, simply switch to another handle."
            ),
            IdentityError::UnknownHandle { handle } => {
                format!("Error: the handle {handle} does not exist")
            }
            IdentityError::UnknownActor { .. } | IdentityError::UnknownUser { .. } => {
                "Error: you have not joined the game yet. Join with a handle first.".to_string()
            }
            IdentityError::AlreadyRegistered { .. } => {
                "Error: you have already joined the game.".to_string()
            }
            IdentityError::OwnedByOther { handle }
            | IdentityError::HandleStore(HandleStoreError::AlreadyExists { handle, .. }) => {
                format!("Error: the handle {handle} is currently registered by someone else.")
            }
            IdentityError::NoAccess { handle } => {
                format!("Error: you do not have access to {handle}")
            }
            IdentityError::Unavailable { handle }
            | IdentityError::HandleStore(HandleStoreError::Burnt { handle }) => {
                format!("Error: the handle {handle} is no longer available.")
            }
            IdentityError::WouldOrphan { handle, missing } => {
                format!("Error: cannot remove {handle}; its owner would be left without {missing}.")
            }
            IdentityError::InsufficientFunds {
                handle,
                balance,
                amount,
            } => format!(
                "Failed to transfer {COIN} **{amount}** from {handle}; current balance is {COIN} **{balance}**."
            ),
            IdentityError::LockTimeout { .. } => {
                "The system is busy right now. Please try again in a little while.".to_string()
            }
            IdentityError::Type(TypeError::EmptyHandle) => {
                "Error: no handle given.".to_string()
            }
            _ => "Error: something went wrong on our side. The game masters have been notified."
                .to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let invalid = IdentityError::InvalidHandle {
            handle: "a__b".into(),
        };
        assert_eq!(invalid.kind(), ErrorKind::Validation);

        let taken = IdentityError::HandleStore(HandleStoreError::AlreadyExists {
            handle: "alice".into(),
            owner: "p1".into(),
        });
        assert_eq!(taken.kind(), ErrorKind::Conflict);
        assert!(!taken.user_message().contains("p1"));

        let busy = IdentityError::LockTimeout {
            key: "paying_bob".into(),
        };
        assert_eq!(busy.kind(), ErrorKind::LockTimeout);

        let storage = IdentityError::StorageError(anyhow::anyhow!("disk full"));
        assert_eq!(storage.kind(), ErrorKind::Internal);
        assert!(!storage.user_message().contains("disk"));
    }

    #[test]
    fn test_wrong_type_messages() {
        let as_burner = IdentityError::WrongType {
            handle: "alice".into(),
            actual: HandleType::Regular,
            expected: HandleType::Burner,
        };
        assert!(as_burner.user_message().contains("is not a burner handle"));

        let as_npc = IdentityError::WrongType {
            handle: "alice".into(),
            actual: HandleType::Regular,
            expected: HandleType::Npc,
        };
        assert_eq!(
            as_npc.user_message(),
            "Error: handle **alice** is a regular handle and cannot be used as a npc handle."
        );
    }
}
