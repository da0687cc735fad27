//! Masque identity service
//!
//! Ties the handle store, the ledger and the coordinator together. Every
//! identity-mutating operation runs under the global lease; the command
//! API turns outcomes and errors into the text shown to players.

pub mod collaborators;
pub mod commands;
pub mod config;
pub mod errors;
pub mod service;

pub use collaborators::{
    ActorDirectory, MappedActorDirectory, NoopSessionArchiver, RecordingSessionArchiver,
    SessionArchiver,
};
pub use config::IdentityConfig;
pub use errors::{ErrorKind, IdentityError, Result};
pub use service::{BurnOutcome, CollectOutcome, IdentityService, Outcome};
