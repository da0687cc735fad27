//! Masque handle store
//!
//! Owns the global handle index and each actor's handle list, active
//! handle and last regular handle. Every created handle gets a ledger
//! entry.

pub mod errors;
pub mod store;

pub use errors::{HandleStoreError, Result};
pub use store::HandleStore;
