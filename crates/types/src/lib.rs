//! Shared domain types for the Masque identity and ledger service.
//!
//! Actors own handles, handles own balances, and value moves between
//! [`Party`] values inside a [`Transaction`].

pub mod actor;
pub mod handle;
pub mod transaction;

pub use actor::*;
pub use handle::*;
pub use transaction::*;

/// Currency glyph used in every user-facing amount.
pub const COIN: &str = "¥";
