//! Masque balance ledger.
//!
//! Holds one integer balance per handle, moves funds between handles and
//! mirrors every successful movement into the audit channels of the actors
//! involved, followed by a refreshed balance statement.

pub mod audit;
pub mod errors;
pub mod ledger;
pub mod router;
pub mod statement;

pub use audit::{AuditMessage, AuditSink, AuditTrail, MemoryAuditSink};
pub use errors::{AuditError, LedgerError, Result};
pub use ledger::{Ledger, LedgerConfig};
pub use router::{classify, Posting, RecordKind};
pub use statement::{balance_report, statement_text, STATEMENT_RULE};
