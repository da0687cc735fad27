use crate::HandleId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One side of a funds movement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "handle", rename_all = "snake_case")]
pub enum Party {
    /// A real handle.
    Handle(HandleId),
    /// The game itself: administrative credits and balance overrides.
    System,
    /// Sink of a balance sweep; the source handle is the payer.
    Collector,
    /// Source of a balance sweep; the destination handle is the recipient.
    CollectedFromMany,
}

impl Party {
    pub fn handle(&self) -> Option<&HandleId> {
        match self {
            Party::Handle(handle) => Some(handle),
            _ => None,
        }
    }
}

impl From<HandleId> for Party {
    fn from(handle: HandleId) -> Self {
        Party::Handle(handle)
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Handle(handle) => f.write_str(handle.as_str()),
            Party::System => f.write_str("system"),
            Party::Collector => f.write_str("collector"),
            Party::CollectedFromMany => f.write_str("your other handles"),
        }
    }
}

/// Ephemeral description of a single funds movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub payer: Party,
    pub recipient: Party,
    pub amount: u64,
    pub success: bool,
    /// Final transaction of a batch; triggers the audit statement refresh.
    pub last_in_sequence: bool,
    /// Feedback for the initiating actor, if any.
    pub report: Option<String>,
}

impl Transaction {
    /// A pending transaction, last in its (single-element) sequence.
    pub fn new(payer: impl Into<Party>, recipient: impl Into<Party>, amount: u64) -> Self {
        Self {
            payer: payer.into(),
            recipient: recipient.into(),
            amount,
            success: false,
            last_in_sequence: true,
            report: None,
        }
    }

    /// A transaction that already happened, e.g. an administrative credit.
    pub fn settled(payer: impl Into<Party>, recipient: impl Into<Party>, amount: u64) -> Self {
        Self {
            success: true,
            ..Self::new(payer, recipient, amount)
        }
    }

    pub fn with_last_in_sequence(mut self, last: bool) -> Self {
        self.last_in_sequence = last;
        self
    }

    pub fn with_report(mut self, report: impl Into<String>) -> Self {
        self.report = Some(report.into());
        self
    }
}
