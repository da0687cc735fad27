//! Transaction routing: which actor's audit channel gets which record.

use masque_types::{ActorId, Party, Transaction, COIN};
use serde::{Deserialize, Serialize};

/// Kind of audit record, each with its own leading glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    SelfTransfer,
    Debit,
    Credit,
    Collected,
    Collector,
}

impl RecordKind {
    pub fn glyph(self) -> &'static str {
        match self {
            RecordKind::SelfTransfer => "🔁",
            RecordKind::Debit => "🟥",
            RecordKind::Credit => "🟩",
            RecordKind::Collected => "⏬",
            RecordKind::Collector => "▶️",
        }
    }

    /// Render the record text for a transaction.
    pub fn render(self, tx: &Transaction) -> String {
        let glyph = self.glyph();
        let (payer, recipient, amount) = (&tx.payer, &tx.recipient, tx.amount);
        match self {
            RecordKind::SelfTransfer => {
                format!("{glyph} **{payer}** --> **{recipient}**: {COIN} {amount}")
            }
            RecordKind::Debit => format!("{glyph} **{payer}** --> {recipient}: {COIN} {amount}"),
            RecordKind::Credit => format!("{glyph} {payer} --> **{recipient}**: {COIN} {amount}"),
            RecordKind::Collected => format!("{glyph} Collected {COIN} {amount} from **{payer}**"),
            RecordKind::Collector => format!(
                "{glyph} --> **{recipient}**: total {COIN} {amount} collected from your other handles."
            ),
        }
    }
}

/// A record destined for one actor's audit channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub actor_id: ActorId,
    pub kind: RecordKind,
    pub text: String,
}

impl Posting {
    fn new(actor_id: &ActorId, kind: RecordKind, tx: &Transaction) -> Self {
        Self {
            actor_id: actor_id.clone(),
            kind,
            text: kind.render(tx),
        }
    }
}

/// Classify a transaction given the actors owning its payer and recipient.
///
/// Owners are `None` for pseudo-parties and for handles nobody holds.
pub fn classify(
    tx: &Transaction,
    payer_owner: Option<&ActorId>,
    recipient_owner: Option<&ActorId>,
) -> Vec<Posting> {
    match (payer_owner, recipient_owner) {
        (Some(payer), _) if tx.recipient == Party::Collector => {
            vec![Posting::new(payer, RecordKind::Collected, tx)]
        }
        (Some(payer), Some(recipient)) if payer == recipient => {
            vec![Posting::new(payer, RecordKind::SelfTransfer, tx)]
        }
        (Some(payer), Some(recipient)) => vec![
            Posting::new(payer, RecordKind::Debit, tx),
            Posting::new(recipient, RecordKind::Credit, tx),
        ],
        (Some(payer), None) => vec![Posting::new(payer, RecordKind::Debit, tx)],
        (None, Some(recipient)) if tx.payer == Party::CollectedFromMany => {
            vec![Posting::new(recipient, RecordKind::Collector, tx)]
        }
        (None, Some(recipient)) => vec![Posting::new(recipient, RecordKind::Credit, tx)],
        (None, None) => Vec::new(),
    }
}
