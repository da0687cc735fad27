//! Standing balance summary for an actor.

use crate::errors::*;
use masque_storage::Storage;
use masque_types::{ActorId, HandleType, COIN};

/// Separator placed above every posted statement.
pub const STATEMENT_RULE: &str = "========================";

/// Balances of every non-burnt handle an actor owns, active handle in bold.
pub fn balance_report(storage: &dyn Storage, actor_id: &ActorId) -> Result<String> {
    let record = storage
        .get_actor(actor_id)?
        .ok_or_else(|| LedgerError::ActorNotFound {
            actor: actor_id.to_string(),
        })?;

    let mut report = String::from("Current balance for all your accounts:\n");
    let mut total: u64 = 0;
    for handle in &record.handles {
        let burnt = storage
            .get_handle(handle)?
            .map_or(true, |h| h.handle_type == HandleType::Burnt);
        if burnt {
            continue;
        }
        let balance = storage.get_balance(handle)?.unwrap_or(0);
        total = total.saturating_add(balance);
        if record.active.as_ref() == Some(handle) {
            report.push_str(&format!("> **{handle}**: {COIN} **{balance}**\n"));
        } else {
            report.push_str(&format!("> {handle}: {COIN} **{balance}**\n"));
        }
    }
    report.push_str(&format!("Total: {COIN} **{total}**"));
    Ok(report)
}

/// Full text of a posted statement message.
pub fn statement_text(storage: &dyn Storage, actor_id: &ActorId) -> Result<String> {
    Ok(format!("{STATEMENT_RULE}\n{}", balance_report(storage, actor_id)?))
}
