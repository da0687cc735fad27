//! Handle balances and the operations that move them.

use crate::audit::{AuditSink, AuditTrail};
use crate::errors::*;
use crate::statement;
use masque_storage::Storage;
use masque_types::{ActorId, HandleId, HandleType, Party, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Extra delivery attempts for each audit record.
    pub audit_post_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            audit_post_retries: 3,
        }
    }
}

/// Balance ledger keyed by handle.
///
/// Every balance write happens under one internal lock, so a transfer's
/// check-then-move is atomic with respect to every other balance mutation.
pub struct Ledger {
    storage: Arc<dyn Storage>,
    audit: AuditTrail,
    writes: Mutex<()>,
}

impl Ledger {
    pub fn new(storage: Arc<dyn Storage>, sink: Arc<dyn AuditSink>, config: LedgerConfig) -> Self {
        Self {
            audit: AuditTrail::new(storage.clone(), sink, config.audit_post_retries),
            storage,
            writes: Mutex::new(()),
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Create a zero balance. Existing entries are left alone.
    pub fn init(&self, handle: &HandleId) -> Result<()> {
        let _guard = self.writes.lock();
        if self.storage.get_balance(handle)?.is_none() {
            self.storage.put_balance(handle, 0)?;
            debug!(%handle, "Ledger entry initialised");
        }
        Ok(())
    }

    /// Remove a balance entry, optionally refreshing the owner's statement.
    pub async fn deinit(&self, handle: &HandleId, post_closing_record: bool) -> Result<()> {
        let owner = self.audit.owner_of(&Party::Handle(handle.clone()))?;
        {
            let _guard = self.writes.lock();
            self.storage.remove_balance(handle)?;
        }
        debug!(%handle, "Ledger entry removed");
        if let (true, Some(owner)) = (post_closing_record, owner) {
            self.audit.refresh_statement(&owner).await?;
        }
        Ok(())
    }

    pub fn balance(&self, handle: &HandleId) -> Result<u64> {
        self.storage
            .get_balance(handle)?
            .ok_or_else(|| LedgerError::NoAccount {
                handle: handle.to_string(),
            })
    }

    /// Move `amount` from payer to recipient. `Ok(false)` when the payer
    /// cannot cover it; nothing is written in that case.
    pub fn transfer(&self, payer: &HandleId, recipient: &HandleId, amount: u64) -> Result<bool> {
        if payer == recipient {
            return Err(LedgerError::SelfTransfer {
                handle: payer.to_string(),
            });
        }
        let _guard = self.writes.lock();
        let available = self.balance(payer)?;
        let held = self.balance(recipient)?;
        if amount > available {
            return Ok(false);
        }
        let credited = held
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow {
                handle: recipient.to_string(),
            })?;
        self.storage.put_balance(payer, available - amount)?;
        self.storage.put_balance(recipient, credited)?;
        Ok(true)
    }

    /// Transfer and post the audit records of a successful move.
    pub async fn transfer_and_record(
        &self,
        payer: &HandleId,
        recipient: &HandleId,
        amount: u64,
    ) -> Result<Transaction> {
        let mut tx = Transaction::new(payer.clone(), recipient.clone(), amount);
        tx.success = self.transfer(payer, recipient, amount)?;
        if tx.success {
            self.audit.record(&tx).await?;
        }
        Ok(tx)
    }

    /// Administrative override, audited as money out to and back in from the system.
    pub async fn adjust(&self, handle: &HandleId, new_balance: u64) -> Result<()> {
        let old_balance = {
            let _guard = self.writes.lock();
            let old_balance = self.balance(handle)?;
            self.storage.put_balance(handle, new_balance)?;
            old_balance
        };
        info!(%handle, old_balance, new_balance, "Balance overridden");

        let out = Transaction::settled(handle.clone(), Party::System, old_balance)
            .with_last_in_sequence(false);
        self.audit.record(&out).await?;
        let back = Transaction::settled(Party::System, handle.clone(), new_balance);
        self.audit.record(&back).await?;
        Ok(())
    }

    /// Credit from the system. Returns the new balance.
    pub async fn add_funds(&self, handle: &HandleId, amount: u64) -> Result<u64> {
        let new_balance = {
            let _guard = self.writes.lock();
            let new_balance = self
                .balance(handle)?
                .checked_add(amount)
                .ok_or_else(|| LedgerError::Overflow {
                    handle: handle.to_string(),
                })?;
            self.storage.put_balance(handle, new_balance)?;
            new_balance
        };
        let tx = Transaction::settled(Party::System, handle.clone(), amount);
        self.audit.record(&tx).await?;
        Ok(new_balance)
    }

    /// Sweep every balance of the actor into its active handle.
    ///
    /// Returns the total now held on the active handle.
    pub async fn collect_all(&self, actor_id: &ActorId) -> Result<u64> {
        let record = self
            .storage
            .get_actor(actor_id)?
            .ok_or_else(|| LedgerError::ActorNotFound {
                actor: actor_id.to_string(),
            })?;
        let active = record
            .active
            .clone()
            .ok_or_else(|| LedgerError::NoActiveHandle {
                actor: actor_id.to_string(),
            })?;

        let mut sources: Vec<(HandleId, u64)> = Vec::new();
        let total = {
            let _guard = self.writes.lock();
            let mut total = self.balance(&active)?;
            for handle in record.handles.iter().filter(|h| **h != active) {
                let burnt = self
                    .storage
                    .get_handle(handle)?
                    .map_or(true, |r| r.handle_type == HandleType::Burnt);
                if burnt {
                    continue;
                }
                let balance = self.storage.get_balance(handle)?.unwrap_or(0);
                if balance > 0 {
                    total = total.checked_add(balance).ok_or_else(|| LedgerError::Overflow {
                        handle: active.to_string(),
                    })?;
                    sources.push((handle.clone(), balance));
                }
            }
            for (handle, _) in &sources {
                self.storage.put_balance(handle, 0)?;
            }
            self.storage.put_balance(&active, total)?;
            total
        };

        let moved: u64 = sources.iter().map(|(_, amount)| amount).sum();
        for (handle, amount) in sources {
            let tx = Transaction::settled(handle, Party::Collector, amount)
                .with_last_in_sequence(false);
            self.audit.record(&tx).await?;
        }
        let aggregate = Transaction::settled(Party::CollectedFromMany, active.clone(), moved);
        self.audit.record(&aggregate).await?;
        info!(actor = %actor_id, %active, moved, total, "Collected balances");
        Ok(total)
    }

    pub fn balance_report(&self, actor_id: &ActorId) -> Result<String> {
        statement::balance_report(self.storage.as_ref(), actor_id)
    }
}
