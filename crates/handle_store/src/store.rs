//! Handle store implementation
//!
//! Handles are claimed globally: once a name is in the index it belongs to
//! one actor until it is purged. Burnt handles stay in the index.

use crate::errors::*;
use masque_ledger::Ledger;
use masque_storage::{ActorRecord, HandleRecord, Storage};
use masque_types::{
    ActorId, Handle, HandleId, HandleType, HandleValidity, ReservedHandles,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Handle store
pub struct HandleStore {
    storage: Arc<dyn Storage>,
    ledger: Arc<Ledger>,
    reserved: ReservedHandles,
    /// Serialises the exists-check and insert of `create`.
    claims: Mutex<()>,
}

impl HandleStore {
    pub fn new(storage: Arc<dyn Storage>, ledger: Arc<Ledger>, reserved: ReservedHandles) -> Self {
        Self {
            storage,
            ledger,
            reserved,
            claims: Mutex::new(()),
        }
    }

    pub fn reserved(&self) -> &ReservedHandles {
        &self.reserved
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn validate(&self, candidate: &str) -> HandleValidity {
        self.reserved.validate(candidate)
    }

    /// Create a handle for an actor.
    ///
    /// Names that fail validation come back as an unowned handle tagged
    /// `Invalid` or `Reserved`; reserved names are only claimable with
    /// `force_reserved`.
    pub fn create(
        &self,
        actor_id: &ActorId,
        handle_id: &HandleId,
        handle_type: HandleType,
        force_reserved: bool,
    ) -> Result<Handle> {
        if !handle_type.is_creatable() {
            return Err(HandleStoreError::UnsupportedType { handle_type });
        }
        match self.validate(handle_id.as_str()) {
            HandleValidity::Allowed => {}
            HandleValidity::Reserved if force_reserved => {
                debug!(handle = %handle_id, "Claiming reserved handle");
            }
            HandleValidity::Reserved => {
                return Ok(Handle::unowned(handle_id.clone(), HandleType::Reserved))
            }
            HandleValidity::Invalid => {
                return Ok(Handle::unowned(handle_id.clone(), HandleType::Invalid))
            }
        }

        {
            let _claim = self.claims.lock();
            if let Some(existing) = self.storage.get_handle(handle_id)? {
                return Err(HandleStoreError::AlreadyExists {
                    handle: handle_id.to_string(),
                    owner: existing.actor_id.to_string(),
                });
            }
            self.storage.put_handle(&HandleRecord {
                handle_id: handle_id.clone(),
                actor_id: actor_id.clone(),
                handle_type,
            })?;
            if self.storage.get_actor(actor_id)?.is_some() {
                self.storage
                    .update_actor(actor_id, &mut |record: &mut ActorRecord| {
                        if !record.handles.contains(handle_id) {
                            record.handles.push(handle_id.clone());
                        }
                        Ok(())
                    })?;
            } else {
                let mut record = ActorRecord::new(actor_id.clone());
                record.handles.push(handle_id.clone());
                self.storage.put_actor(&record)?;
            }
        }
        self.ledger.init(handle_id)?;

        info!(actor = %actor_id, handle = %handle_id, %handle_type, "Handle created");
        Ok(Handle {
            handle_id: handle_id.clone(),
            actor_id: Some(actor_id.clone()),
            handle_type,
            is_active: false,
        })
    }

    /// Look up a handle. Absent names are `Unused`.
    pub fn get(&self, handle_id: &HandleId) -> Result<Handle> {
        let Some(record) = self.storage.get_handle(handle_id)? else {
            return Ok(Handle::unowned(handle_id.clone(), HandleType::Unused));
        };
        let is_active = self
            .storage
            .get_actor(&record.actor_id)?
            .map_or(false, |actor| actor.active.as_ref() == Some(handle_id));
        Ok(Handle {
            handle_id: record.handle_id,
            actor_id: Some(record.actor_id),
            handle_type: record.handle_type,
            is_active,
        })
    }

    /// Make the handle its owner's active handle.
    pub fn switch_active(&self, handle: &Handle) -> Result<()> {
        let record = self.owned_record(handle)?;
        if record.handle_type == HandleType::Burnt {
            return Err(HandleStoreError::Burnt {
                handle: handle.handle_id.to_string(),
            });
        }
        let is_regular = record.handle_type == HandleType::Regular;
        self.storage
            .update_actor(&record.actor_id, &mut |actor: &mut ActorRecord| {
                actor.active = Some(record.handle_id.clone());
                if is_regular {
                    actor.last_regular = Some(record.handle_id.clone());
                }
                Ok(())
            })?;
        info!(actor = %record.actor_id, handle = %record.handle_id, "Switched active handle");
        Ok(())
    }

    /// Handles of an actor in creation order.
    pub fn list_for_actor(
        &self,
        actor_id: &ActorId,
        include_burnt: bool,
        include_npc: bool,
    ) -> Result<Vec<Handle>> {
        let Some(actor) = self.storage.get_actor(actor_id)? else {
            return Ok(Vec::new());
        };
        let mut handles = Vec::with_capacity(actor.handles.len());
        for handle_id in &actor.handles {
            let Some(record) = self.storage.get_handle(handle_id)? else {
                continue;
            };
            let wanted = match record.handle_type {
                HandleType::Burnt => include_burnt,
                HandleType::Npc => include_npc,
                _ => true,
            };
            if wanted {
                handles.push(Handle {
                    is_active: actor.active.as_ref() == Some(handle_id),
                    handle_id: record.handle_id,
                    actor_id: Some(record.actor_id),
                    handle_type: record.handle_type,
                });
            }
        }
        Ok(handles)
    }

    /// Remove a handle from the index and from its owner's list.
    ///
    /// Active and last-regular pointers to the handle are cleared; choosing
    /// replacements is up to the caller. The ledger entry is left alone.
    pub fn purge(&self, handle: &Handle) -> Result<()> {
        let record = self.owned_record(handle)?;
        let _claim = self.claims.lock();
        self.storage.update_actor(&record.actor_id, &mut |actor: &mut ActorRecord| {
            actor.handles.retain(|h| h != &record.handle_id);
            if actor.active.as_ref() == Some(&record.handle_id) {
                actor.active = None;
            }
            if actor.last_regular.as_ref() == Some(&record.handle_id) {
                actor.last_regular = None;
            }
            Ok(())
        })?;
        self.storage.remove_handle(&record.handle_id)?;
        info!(actor = %record.actor_id, handle = %record.handle_id, "Handle purged");
        Ok(())
    }

    /// Turn an inactive burner into a burnt handle.
    pub fn mark_burnt(&self, handle: &Handle) -> Result<()> {
        let mut record = self.owned_record(handle)?;
        match record.handle_type {
            HandleType::Burner => {}
            HandleType::Burnt => return Ok(()),
            other => {
                return Err(HandleStoreError::Integrity(format!(
                    "cannot burn {} handle {}",
                    other, record.handle_id
                )))
            }
        }
        let active = self.active_id(&record.actor_id)?;
        if active.as_ref() == Some(&record.handle_id) {
            return Err(HandleStoreError::Integrity(format!(
                "burner {} is still active",
                record.handle_id
            )));
        }
        record.handle_type = HandleType::Burnt;
        self.storage.put_handle(&record)?;
        info!(actor = %record.actor_id, handle = %record.handle_id, "Handle burnt");
        Ok(())
    }

    pub fn active_handle(&self, actor_id: &ActorId) -> Result<Option<Handle>> {
        match self.active_id(actor_id)? {
            Some(handle_id) => self.get(&handle_id).map(Some),
            None => Ok(None),
        }
    }

    pub fn last_regular(&self, actor_id: &ActorId) -> Result<Option<Handle>> {
        match self.storage.get_actor(actor_id)?.and_then(|a| a.last_regular) {
            Some(handle_id) => self.get(&handle_id).map(Some),
            None => Ok(None),
        }
    }

    pub fn actor(&self, actor_id: &ActorId) -> Result<Option<ActorRecord>> {
        Ok(self.storage.get_actor(actor_id)?)
    }

    pub fn actors(&self) -> Result<Vec<ActorRecord>> {
        Ok(self.storage.list_actors()?)
    }

    /// Point `last_regular` at the first regular handle of the actor other
    /// than `excluding`. Returns the new pointer.
    pub fn reassign_last_regular(
        &self,
        actor_id: &ActorId,
        excluding: &HandleId,
    ) -> Result<Option<HandleId>> {
        let replacement = self
            .list_for_actor(actor_id, false, false)?
            .into_iter()
            .find(|h| h.handle_type == HandleType::Regular && &h.handle_id != excluding)
            .map(|h| h.handle_id);
        self.storage
            .update_actor(actor_id, &mut |actor: &mut ActorRecord| {
                actor.last_regular = replacement.clone();
                Ok(())
            })?;
        debug!(actor = %actor_id, last_regular = ?replacement, "Reassigned last regular handle");
        Ok(replacement)
    }

    /// Drop every handle and actor record. Returns the removed handle ids so
    /// their ledger entries can be closed.
    pub fn clear_all(&self) -> Result<Vec<HandleId>> {
        let _claim = self.claims.lock();
        let mut removed = Vec::new();
        for actor in self.storage.list_actors()? {
            for handle_id in &actor.handles {
                self.storage.remove_handle(handle_id)?;
                removed.push(handle_id.clone());
            }
            self.storage.remove_actor(&actor.actor_id)?;
        }
        for orphan in self.storage.list_handles()? {
            self.storage.remove_handle(&orphan.handle_id)?;
            removed.push(orphan.handle_id);
        }
        info!(handles = removed.len(), "Cleared all handles");
        Ok(removed)
    }

    fn active_id(&self, actor_id: &ActorId) -> Result<Option<HandleId>> {
        Ok(self.storage.get_actor(actor_id)?.and_then(|a| a.active))
    }

    /// Stored record of a handle, checked against the caller's view of its owner.
    fn owned_record(&self, handle: &Handle) -> Result<HandleRecord> {
        let record = self
            .storage
            .get_handle(&handle.handle_id)?
            .ok_or_else(|| HandleStoreError::HandleNotFound {
                handle: handle.handle_id.to_string(),
            })?;
        match &handle.actor_id {
            Some(owner) if owner == &record.actor_id => Ok(record),
            Some(owner) => Err(HandleStoreError::Integrity(format!(
                "handle {} belongs to {}, not {}",
                record.handle_id, record.actor_id, owner
            ))),
            None => Err(HandleStoreError::Integrity(format!(
                "handle {} passed without an owner",
                record.handle_id
            ))),
        }
    }
}
