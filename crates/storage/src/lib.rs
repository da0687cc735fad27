//! Durable keyed records for actors, handles and balances.
//!
//! Three record sets are kept: a global handle index (handle → owner and
//! type), one record per actor (handle list, active and last-regular
//! pointers, audit statement message) and the balance ledger
//! (handle → integer balance).

use anyhow::Result;
use masque_types::{ActorId, HandleId, HandleType, MessageHandle};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt balance entry for {0}")]
    CorruptBalance(String),
    #[error("Actor not found: {0}")]
    ActorNotFound(String),
}

/// Entry of the global handle index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub handle_id: HandleId,
    pub actor_id: ActorId,
    pub handle_type: HandleType,
}

/// Per-actor record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub actor_id: ActorId,
    /// Handles in insertion order.
    #[serde(default)]
    pub handles: Vec<HandleId>,
    #[serde(default)]
    pub active: Option<HandleId>,
    #[serde(default)]
    pub last_regular: Option<HandleId>,
    /// Current audit statement message, if one has been posted.
    #[serde(default)]
    pub statement: Option<MessageHandle>,
}

impl ActorRecord {
    pub fn new(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            handles: Vec::new(),
            active: None,
            last_regular: None,
            statement: None,
        }
    }
}

/// Closure applied to an actor record inside [`Storage::update_actor`].
pub type ActorUpdate<'a> = &'a mut dyn FnMut(&mut ActorRecord) -> Result<()>;

/// Abstract storage trait
pub trait Storage: Send + Sync {
    fn get_handle(&self, handle: &HandleId) -> Result<Option<HandleRecord>>;
    fn put_handle(&self, record: &HandleRecord) -> Result<()>;
    fn remove_handle(&self, handle: &HandleId) -> Result<()>;
    fn list_handles(&self) -> Result<Vec<HandleRecord>>;

    fn get_actor(&self, actor: &ActorId) -> Result<Option<ActorRecord>>;
    fn put_actor(&self, record: &ActorRecord) -> Result<()>;
    fn remove_actor(&self, actor: &ActorId) -> Result<()>;
    fn list_actors(&self) -> Result<Vec<ActorRecord>>;

    /// Read-modify-write of an actor record, serialised against other updates.
    /// Nothing is written when `apply` fails. Returns the stored record.
    fn update_actor(&self, actor: &ActorId, apply: ActorUpdate<'_>) -> Result<ActorRecord>;

    fn get_balance(&self, handle: &HandleId) -> Result<Option<u64>>;
    fn put_balance(&self, handle: &HandleId, balance: u64) -> Result<()>;
    fn remove_balance(&self, handle: &HandleId) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

/// Sled-backed implementation
pub struct SledStorage {
    db: Db,
    handles: Tree,
    actors: Tree,
    balances: Tree,
    actor_writes: Mutex<()>,
}

impl SledStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let handles = db.open_tree("handles")?;
        let actors = db.open_tree("actors")?;
        let balances = db.open_tree("balances")?;
        tracing::debug!(
            handles = handles.len(),
            actors = actors.len(),
            "Opened sled storage"
        );

        Ok(Self {
            db,
            handles,
            actors,
            balances,
            actor_writes: Mutex::new(()),
        })
    }
}

impl Storage for SledStorage {
    fn get_handle(&self, handle: &HandleId) -> Result<Option<HandleRecord>> {
        self.handles
            .get(handle.as_str().as_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn put_handle(&self, record: &HandleRecord) -> Result<()> {
        self.handles.insert(
            record.handle_id.as_str().as_bytes(),
            serde_json::to_vec(record)?,
        )?;
        Ok(())
    }

    fn remove_handle(&self, handle: &HandleId) -> Result<()> {
        self.handles.remove(handle.as_str().as_bytes())?;
        Ok(())
    }

    fn list_handles(&self) -> Result<Vec<HandleRecord>> {
        self.handles
            .iter()
            .map(|r| {
                let (_, v) = r?;
                Ok(serde_json::from_slice::<HandleRecord>(&v)?)
            })
            .collect()
    }

    fn get_actor(&self, actor: &ActorId) -> Result<Option<ActorRecord>> {
        self.actors
            .get(actor.as_str().as_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn put_actor(&self, record: &ActorRecord) -> Result<()> {
        let _guard = self.actor_writes.lock();
        self.actors.insert(
            record.actor_id.as_str().as_bytes(),
            serde_json::to_vec(record)?,
        )?;
        Ok(())
    }

    fn remove_actor(&self, actor: &ActorId) -> Result<()> {
        let _guard = self.actor_writes.lock();
        self.actors.remove(actor.as_str().as_bytes())?;
        Ok(())
    }

    fn list_actors(&self) -> Result<Vec<ActorRecord>> {
        self.actors
            .iter()
            .map(|r| {
                let (_, v) = r?;
                Ok(serde_json::from_slice::<ActorRecord>(&v)?)
            })
            .collect()
    }

    fn update_actor(&self, actor: &ActorId, apply: ActorUpdate<'_>) -> Result<ActorRecord> {
        let _guard = self.actor_writes.lock();
        let mut record: ActorRecord = match self.actors.get(actor.as_str().as_bytes())? {
            Some(v) => serde_json::from_slice(&v)?,
            None => return Err(StorageError::ActorNotFound(actor.to_string()).into()),
        };
        apply(&mut record)?;
        self.actors.insert(
            record.actor_id.as_str().as_bytes(),
            serde_json::to_vec(&record)?,
        )?;
        Ok(record)
    }

    fn get_balance(&self, handle: &HandleId) -> Result<Option<u64>> {
        match self.balances.get(handle.as_str().as_bytes())? {
            Some(v) => {
                let bytes = <[u8; 8]>::try_from(&v[..])
                    .map_err(|_| StorageError::CorruptBalance(handle.to_string()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn put_balance(&self, handle: &HandleId, balance: u64) -> Result<()> {
        self.balances
            .insert(handle.as_str().as_bytes(), balance.to_be_bytes().to_vec())?;
        Ok(())
    }

    fn remove_balance(&self, handle: &HandleId) -> Result<()> {
        self.balances.remove(handle.as_str().as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory backend for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStorage {
    handles: Arc<RwLock<HashMap<HandleId, HandleRecord>>>,
    actors: Arc<RwLock<HashMap<ActorId, ActorRecord>>>,
    balances: Arc<RwLock<HashMap<HandleId, u64>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_handle(&self, handle: &HandleId) -> Result<Option<HandleRecord>> {
        Ok(self.handles.read().get(handle).cloned())
    }

    fn put_handle(&self, record: &HandleRecord) -> Result<()> {
        self.handles
            .write()
            .insert(record.handle_id.clone(), record.clone());
        Ok(())
    }

    fn remove_handle(&self, handle: &HandleId) -> Result<()> {
        self.handles.write().remove(handle);
        Ok(())
    }

    fn list_handles(&self) -> Result<Vec<HandleRecord>> {
        Ok(self.handles.read().values().cloned().collect())
    }

    fn get_actor(&self, actor: &ActorId) -> Result<Option<ActorRecord>> {
        Ok(self.actors.read().get(actor).cloned())
    }

    fn put_actor(&self, record: &ActorRecord) -> Result<()> {
        self.actors
            .write()
            .insert(record.actor_id.clone(), record.clone());
        Ok(())
    }

    fn remove_actor(&self, actor: &ActorId) -> Result<()> {
        self.actors.write().remove(actor);
        Ok(())
    }

    fn list_actors(&self) -> Result<Vec<ActorRecord>> {
        Ok(self.actors.read().values().cloned().collect())
    }

    fn update_actor(&self, actor: &ActorId, apply: ActorUpdate<'_>) -> Result<ActorRecord> {
        let mut actors = self.actors.write();
        let current = actors
            .get(actor)
            .ok_or_else(|| StorageError::ActorNotFound(actor.to_string()))?;
        let mut record = current.clone();
        apply(&mut record)?;
        actors.insert(actor.clone(), record.clone());
        Ok(record)
    }

    fn get_balance(&self, handle: &HandleId) -> Result<Option<u64>> {
        Ok(self.balances.read().get(handle).copied())
    }

    fn put_balance(&self, handle: &HandleId, balance: u64) -> Result<()> {
        self.balances.write().insert(handle.clone(), balance);
        Ok(())
    }

    fn remove_balance(&self, handle: &HandleId) -> Result<()> {
        self.balances.write().remove(handle);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> HandleId {
        HandleId::parse(id).unwrap()
    }

    #[test]
    fn test_update_actor_is_all_or_nothing() {
        let storage = MemoryStorage::new();
        let actor = ActorId::new("p1");
        storage.put_actor(&ActorRecord::new(actor.clone())).unwrap();

        let failed = storage.update_actor(&actor, &mut |record: &mut ActorRecord| {
            record.handles.push(handle("alice"));
            anyhow::bail!("rejected")
        });
        assert!(failed.is_err());
        assert!(storage.get_actor(&actor).unwrap().unwrap().handles.is_empty());

        let updated = storage
            .update_actor(&actor, &mut |record: &mut ActorRecord| {
                record.active = Some(handle("alice"));
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.active, Some(handle("alice")));
    }

    #[test]
    fn test_update_missing_actor_fails() {
        let storage = MemoryStorage::new();
        let result = storage.update_actor(&ActorId::new("ghost"), &mut |_| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn test_memory_balances() {
        let storage = MemoryStorage::new();
        let alice = handle("alice");
        assert_eq!(storage.get_balance(&alice).unwrap(), None);
        storage.put_balance(&alice, 42).unwrap();
        assert_eq!(storage.get_balance(&alice).unwrap(), Some(42));
        storage.remove_balance(&alice).unwrap();
        assert_eq!(storage.get_balance(&alice).unwrap(), None);
    }
}
