//! Collaborators reached through traits: the mapping from chat users to
//! actors and the archiving of chat sessions tied to a destroyed handle.

use async_trait::async_trait;
use masque_types::{ActorId, HandleId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Maps an external chat user to the actor they play.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    async fn actor_id_for_external_user(&self, external_user_id: &str) -> Option<ActorId>;
}

/// Directory backed by an in-memory map.
#[derive(Debug, Default)]
pub struct MappedActorDirectory {
    entries: RwLock<HashMap<String, ActorId>>,
}

impl MappedActorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, U, A>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, A)>,
        U: Into<String>,
        A: Into<String>,
    {
        let directory = Self::new();
        for (user, actor) in pairs {
            directory.insert(user, ActorId::new(actor));
        }
        directory
    }

    pub fn insert(&self, external_user_id: impl Into<String>, actor_id: ActorId) {
        self.entries.write().insert(external_user_id.into(), actor_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl ActorDirectory for MappedActorDirectory {
    async fn actor_id_for_external_user(&self, external_user_id: &str) -> Option<ActorId> {
        self.entries.read().get(external_user_id).cloned()
    }
}

/// Archives the chat sessions a handle took part in.
#[async_trait]
pub trait SessionArchiver: Send + Sync {
    async fn archive_sessions_for_handle(&self, handle_id: &HandleId) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSessionArchiver;

#[async_trait]
impl SessionArchiver for NoopSessionArchiver {
    async fn archive_sessions_for_handle(&self, _handle_id: &HandleId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Remembers every archived handle.
#[derive(Debug, Default)]
pub struct RecordingSessionArchiver {
    archived: Mutex<Vec<HandleId>>,
}

impl RecordingSessionArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived(&self) -> Vec<HandleId> {
        self.archived.lock().clone()
    }
}

#[async_trait]
impl SessionArchiver for RecordingSessionArchiver {
    async fn archive_sessions_for_handle(&self, handle_id: &HandleId) -> anyhow::Result<()> {
        self.archived.lock().push(handle_id.clone());
        Ok(())
    }
}
