//! Audit-channel delivery: per-transaction records and the standing statement.

use crate::errors::*;
use crate::router::{self, Posting};
use crate::statement;
use async_trait::async_trait;
use futures::future::join_all;
use masque_storage::{ActorRecord, Storage};
use masque_types::{ActorId, MessageHandle, Party, Transaction};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Delivery of records to each actor's audit channel.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn post_record(
        &self,
        actor_id: &ActorId,
        text: &str,
    ) -> std::result::Result<MessageHandle, AuditError>;

    async fn delete_message(
        &self,
        actor_id: &ActorId,
        message: MessageHandle,
    ) -> std::result::Result<(), AuditError>;
}

/// A message held by [`MemoryAuditSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditMessage {
    pub actor_id: ActorId,
    pub message: MessageHandle,
    pub text: String,
}

/// In-memory audit channels.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    messages: RwLock<Vec<AuditMessage>>,
    next_id: AtomicU64,
    failures_left: AtomicU32,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` deliveries fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Live messages of one actor, oldest first.
    pub fn messages_for(&self, actor_id: &ActorId) -> Vec<AuditMessage> {
        self.messages
            .read()
            .iter()
            .filter(|m| &m.actor_id == actor_id)
            .cloned()
            .collect()
    }

    /// Transaction records of one actor, statements excluded.
    pub fn records_for(&self, actor_id: &ActorId) -> Vec<String> {
        self.messages_for(actor_id)
            .into_iter()
            .filter(|m| !m.text.starts_with(statement::STATEMENT_RULE))
            .map(|m| m.text)
            .collect()
    }

    /// The single live statement of an actor, if any.
    pub fn statement_for(&self, actor_id: &ActorId) -> Option<AuditMessage> {
        self.messages_for(actor_id)
            .into_iter()
            .rev()
            .find(|m| m.text.starts_with(statement::STATEMENT_RULE))
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn post_record(
        &self,
        actor_id: &ActorId,
        text: &str,
    ) -> std::result::Result<MessageHandle, AuditError> {
        if self.take_failure() {
            return Err(AuditError::Backend("injected delivery failure".into()));
        }
        let message = MessageHandle(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.messages.write().push(AuditMessage {
            actor_id: actor_id.clone(),
            message,
            text: text.to_string(),
        });
        Ok(message)
    }

    async fn delete_message(
        &self,
        actor_id: &ActorId,
        message: MessageHandle,
    ) -> std::result::Result<(), AuditError> {
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|m| !(m.message == message && &m.actor_id == actor_id));
        if messages.len() == before {
            return Err(AuditError::Backend(format!("{message} not found")));
        }
        Ok(())
    }
}

/// Routes transactions to audit channels and keeps statements current.
pub struct AuditTrail {
    storage: Arc<dyn Storage>,
    sink: Arc<dyn AuditSink>,
    retries: u32,
}

impl AuditTrail {
    pub fn new(storage: Arc<dyn Storage>, sink: Arc<dyn AuditSink>, retries: u32) -> Self {
        Self {
            storage,
            sink,
            retries,
        }
    }

    /// Owner of a party, if it is a handle somebody holds.
    pub fn owner_of(&self, party: &Party) -> Result<Option<ActorId>> {
        match party {
            Party::Handle(handle) => Ok(self.storage.get_handle(handle)?.map(|r| r.actor_id)),
            _ => Ok(None),
        }
    }

    /// Post the records of a successful transaction and, at the end of a
    /// batch, refresh the statement of every actor that received one.
    pub async fn record(&self, tx: &Transaction) -> Result<Vec<Posting>> {
        if !tx.success {
            return Ok(Vec::new());
        }
        let payer_owner = self.owner_of(&tx.payer)?;
        let recipient_owner = self.owner_of(&tx.recipient)?;
        let postings = router::classify(tx, payer_owner.as_ref(), recipient_owner.as_ref());
        if postings.is_empty() {
            warn!(payer = %tx.payer, recipient = %tx.recipient, "Transaction resolves to no actor; nothing posted");
            return Ok(postings);
        }

        let deliveries = postings
            .iter()
            .map(|posting| self.post_with_retry(&posting.actor_id, &posting.text));
        for outcome in join_all(deliveries).await {
            outcome?;
        }

        if tx.last_in_sequence {
            let mut refreshed: Vec<&ActorId> = Vec::new();
            for posting in &postings {
                if !refreshed.contains(&&posting.actor_id) {
                    self.refresh_statement(&posting.actor_id).await?;
                    refreshed.push(&posting.actor_id);
                }
            }
        }
        Ok(postings)
    }

    /// Replace the actor's statement message with a fresh one.
    pub async fn refresh_statement(&self, actor_id: &ActorId) -> Result<MessageHandle> {
        let record = self
            .storage
            .get_actor(actor_id)?
            .ok_or_else(|| LedgerError::ActorNotFound {
                actor: actor_id.to_string(),
            })?;
        if let Some(previous) = record.statement {
            if let Err(err) = self.sink.delete_message(actor_id, previous).await {
                warn!(actor = %actor_id, %previous, "Could not delete previous statement: {}", err);
            }
        }

        let text = statement::statement_text(self.storage.as_ref(), actor_id)?;
        let message = self.post_with_retry(actor_id, &text).await?;
        self.storage
            .update_actor(actor_id, &mut |record: &mut ActorRecord| {
                record.statement = Some(message);
                Ok(())
            })?;
        debug!(actor = %actor_id, %message, "Statement refreshed");
        Ok(message)
    }

    async fn post_with_retry(&self, actor_id: &ActorId, text: &str) -> Result<MessageHandle> {
        let mut attempt = 0;
        loop {
            match self.sink.post_record(actor_id, text).await {
                Ok(message) => return Ok(message),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    warn!(actor = %actor_id, attempt, "Audit delivery failed, retrying: {}", err);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
