//! Audit sink that writes records to the log instead of a chat channel.

use async_trait::async_trait;
use masque_ledger::{AuditError, AuditSink};
use masque_types::{ActorId, MessageHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

pub struct TracingAuditSink {
    next_id: AtomicU64,
}

impl TracingAuditSink {
    pub fn new() -> Self {
        // Ids keep increasing across runs so stored statement handles stay unique.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64 * 1_000)
            .unwrap_or(0);
        Self {
            next_id: AtomicU64::new(seed),
        }
    }
}

impl Default for TracingAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn post_record(&self, actor_id: &ActorId, text: &str) -> Result<MessageHandle, AuditError> {
        let message = MessageHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        info!(target: "masque::audit", actor = %actor_id, %message, "{}", text);
        Ok(message)
    }

    async fn delete_message(&self, actor_id: &ActorId, message: MessageHandle) -> Result<(), AuditError> {
        info!(target: "masque::audit", actor = %actor_id, %message, "Statement superseded");
        Ok(())
    }
}
