//! Masque mutual-exclusion coordinator
//!
//! One global named lease. Holders are identified by a random token so a
//! caller can only release the lease it acquired. Waiters sleep on a
//! [`Notify`] until the lease is released or their timeout runs out; a
//! lease older than the timeout is treated as stuck and cleared.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Configuration for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// How long `acquire` waits before giving up, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl CoordinatorConfig {
    fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 60_000,
        }
    }
}

/// Proof of holding the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    id: Uuid,
    key: String,
}

impl LeaseToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug)]
struct Lease {
    token: Uuid,
    key: String,
    acquired_at: Instant,
}

/// Global lease coordinator
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    slot: Mutex<Option<Lease>>,
    released: Notify,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
            released: Notify::new(),
        }
    }

    /// Wait for the lease and claim it under `key`.
    ///
    /// Returns `None` once the acquire timeout has elapsed. A lease that has
    /// been held for at least the timeout is cleared at that point so the
    /// next caller can proceed.
    pub async fn acquire(&self, key: &str) -> Option<LeaseToken> {
        let limit = self.config.acquire_timeout();
        let deadline = Instant::now() + limit;
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.released.notified();
            if let Some(token) = self.try_claim(key) {
                return Some(token);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || timeout(remaining, released).await.is_err() {
                self.recover_stuck(key, limit);
                return None;
            }
        }
    }

    /// Release the lease. Only the matching token releases it.
    pub fn release(&self, token: &LeaseToken) -> bool {
        let mut slot = self.slot.lock();
        if slot.as_ref().map_or(true, |lease| lease.token != token.id) {
            let holder = slot.as_ref().map(|lease| lease.key.clone());
            drop(slot);
            error!(
                integrity = true,
                key = %token.key,
                ?holder,
                "Attempt to release a lease not held by this token"
            );
            return false;
        }
        let held = slot.take().map(|lease| lease.acquired_at.elapsed());
        drop(slot);
        self.released.notify_waiters();
        debug!(key = %token.key, held_ms = ?held, "Lease released");
        true
    }

    /// Acquire and wrap the token in a guard that releases on drop.
    pub async fn lock(&self, key: &str) -> Option<LeaseGuard<'_>> {
        let token = self.acquire(key).await?;
        Some(LeaseGuard {
            coordinator: self,
            token,
        })
    }

    /// Key of the current lease, if any.
    pub fn holder(&self) -> Option<String> {
        self.slot.lock().as_ref().map(|lease| lease.key.clone())
    }

    fn try_claim(&self, key: &str) -> Option<LeaseToken> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return None;
        }
        let id = Uuid::new_v4();
        *slot = Some(Lease {
            token: id,
            key: key.to_string(),
            acquired_at: Instant::now(),
        });
        debug!(key, "Lease acquired");
        Some(LeaseToken {
            id,
            key: key.to_string(),
        })
    }

    fn recover_stuck(&self, waiter: &str, limit: Duration) {
        let mut slot = self.slot.lock();
        let stuck = slot
            .as_ref()
            .map_or(false, |lease| lease.acquired_at.elapsed() >= limit);
        if stuck {
            if let Some(lease) = slot.take() {
                warn!(
                    key = %lease.key,
                    waiter,
                    held_ms = lease.acquired_at.elapsed().as_millis() as u64,
                    "Forcibly cleared stuck lease"
                );
            }
            drop(slot);
            self.released.notify_waiters();
        } else {
            debug!(waiter, "Timed out waiting for lease");
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

/// Holds the lease until dropped.
#[derive(Debug)]
pub struct LeaseGuard<'a> {
    coordinator: &'a Coordinator,
    token: LeaseToken,
}

impl LeaseGuard<'_> {
    pub fn token(&self) -> &LeaseToken {
        &self.token
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(&self.token);
    }
}
