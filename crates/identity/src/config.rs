use masque_coordinator::CoordinatorConfig;
use masque_ledger::LedgerConfig;
use masque_types::ReservedHandles;
use serde::{Deserialize, Serialize};

/// Configuration for the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Words reserved on top of the built-in set.
    pub reserved_handles: Vec<String>,
    /// Maximum wait for the coordinator lease, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Extra delivery attempts for each audit record.
    pub audit_post_retries: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            reserved_handles: Vec::new(),
            lock_timeout_ms: CoordinatorConfig::default().acquire_timeout_ms,
            audit_post_retries: LedgerConfig::default().audit_post_retries,
        }
    }
}

impl IdentityConfig {
    pub fn reserved(&self) -> ReservedHandles {
        let mut reserved = ReservedHandles::default();
        reserved.extend(&self.reserved_handles);
        reserved
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            acquire_timeout_ms: self.lock_timeout_ms,
        }
    }

    pub fn ledger(&self) -> LedgerConfig {
        LedgerConfig {
            audit_post_retries: self.audit_post_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_extension_keeps_defaults() {
        let config = IdentityConfig {
            reserved_handles: vec!["GM".to_string(), "eclipse".to_string()],
            ..IdentityConfig::default()
        };
        let reserved = config.reserved();
        assert!(reserved.contains("gm"));
        assert!(reserved.contains("eclipse"));
        assert!(reserved.contains("admin"));
        assert_eq!(config.coordinator().acquire_timeout_ms, 60_000);
    }
}
