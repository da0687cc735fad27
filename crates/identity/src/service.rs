//! Handle lifecycle: registration, creation, switching, burning and purging.
//!
//! Public operations take the coordinator lease for their whole duration.
//! The `*_held` helpers assume the caller already holds it.

use crate::collaborators::{
    ActorDirectory, MappedActorDirectory, NoopSessionArchiver, SessionArchiver,
};
use crate::config::IdentityConfig;
use crate::errors::*;
use masque_coordinator::{Coordinator, LeaseGuard};
use masque_handle_store::HandleStore;
use masque_ledger::{AuditSink, Ledger};
use masque_storage::{ActorRecord, Storage};
use masque_types::{ActorId, Handle, HandleId, HandleType, HandleValidity, Transaction};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a create-or-switch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// The handle now active.
    pub handle: Handle,
    /// Whether the handle was created by this request.
    pub created: bool,
}

/// Result of burning a burner handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnOutcome {
    pub burnt: HandleId,
    /// Active handle after the burn, where any rescued funds went.
    pub active: HandleId,
    pub rescued: u64,
}

/// Result of sweeping an actor's balances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOutcome {
    /// Handle the balances were swept into.
    pub active: HandleId,
    pub moved: u64,
    pub total: u64,
}

/// Identity lifecycle service
pub struct IdentityService {
    pub(crate) handles: HandleStore,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) coordinator: Coordinator,
    directory: Arc<dyn ActorDirectory>,
    archiver: Arc<dyn SessionArchiver>,
}

impl IdentityService {
    pub fn new(storage: Arc<dyn Storage>, sink: Arc<dyn AuditSink>, config: IdentityConfig) -> Self {
        let ledger = Arc::new(Ledger::new(storage.clone(), sink, config.ledger()));
        Self {
            handles: HandleStore::new(storage, ledger.clone(), config.reserved()),
            ledger,
            coordinator: Coordinator::new(config.coordinator()),
            directory: Arc::new(MappedActorDirectory::new()),
            archiver: Arc::new(NoopSessionArchiver),
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn ActorDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn SessionArchiver>) -> Self {
        self.archiver = archiver;
        self
    }

    /// Look up a handle. Absent names come back tagged `Unused`.
    pub fn handle(&self, handle_id: &HandleId) -> Result<Handle> {
        Ok(self.handles.get(handle_id)?)
    }

    pub fn list_handles(
        &self,
        actor_id: &ActorId,
        include_burnt: bool,
        include_npc: bool,
    ) -> Result<Vec<Handle>> {
        Ok(self.handles.list_for_actor(actor_id, include_burnt, include_npc)?)
    }

    pub fn active_handle(&self, actor_id: &ActorId) -> Result<Option<Handle>> {
        Ok(self.handles.active_handle(actor_id)?)
    }

    pub fn last_regular(&self, actor_id: &ActorId) -> Result<Option<Handle>> {
        Ok(self.handles.last_regular(actor_id)?)
    }

    pub fn actor_record(&self, actor_id: &ActorId) -> Result<Option<ActorRecord>> {
        Ok(self.handles.actor(actor_id)?)
    }

    pub fn actors(&self) -> Result<Vec<ActorRecord>> {
        Ok(self.handles.actors()?)
    }

    pub fn balance(&self, handle_id: &HandleId) -> Result<u64> {
        Ok(self.ledger.balance(handle_id)?)
    }

    pub(crate) async fn lease(&self, key: String) -> Result<LeaseGuard<'_>> {
        let guard = self.coordinator.lock(&key).await;
        guard.ok_or(IdentityError::LockTimeout { key })
    }

    /// Resolve the actor behind an external chat user.
    pub async fn actor_for_user(&self, external_user_id: &str) -> Result<ActorId> {
        self.directory
            .actor_id_for_external_user(external_user_id)
            .await
            .ok_or_else(|| IdentityError::UnknownUser {
                user: external_user_id.to_string(),
            })
    }

    /// Give a new actor its base handle. Reserved names are allowed here.
    pub async fn register_actor(&self, actor_id: &ActorId, base_handle: &HandleId) -> Result<Handle> {
        let _lease = self.lease(format!("registering_{base_handle}")).await?;

        let registered = self
            .handles
            .actor(actor_id)?
            .map_or(false, |record| !record.handles.is_empty());
        if registered {
            return Err(IdentityError::AlreadyRegistered {
                actor: actor_id.to_string(),
            });
        }
        let existing = self.handles.get(base_handle)?;
        if existing.handle_type == HandleType::Burnt {
            return Err(IdentityError::Unavailable {
                handle: base_handle.to_string(),
            });
        }
        if existing.exists() {
            return Err(IdentityError::OwnedByOther {
                handle: base_handle.to_string(),
            });
        }

        let mut handle = self
            .handles
            .create(actor_id, base_handle, HandleType::Regular, true)?;
        if handle.handle_type == HandleType::Invalid {
            return Err(IdentityError::InvalidHandle {
                handle: base_handle.to_string(),
            });
        }
        self.handles.switch_active(&handle)?;
        handle.is_active = true;
        info!(actor = %actor_id, handle = %base_handle, "Actor registered");
        Ok(handle)
    }

    /// Switch to `handle_id`, creating it with `handle_type` when unused.
    pub async fn create_and_switch(
        &self,
        actor_id: &ActorId,
        handle_id: &HandleId,
        handle_type: HandleType,
    ) -> Result<Outcome> {
        let _lease = self.lease(format!("switching_to_{handle_id}")).await?;
        self.ensure_registered(actor_id)?;

        let existing = self.handles.get(handle_id)?;
        if existing.handle_type != HandleType::Unused {
            return self.switch_held(actor_id, existing, handle_type);
        }

        match self.handles.validate(handle_id.as_str()) {
            HandleValidity::Allowed => {}
            HandleValidity::Invalid => {
                return Err(IdentityError::InvalidHandle {
                    handle: handle_id.to_string(),
                })
            }
            HandleValidity::Reserved => {
                return Err(IdentityError::ReservedHandle {
                    handle: handle_id.to_string(),
                })
            }
        }
        let mut handle = self.handles.create(actor_id, handle_id, handle_type, false)?;
        self.handles.switch_active(&handle)?;
        handle.is_active = true;
        Ok(Outcome {
            handle,
            created: true,
        })
    }

    /// Switch to an existing handle the actor owns.
    ///
    /// `expected_type` is the kind of handle the caller asked for: regular
    /// handles only answer to a regular request, NPC handles to an NPC
    /// request, and burners to either a burner or a regular request.
    pub async fn switch(
        &self,
        actor_id: &ActorId,
        handle_id: &HandleId,
        expected_type: HandleType,
    ) -> Result<Outcome> {
        let _lease = self.lease(format!("switching_to_{handle_id}")).await?;
        self.ensure_registered(actor_id)?;
        let handle = self.handles.get(handle_id)?;
        self.switch_held(actor_id, handle, expected_type)
    }

    fn switch_held(
        &self,
        actor_id: &ActorId,
        mut handle: Handle,
        expected_type: HandleType,
    ) -> Result<Outcome> {
        let name = handle.handle_id.to_string();
        match handle.handle_type {
            HandleType::Burnt => return Err(IdentityError::Unavailable { handle: name }),
            HandleType::Unused | HandleType::Invalid | HandleType::Reserved => {
                return Err(IdentityError::UnknownHandle { handle: name })
            }
            _ => {}
        }
        if !handle.is_owned_by(actor_id) {
            return Err(IdentityError::OwnedByOther { handle: name });
        }
        let allowed = match handle.handle_type {
            HandleType::Regular => expected_type == HandleType::Regular,
            HandleType::Npc => expected_type == HandleType::Npc,
            HandleType::Burner => {
                matches!(expected_type, HandleType::Burner | HandleType::Regular)
            }
            _ => false,
        };
        if !allowed {
            return Err(IdentityError::WrongType {
                handle: name,
                actual: handle.handle_type,
                expected: expected_type,
            });
        }
        if !handle.is_active {
            self.handles.switch_active(&handle)?;
            handle.is_active = true;
        }
        Ok(Outcome {
            handle,
            created: false,
        })
    }

    /// Destroy one of the actor's burners.
    ///
    /// If the burner is active the actor falls back to its last regular
    /// handle first. Remaining funds move to the new active handle before
    /// the burner is marked burnt; the burnt name stays claimed forever.
    pub async fn burn(&self, actor_id: &ActorId, handle_id: &HandleId) -> Result<BurnOutcome> {
        let _lease = self.lease(format!("burning_{handle_id}")).await?;

        let burner = self.handles.get(handle_id)?;
        let name = handle_id.to_string();
        if !burner.exists() {
            return Err(IdentityError::UnknownHandle { handle: name });
        }
        if !burner.is_owned_by(actor_id) {
            return Err(IdentityError::NoAccess { handle: name });
        }
        match burner.handle_type {
            HandleType::Burner => {}
            HandleType::Burnt => return Err(IdentityError::Unavailable { handle: name }),
            _ => return Err(IdentityError::NotABurner { handle: name }),
        }

        let fallback = if burner.is_active {
            let fallback = self.handles.last_regular(actor_id)?.ok_or_else(|| {
                IdentityError::Integrity(format!("{actor_id} has no regular handle to fall back to"))
            })?;
            Some(fallback)
        } else {
            None
        };
        let active = match &fallback {
            Some(fallback) => fallback.handle_id.clone(),
            None => self
                .handles
                .active_handle(actor_id)?
                .ok_or_else(|| IdentityError::Integrity(format!("{actor_id} has no active handle")))?
                .handle_id,
        };

        // Best effort: once the rescue has moved, a failed audit post leaves
        // the burner active and unburnt with a zero balance; burning it again
        // completes the operation.
        let rescued = self.ledger.balance(handle_id)?;
        if rescued > 0 {
            if !self.ledger.transfer(handle_id, &active, rescued)? {
                return Err(IdentityError::Integrity(format!(
                    "rescue of {rescued} from {handle_id} did not go through"
                )));
            }
            let rescue = Transaction::settled(handle_id.clone(), active.clone(), rescued)
                .with_last_in_sequence(false);
            self.ledger.audit().record(&rescue).await?;
        }
        if let Some(fallback) = &fallback {
            self.handles.switch_active(fallback)?;
        }
        self.handles.mark_burnt(&burner)?;
        self.ledger.audit().refresh_statement(actor_id).await?;

        if let Err(err) = self.archiver.archive_sessions_for_handle(handle_id).await {
            warn!(handle = %handle_id, "Failed to archive sessions of burnt handle: {}", err);
        }

        info!(actor = %actor_id, handle = %handle_id, %active, rescued, "Burner destroyed");
        Ok(BurnOutcome {
            burnt: handle_id.clone(),
            active,
            rescued,
        })
    }

    /// Remove a handle and its ledger entry outright. No funds are rescued
    /// and nothing is posted to the audit channel.
    pub async fn purge(&self, handle_id: &HandleId) -> Result<()> {
        let _lease = self.lease(format!("purging_{handle_id}")).await?;

        let handle = self.handles.get(handle_id)?;
        let Some(actor_id) = handle.actor_id.clone() else {
            return Err(IdentityError::UnknownHandle {
                handle: handle_id.to_string(),
            });
        };

        let other_regular = self
            .handles
            .list_for_actor(&actor_id, false, false)?
            .into_iter()
            .filter(|h| h.handle_type == HandleType::Regular && &h.handle_id != handle_id)
            .map(|h| h.handle_id)
            .collect::<Vec<_>>();
        if handle.handle_type == HandleType::Regular && other_regular.is_empty() {
            return Err(IdentityError::WouldOrphan {
                handle: handle_id.to_string(),
                missing: "a regular handle".to_string(),
            });
        }

        if handle.is_active {
            let last_regular = self
                .handles
                .last_regular(&actor_id)?
                .map(|h| h.handle_id)
                .filter(|id| id != handle_id && other_regular.contains(id));
            let Some(fallback) = last_regular.or_else(|| other_regular.first().cloned()) else {
                return Err(IdentityError::WouldOrphan {
                    handle: handle_id.to_string(),
                    missing: "an active handle".to_string(),
                });
            };
            let fallback = self.handles.get(&fallback)?;
            self.handles.switch_active(&fallback)?;
        }

        self.handles.purge(&handle)?;
        let pointer_lost = self
            .handles
            .actor(&actor_id)?
            .map_or(false, |record| record.last_regular.is_none());
        if pointer_lost {
            self.handles.reassign_last_regular(&actor_id, handle_id)?;
        }
        self.ledger.deinit(handle_id, false).await?;

        info!(actor = %actor_id, handle = %handle_id, "Handle removed");
        Ok(())
    }

    /// Sweep every balance of the actor into its active handle.
    pub async fn collect_all(&self, actor_id: &ActorId) -> Result<CollectOutcome> {
        let _lease = self.lease(format!("collecting_{actor_id}")).await?;
        let active = self
            .handles
            .active_handle(actor_id)?
            .ok_or_else(|| IdentityError::UnknownActor {
                actor: actor_id.to_string(),
            })?;
        let before = self.ledger.balance(&active.handle_id)?;
        let total = self.ledger.collect_all(actor_id).await?;
        Ok(CollectOutcome {
            active: active.handle_id,
            moved: total.saturating_sub(before),
            total,
        })
    }

    /// Administrative balance override.
    pub async fn adjust_balance(&self, handle_id: &HandleId, new_balance: u64) -> Result<()> {
        let _lease = self.lease(format!("adjusting_{handle_id}")).await?;
        self.ensure_live(handle_id)?;
        self.ledger.adjust(handle_id, new_balance).await?;
        Ok(())
    }

    /// Administrative credit. Returns the new balance.
    pub async fn add_funds(&self, handle_id: &HandleId, amount: u64) -> Result<u64> {
        let _lease = self.lease(format!("adjusting_{handle_id}")).await?;
        self.ensure_live(handle_id)?;
        Ok(self.ledger.add_funds(handle_id, amount).await?)
    }

    /// Drop every actor, handle and ledger entry.
    pub async fn clear_all(&self) -> Result<()> {
        let _lease = self.lease("clearing_all_handles".to_string()).await?;
        let removed = self.handles.clear_all()?;
        for handle_id in &removed {
            self.ledger.deinit(handle_id, false).await?;
        }
        warn!(handles = removed.len(), "All handles cleared");
        Ok(())
    }

    fn ensure_registered(&self, actor_id: &ActorId) -> Result<()> {
        match self.handles.active_handle(actor_id)? {
            Some(_) => Ok(()),
            None => Err(IdentityError::UnknownActor {
                actor: actor_id.to_string(),
            }),
        }
    }

    fn ensure_live(&self, handle_id: &HandleId) -> Result<()> {
        let handle = self.handles.get(handle_id)?;
        match handle.handle_type {
            t if t.is_live() => Ok(()),
            HandleType::Burnt => Err(IdentityError::Unavailable {
                handle: handle_id.to_string(),
            }),
            _ => Err(IdentityError::UnknownHandle {
                handle: handle_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RecordingSessionArchiver;
    use masque_ledger::MemoryAuditSink;
    use masque_storage::MemoryStorage;

    fn h(id: &str) -> HandleId {
        HandleId::parse(id).unwrap()
    }

    struct Fixture {
        service: IdentityService,
        sink: Arc<MemoryAuditSink>,
        archiver: Arc<RecordingSessionArchiver>,
    }

    async fn fixture() -> Fixture {
        let sink = Arc::new(MemoryAuditSink::new());
        let archiver = Arc::new(RecordingSessionArchiver::new());
        let service = IdentityService::new(
            Arc::new(MemoryStorage::new()),
            sink.clone(),
            IdentityConfig::default(),
        )
        .with_archiver(archiver.clone());
        service
            .register_actor(&ActorId::new("p1"), &h("alice"))
            .await
            .unwrap();
        Fixture {
            service,
            sink,
            archiver,
        }
    }

    #[tokio::test]
    async fn test_register_claims_reserved_base_handle() {
        let f = fixture().await;
        let gm = ActorId::new("gm");
        let handle = f.service.register_actor(&gm, &h("admin")).await.unwrap();
        assert!(handle.is_active);
        assert!(matches!(
            f.service.register_actor(&gm, &h("other")).await,
            Err(IdentityError::AlreadyRegistered { .. })
        ));
        assert!(matches!(
            f.service.register_actor(&ActorId::new("p2"), &h("alice")).await,
            Err(IdentityError::OwnedByOther { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_reserved_and_invalid() {
        let f = fixture().await;
        let p1 = ActorId::new("p1");
        assert!(matches!(
            f.service.create_and_switch(&p1, &h("balance"), HandleType::Regular).await,
            Err(IdentityError::ReservedHandle { .. })
        ));
        assert!(matches!(
            f.service.create_and_switch(&p1, &h("_x"), HandleType::Regular).await,
            Err(IdentityError::InvalidHandle { .. })
        ));
        assert!(matches!(
            f.service.create_and_switch(&ActorId::new("ghost"), &h("boo"), HandleType::Regular).await,
            Err(IdentityError::UnknownActor { .. })
        ));
    }

    #[tokio::test]
    async fn test_switch_type_rules() {
        let f = fixture().await;
        let p1 = ActorId::new("p1");
        f.service
            .create_and_switch(&p1, &h("mask"), HandleType::Burner)
            .await
            .unwrap();
        f.service
            .create_and_switch(&p1, &h("puppet"), HandleType::Npc)
            .await
            .unwrap();

        // Burners answer to both regular and burner requests.
        let outcome = f.service.switch(&p1, &h("mask"), HandleType::Regular).await.unwrap();
        assert!(!outcome.created);
        assert!(outcome.handle.is_active);

        assert!(matches!(
            f.service.switch(&p1, &h("alice"), HandleType::Burner).await,
            Err(IdentityError::WrongType { .. })
        ));
        assert!(matches!(
            f.service.switch(&p1, &h("puppet"), HandleType::Regular).await,
            Err(IdentityError::WrongType { .. })
        ));
        f.service.switch(&p1, &h("puppet"), HandleType::Npc).await.unwrap();
        assert_eq!(
            f.service.active_handle(&p1).unwrap().unwrap().handle_id,
            h("puppet")
        );
    }

    #[tokio::test]
    async fn test_burn_active_burner_falls_back_and_rescues() {
        let f = fixture().await;
        let p1 = ActorId::new("p1");
        f.service
            .create_and_switch(&p1, &h("mask"), HandleType::Burner)
            .await
            .unwrap();
        f.service.add_funds(&h("mask"), 50).await.unwrap();

        let outcome = f.service.burn(&p1, &h("mask")).await.unwrap();
        assert_eq!(outcome.active, h("alice"));
        assert_eq!(outcome.rescued, 50);
        assert_eq!(f.service.balance(&h("alice")).unwrap(), 50);
        assert_eq!(f.service.balance(&h("mask")).unwrap(), 0);
        assert_eq!(
            f.service.handle(&h("mask")).unwrap().handle_type,
            HandleType::Burnt
        );
        assert_eq!(f.archiver.archived(), vec![h("mask")]);
        assert!(f
            .sink
            .records_for(&p1)
            .contains(&"🔁 **mask** --> **alice**: ¥ 50".to_string()));

        assert!(matches!(
            f.service.burn(&p1, &h("mask")).await,
            Err(IdentityError::Unavailable { .. })
        ));
        assert!(matches!(
            f.service.create_and_switch(&p1, &h("mask"), HandleType::Burner).await,
            Err(IdentityError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_burn_with_failed_audit_leaves_burner_active() {
        let f = fixture().await;
        let p1 = ActorId::new("p1");
        f.service
            .create_and_switch(&p1, &h("mask"), HandleType::Burner)
            .await
            .unwrap();
        f.service.add_funds(&h("mask"), 40).await.unwrap();

        // One initial attempt plus the default three retries.
        f.sink.fail_next(4);
        assert!(matches!(
            f.service.burn(&p1, &h("mask")).await,
            Err(IdentityError::Ledger(_))
        ));
        let mask = f.service.handle(&h("mask")).unwrap();
        assert_eq!(mask.handle_type, HandleType::Burner);
        assert!(mask.is_active);
        assert_eq!(f.service.balance(&h("alice")).unwrap(), 40);

        let outcome = f.service.burn(&p1, &h("mask")).await.unwrap();
        assert_eq!(outcome.rescued, 0);
        assert_eq!(outcome.active, h("alice"));
        assert_eq!(
            f.service.handle(&h("mask")).unwrap().handle_type,
            HandleType::Burnt
        );
    }

    #[tokio::test]
    async fn test_burn_empty_burner_posts_no_rescue() {
        let f = fixture().await;
        let p1 = ActorId::new("p1");
        f.service
            .create_and_switch(&p1, &h("mask"), HandleType::Burner)
            .await
            .unwrap();
        f.service.switch(&p1, &h("alice"), HandleType::Regular).await.unwrap();

        let outcome = f.service.burn(&p1, &h("mask")).await.unwrap();
        assert_eq!(outcome.rescued, 0);
        assert!(f.sink.records_for(&p1).is_empty());
        assert!(f.sink.statement_for(&p1).is_some());
    }

    #[tokio::test]
    async fn test_burn_checks_owner_and_type() {
        let f = fixture().await;
        let p1 = ActorId::new("p1");
        let p2 = ActorId::new("p2");
        f.service.register_actor(&p2, &h("bob")).await.unwrap();
        f.service
            .create_and_switch(&p2, &h("shade"), HandleType::Burner)
            .await
            .unwrap();

        assert!(matches!(
            f.service.burn(&p1, &h("shade")).await,
            Err(IdentityError::NoAccess { .. })
        ));
        assert!(matches!(
            f.service.burn(&p1, &h("alice")).await,
            Err(IdentityError::NotABurner { .. })
        ));
        assert!(matches!(
            f.service.burn(&p1, &h("nothing")).await,
            Err(IdentityError::UnknownHandle { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_keeps_actor_consistent() {
        let f = fixture().await;
        let p1 = ActorId::new("p1");
        assert!(matches!(
            f.service.purge(&h("alice")).await,
            Err(IdentityError::WouldOrphan { .. })
        ));

        f.service
            .create_and_switch(&p1, &h("second"), HandleType::Regular)
            .await
            .unwrap();
        f.service.add_funds(&h("second"), 10).await.unwrap();
        f.service.purge(&h("second")).await.unwrap();

        let record = f.service.actor_record(&p1).unwrap().unwrap();
        assert_eq!(record.handles, vec![h("alice")]);
        assert_eq!(record.active, Some(h("alice")));
        assert_eq!(record.last_regular, Some(h("alice")));
        assert!(f.service.balance(&h("second")).is_err());
        assert_eq!(
            f.service.handle(&h("second")).unwrap().handle_type,
            HandleType::Unused
        );
    }

    #[tokio::test]
    async fn test_collect_all_reports_moved_amount() {
        let f = fixture().await;
        let p1 = ActorId::new("p1");
        f.service
            .create_and_switch(&p1, &h("mask"), HandleType::Burner)
            .await
            .unwrap();
        f.service.add_funds(&h("mask"), 20).await.unwrap();
        f.service.add_funds(&h("alice"), 5).await.unwrap();

        let outcome = f.service.collect_all(&p1).await.unwrap();
        assert_eq!(outcome.active, h("mask"));
        assert_eq!((outcome.moved, outcome.total), (5, 25));
        assert_eq!(f.service.balance(&h("mask")).unwrap(), 25);
        assert_eq!(f.service.balance(&h("alice")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lock_timeout_is_reported() {
        let sink = Arc::new(MemoryAuditSink::new());
        let config = IdentityConfig {
            lock_timeout_ms: 20,
            ..IdentityConfig::default()
        };
        let service = IdentityService::new(Arc::new(MemoryStorage::new()), sink, config);
        let _held = service.coordinator.lock("held_elsewhere").await.unwrap();
        let err = service
            .register_actor(&ActorId::new("p1"), &h("alice"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }
}
