use masque_identity::{IdentityConfig, IdentityService};
use masque_ledger::MemoryAuditSink;
use masque_storage::{SledStorage, Storage};
use masque_types::{ActorId, HandleId, HandleType};
use std::sync::Arc;
use tempfile::TempDir;

fn h(id: &str) -> HandleId {
    HandleId::parse(id).unwrap()
}

fn open(dir: &TempDir) -> (Arc<SledStorage>, IdentityService) {
    let storage = Arc::new(SledStorage::new(dir.path()).unwrap());
    let service = IdentityService::new(
        storage.clone(),
        Arc::new(MemoryAuditSink::new()),
        IdentityConfig::default(),
    );
    (storage, service)
}

#[tokio::test]
async fn identity_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let alice = ActorId::new("alice");
    {
        let (storage, service) = open(&dir);
        service.register_actor(&alice, &h("alice_base")).await.unwrap();
        service
            .create_and_switch(&alice, &h("mask"), HandleType::Burner)
            .await
            .unwrap();
        service.add_funds(&h("mask"), 25).await.unwrap();
        service.burn(&alice, &h("mask")).await.unwrap();
        storage.flush().unwrap();
    }

    let (_, service) = open(&dir);
    let active = service.active_handle(&alice).unwrap().unwrap();
    assert_eq!(active.handle_id, h("alice_base"));
    assert_eq!(service.balance(&h("alice_base")).unwrap(), 25);
    assert_eq!(
        service.handle(&h("mask")).unwrap().handle_type,
        HandleType::Burnt
    );
}
