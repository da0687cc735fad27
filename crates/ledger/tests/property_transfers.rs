use masque_ledger::{Ledger, LedgerConfig, MemoryAuditSink};
use masque_storage::{MemoryStorage, Storage};
use masque_types::HandleId;
use proptest::prelude::*;
use std::sync::Arc;

const HANDLES: [&str; 4] = ["alice", "bob", "carol", "dave"];

fn handle(index: usize) -> HandleId {
    HandleId::parse(HANDLES[index]).unwrap()
}

fn transfer_strategy() -> impl Strategy<Value = (usize, usize, u64)> {
    (0..HANDLES.len(), 0..HANDLES.len(), 0u64..500)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn transfers_conserve_total_balance(
        opening in prop::collection::vec(0u64..1_000, HANDLES.len()),
        transfers in prop::collection::vec(transfer_strategy(), 1..40),
    ) {
        let storage = Arc::new(MemoryStorage::new());
        for (index, balance) in opening.iter().enumerate() {
            storage.put_balance(&handle(index), *balance).unwrap();
        }
        let ledger = Ledger::new(storage.clone(), Arc::new(MemoryAuditSink::new()), LedgerConfig::default());
        let expected: u64 = opening.iter().sum();

        for (from, to, amount) in transfers {
            if from == to {
                prop_assert!(ledger.transfer(&handle(from), &handle(to), amount).is_err());
                continue;
            }
            let before = ledger.balance(&handle(from)).unwrap();
            let moved = ledger.transfer(&handle(from), &handle(to), amount).unwrap();
            prop_assert_eq!(moved, amount <= before);

            let total: u64 = (0..HANDLES.len())
                .map(|index| ledger.balance(&handle(index)).unwrap())
                .sum();
            prop_assert_eq!(total, expected);
        }
    }
}
