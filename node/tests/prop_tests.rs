//! Property tests for the task registry and pool bounds.

use proptest::prelude::*;

use mist_node::scheduler::TaskRegistry;
use mist_pool::{FluffPool, StemEntry, StemPool};
use mist_types::{BlockHash, BlockId, KernelId, Transaction, TxKernel, MAX_HEIGHT};

fn bid(height: u64) -> BlockId {
    BlockId {
        height,
        hash: BlockHash::new([height as u8; 32]),
    }
}

fn tx(tag: u8, fee: u64) -> Transaction {
    Transaction {
        inputs: vec![],
        outputs: vec![],
        kernels: vec![TxKernel {
            id: KernelId::new([tag; 32]),
            fee,
            height_min: 0,
            height_max: MAX_HEIGHT,
        }],
    }
}

#[derive(Clone, Debug)]
enum Op {
    Request { height: u64, is_body: bool },
    Assign { peer: u64 },
    CompleteFirst { peer: u64 },
    ReleaseFirst { peer: u64 },
    ReleaseAll { peer: u64 },
    Delete { height: u64, is_body: bool },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..30, any::<bool>()).prop_map(|(height, is_body)| Op::Request { height, is_body }),
        (1u64..4).prop_map(|peer| Op::Assign { peer }),
        (1u64..4).prop_map(|peer| Op::CompleteFirst { peer }),
        (1u64..4).prop_map(|peer| Op::ReleaseFirst { peer }),
        (1u64..4).prop_map(|peer| Op::ReleaseAll { peer }),
        (1u64..30, any::<bool>()).prop_map(|(height, is_body)| Op::Delete { height, is_body }),
    ]
}

proptest! {
    /// Invariants 1–2: unique keys, and every task on exactly one list,
    /// under arbitrary interleavings of the registry operations.
    #[test]
    fn task_registry_holds_invariants(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let mut reg = TaskRegistry::new();
        for op in ops {
            match op {
                Op::Request { height, is_body } => {
                    reg.request_data(bid(height), is_body, bid(30), 0, 0);
                }
                Op::Assign { peer } => {
                    if let Some(&tid) = reg.unassigned_ids().first() {
                        reg.assign(tid, peer, 0, 0, 0);
                    }
                }
                Op::CompleteFirst { peer } => {
                    reg.complete_first(peer);
                }
                Op::ReleaseFirst { peer } => {
                    reg.release_first(peer);
                }
                Op::ReleaseAll { peer } => {
                    reg.release_all(peer);
                }
                Op::Delete { height, is_body } => {
                    reg.delete_by_key(&(bid(height), is_body));
                }
            }
            prop_assert!(reg.check_invariants().is_ok(), "{:?}", reg.check_invariants());
        }
    }

    /// Invariant 4: the fluff pool never exceeds its capacity, whatever
    /// the insertion order, and the evicted entries are the cheapest.
    #[test]
    fn fluff_pool_respects_capacity(fees in proptest::collection::vec(1u64..10_000, 1..60)) {
        let cap = 16;
        let mut pool = FluffPool::new(cap);
        for (i, fee) in fees.iter().enumerate() {
            pool.insert(tx(i as u8, *fee));
            prop_assert!(pool.len() <= cap);
        }
    }

    /// Invariant 6: one embargo slot per stem entry, across inserts,
    /// merges, and removals.
    #[test]
    fn stem_pool_has_one_embargo_per_entry(
        embargoes in proptest::collection::vec(1u64..100_000, 2..30)
    ) {
        let mut pool = StemPool::new();
        for (i, at) in embargoes.iter().enumerate() {
            pool.insert(StemEntry {
                tx: tx(i as u8, 100),
                aggregating: true,
                embargo_at_ms: *at,
                confirm_deadline: 50,
                fee_reserve: 0,
            });
        }
        let keys = pool.aggregating_keys();
        for pair in keys.chunks(2) {
            if pair.len() == 2 {
                pool.merge(&pair[0], &pair[1], 100);
            }
        }
        // Draining every embargo yields each surviving entry exactly once.
        let before = pool.len();
        let drained = pool.pop_embargoed(u64::MAX);
        prop_assert_eq!(drained.len(), before);
        prop_assert!(pool.is_empty());
        prop_assert!(pool.pop_embargoed(u64::MAX).is_empty());
    }
}
