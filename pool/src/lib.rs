//! Transaction pools for the mist node.
//!
//! Three coupled pools share the acceptance pipeline: the fluff pool holds
//! validated transactions that gossip freely, the stem pool holds
//! transactions traversing the Dandelion privacy relay, and the dependent
//! pool preserves chains of transactions spending uncommitted outputs. A
//! deferred queue buffers submissions until fast-sync completes.

pub mod deferred;
pub mod dependent;
pub mod dummy;
pub mod fluff;
pub mod stem;
pub mod verdict;

pub use deferred::{DeferredQueue, DeferredTx};
pub use dependent::{DependentAdd, DependentEntry, DependentPool};
pub use dummy::DummyBook;
pub use fluff::{FluffInsert, FluffPool};
pub use stem::{StemEntry, StemPool};
pub use verdict::TxVerdict;

/// Hard cap on a single transaction's weight.
pub const MAX_TX_WEIGHT: usize = 0x4000;

/// Minimum fee units demanded per unit of transaction weight.
pub const FEE_PER_WEIGHT: u64 = 10;

/// The smallest acceptable fee for a transaction of the given weight.
pub fn min_fee(weight: usize) -> u64 {
    (weight as u64).saturating_mul(FEE_PER_WEIGHT)
}
