//! Result taxonomy of the transaction acceptance pipeline.

use serde::{Deserialize, Serialize};

/// What the node decided about a submitted transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxVerdict {
    /// Accepted into a pool.
    Ok,
    /// Failed structural or cryptographic validation.
    Invalid,
    /// Fee below the size-proportional minimum.
    LowFee,
    /// Transaction exceeds the weight cap.
    TooBig,
    /// Non-standard construction the node refuses to relay.
    Obscured,
    /// Shielded elements demand a larger fee reserve than provided.
    InsufficientFeeReserve,
    /// Referenced dependent context is unknown.
    DependentNotFound,
    /// A kernel is already pooled.
    Duplicate,
    /// Pool at capacity and the transaction did not displace anything.
    MempoolFull,
}

impl TxVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, TxVerdict::Ok)
    }

    /// Whether the node keeps the transaction around. `Duplicate` and
    /// `DependentNotFound` retain without propagating.
    pub fn retains_tx(&self) -> bool {
        matches!(
            self,
            TxVerdict::Ok | TxVerdict::Duplicate | TxVerdict::DependentNotFound
        )
    }

    /// Whether the transaction may be advertised onward.
    pub fn should_propagate(&self) -> bool {
        self.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ok_propagates() {
        assert!(TxVerdict::Ok.should_propagate());
        for v in [
            TxVerdict::Invalid,
            TxVerdict::LowFee,
            TxVerdict::TooBig,
            TxVerdict::Obscured,
            TxVerdict::InsufficientFeeReserve,
            TxVerdict::DependentNotFound,
            TxVerdict::Duplicate,
            TxVerdict::MempoolFull,
        ] {
            assert!(!v.should_propagate());
        }
    }

    #[test]
    fn retention_set() {
        assert!(TxVerdict::Ok.retains_tx());
        assert!(TxVerdict::Duplicate.retains_tx());
        assert!(TxVerdict::DependentNotFound.retains_tx());
        assert!(!TxVerdict::Invalid.retains_tx());
        assert!(!TxVerdict::MempoolFull.retains_tx());
    }
}
