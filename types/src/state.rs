//! Chain element identification: heights, timestamps, block ids, and the
//! system-state header the node gossips and synchronizes.

use serde::{Deserialize, Serialize};

use crate::hash::{BlockHash, ChainWork, Difficulty};

/// Block height.
pub type Height = u64;

/// Sentinel for "no height" / unbounded.
pub const MAX_HEIGHT: Height = u64::MAX;

/// Wall-clock timestamp in seconds.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn new(secs: u64) -> Self {
        Self(secs)
    }

    pub fn secs(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

/// A chain element key: `(height, hash)`.
///
/// Ordered by height first so ranges of ids iterate in chain order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockId {
    pub height: Height,
    pub hash: BlockHash,
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.height)?;
        for b in &self.hash.as_bytes()[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A block header as exchanged between peers.
///
/// `hash` is the digest of the remaining header fields; computing and
/// verifying it is the chain processor's business: the node treats it as
/// authoritative once the processor has accepted the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub height: Height,
    pub prev: BlockHash,
    pub hash: BlockHash,
    /// Merkle definition of the full system state at this height.
    pub definition: BlockHash,
    pub chain_work: ChainWork,
    pub difficulty: Difficulty,
    pub timestamp: Timestamp,
}

impl SystemState {
    pub fn id(&self) -> BlockId {
        BlockId {
            height: self.height,
            hash: self.hash,
        }
    }

    /// Whether `self` directly extends `prev` (height + link chaining).
    pub fn is_valid_successor_of(&self, prev: &SystemState) -> bool {
        self.height == prev.height + 1 && self.prev == prev.hash
    }

    /// Whether a peer at this tip can serve data for `id`.
    pub fn covers(&self, id: &BlockId) -> bool {
        self.height >= id.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(height: Height, tag: u8) -> SystemState {
        SystemState {
            height,
            prev: BlockHash::new([tag.wrapping_sub(1); 32]),
            hash: BlockHash::new([tag; 32]),
            definition: BlockHash::ZERO,
            chain_work: ChainWork(height as u128),
            difficulty: Difficulty(8),
            timestamp: Timestamp::new(1_700_000_000),
        }
    }

    #[test]
    fn successor_chains_by_height_and_link() {
        let a = state(10, 5);
        let mut b = state(11, 6);
        b.prev = a.hash;
        assert!(b.is_valid_successor_of(&a));

        b.prev = BlockHash::ZERO;
        assert!(!b.is_valid_successor_of(&a));
    }

    #[test]
    fn block_ids_order_by_height_first() {
        let lo = BlockId {
            height: 1,
            hash: BlockHash::new([0xFF; 32]),
        };
        let hi = BlockId {
            height: 2,
            hash: BlockHash::ZERO,
        };
        assert!(lo < hi);
    }

    #[test]
    fn tip_covers_lower_heights() {
        let tip = state(100, 1);
        assert!(tip.covers(&BlockId {
            height: 100,
            hash: BlockHash::ZERO
        }));
        assert!(!tip.covers(&BlockId {
            height: 101,
            hash: BlockHash::ZERO
        }));
    }
}
