//! 32-byte digest newtypes, proof-of-work difficulty, and cumulative work.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! digest_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "("))?;
                for b in &self.0[..4] {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    };
}

digest_newtype!(
    /// Hash identifying a block header (system state).
    BlockHash
);
digest_newtype!(
    /// Hash identifying a transaction kernel. Doubles as the mempool key.
    KernelId
);
digest_newtype!(
    /// Rolling hash identifying a dependent-transaction context.
    ContextHash
);
digest_newtype!(
    /// Hash identifying a BBS message.
    MsgId
);
digest_newtype!(
    /// Opaque commitment identifying a transaction input/output coin.
    CoinId
);

/// Proof-of-work difficulty, expressed as the number of leading zero bits a
/// solution digest must carry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Difficulty(pub u32);

impl Difficulty {
    /// Check whether `digest` satisfies this difficulty.
    pub fn is_met(&self, digest: &[u8; 32]) -> bool {
        leading_zero_bits(digest) >= self.0
    }

    /// Work contribution of one solution at this difficulty.
    pub fn to_work(&self) -> ChainWork {
        let bits = self.0.min(127);
        ChainWork(1u128 << bits)
    }
}

fn leading_zero_bits(digest: &[u8; 32]) -> u32 {
    let mut bits = 0;
    for b in digest {
        if *b == 0 {
            bits += 8;
        } else {
            bits += b.leading_zeros();
            break;
        }
    }
    bits
}

/// Cumulative chain work. The branch of maximum `ChainWork` is the tip.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChainWork(pub u128);

impl std::ops::Add for ChainWork {
    type Output = ChainWork;

    fn add(self, rhs: ChainWork) -> ChainWork {
        ChainWork(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for ChainWork {
    fn add_assign(&mut self, rhs: ChainWork) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_display_is_full_hex() {
        let h = BlockHash::new([0xAB; 32]);
        assert_eq!(h.to_string().len(), 64);
        assert!(h.to_string().starts_with("abab"));
    }

    #[test]
    fn digest_debug_is_truncated() {
        let h = KernelId::new([0x01; 32]);
        assert_eq!(format!("{h:?}"), "KernelId(01010101)");
    }

    #[test]
    fn zero_digest() {
        assert!(BlockHash::ZERO.is_zero());
        assert!(!BlockHash::new([1; 32]).is_zero());
    }

    #[test]
    fn difficulty_counts_leading_zero_bits() {
        let mut digest = [0u8; 32];
        digest[2] = 0x10; // 16 + 3 = 19 leading zero bits
        assert!(Difficulty(19).is_met(&digest));
        assert!(!Difficulty(20).is_met(&digest));
    }

    #[test]
    fn all_zero_digest_meets_any_difficulty() {
        assert!(Difficulty(255).is_met(&[0u8; 32]));
    }

    #[test]
    fn work_doubles_per_bit() {
        assert_eq!(Difficulty(0).to_work(), ChainWork(1));
        assert_eq!(Difficulty(10).to_work(), ChainWork(1024));
    }

    #[test]
    fn chain_work_saturates() {
        let w = ChainWork(u128::MAX) + ChainWork(1);
        assert_eq!(w, ChainWork(u128::MAX));
    }
}
