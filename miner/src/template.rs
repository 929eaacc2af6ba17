//! Block template and the proof-of-work predicate.

use mist_crypto::blake2b_256_multi;
use mist_types::{BlockHash, Difficulty, Height};

/// What a solver works on: the header digest of an assembled block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockTemplate {
    pub height: Height,
    pub prev: BlockHash,
    /// Total fees collectable by this block.
    pub fees: u64,
    /// Digest of the assembled block contents the nonce is ground against.
    pub input: [u8; 32],
    pub difficulty: Difficulty,
}

/// The PoW digest for a candidate nonce.
pub fn pow_digest(input: &[u8; 32], nonce: u64) -> [u8; 32] {
    blake2b_256_multi(&[input, &nonce.to_le_bytes()])
}

impl BlockTemplate {
    /// Whether `nonce` solves this template.
    pub fn is_solution(&self, nonce: u64) -> bool {
        self.difficulty.is_met(&pow_digest(&self.input, nonce))
    }
}
