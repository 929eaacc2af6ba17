//! Core types shared across the mist node: heights, digests, chain states,
//! the confidential-transaction model, and peer identities.

pub mod hash;
pub mod keys;
pub mod state;
pub mod transaction;

pub use hash::{BlockHash, ChainWork, CoinId, ContextHash, Difficulty, KernelId, MsgId};
pub use keys::{KeyPair, NodeId, PrivateKey, PublicKey, Signature};
pub use state::{BlockId, Height, SystemState, Timestamp, MAX_HEIGHT};
pub use transaction::{HeightRange, Transaction, TxInput, TxKernel, TxOutput};
