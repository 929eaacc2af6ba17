//! The chain layer of the mist node.
//!
//! Header/body cryptographic verification, Merkle proofs, and persistence
//! belong to the [`ChainProcessor`] collaborator. This crate defines that
//! interface, the controller that bridges peer events onto it (debounced
//! flushes, coalesced go-up scheduling, the rollback ceiling, the insane-peer
//! queue, the fast-sync gate), and the weighted sync-progress metric.

pub mod controller;
pub mod error;
pub mod processor;
pub mod sync;
pub mod testing;

pub use controller::{ChainController, ControllerConfig};
pub use error::ChainError;
pub use processor::{ChainProcessor, DataRequest, DataStatus, ProcessorEvent, ProofQuery};
pub use sync::SyncProgress;
