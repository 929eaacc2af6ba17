//! Peer-facing bookkeeping for the mist node: the persistent address book
//! with ratings and bans, the generic wanted-set used for "I want X, ask
//! peers" tracking, and per-peer send backpressure accounting.

pub mod backpressure;
pub mod error;
pub mod peer_manager;
pub mod wanted;

pub use backpressure::SendQueue;
pub use error::NetworkError;
pub use peer_manager::{PeerManager, PeerInfoRecord, PeerStore, MemPeerStore};
pub use wanted::Wanted;
