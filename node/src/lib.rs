//! The mist node runtime.
//!
//! A single-threaded reactor ([`core::NodeCore`]) owns every peer, pool,
//! timer, and the chain controller; the tokio shell ([`node::Node`]) feeds
//! it socket events and drives its deadlines. CPU-heavy validation runs on
//! the fixed worker pool; mining runs in the driver's own threads. All
//! cross-thread traffic is message passing.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod node;
pub mod peer;
pub mod scheduler;
pub mod validate;
pub mod worker;

pub use config::NodeConfig;
pub use core::{NodeCore, Outbound, PeerToken};
pub use error::NodeError;
pub use node::Node;
pub use validate::{AcceptAllValidator, TxValidation, TxValidator};
