//! The mining driver.
//!
//! Block assembly itself (template construction from the mempool) happens on
//! the reactor; this crate owns solving: either in-process worker threads
//! cooperating through a shared stop flag, an external solver fed through a
//! job ring, a `MiningFinalization` peer completing templates, or the
//! fake-PoW test mode producing blocks on a fixed cadence.

pub mod driver;
pub mod external;
pub mod template;

pub use driver::{MinerAction, MinerConfig, MinerDriver, MinerEvent};
pub use external::{ExternalSolver, JobRing};
pub use template::{pow_digest, BlockTemplate};
