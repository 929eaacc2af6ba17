//! The BBS: a channel-partitioned store-and-forward bus for encrypted
//! off-chain messages, with proof-of-work admission, per-channel
//! subscriptions, sync cursors, and capped retention.

pub mod store;

pub use store::{BbsAdmit, BbsConfig, BbsStore, StoredMsg, MAX_MSG_SIZE};
