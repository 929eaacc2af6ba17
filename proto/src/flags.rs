//! Login capability flags, authentication id kinds, and disconnect reasons.

use serde::{Deserialize, Serialize};

/// Capability bits exchanged in `Login`.
pub mod login_flags {
    /// Peer relays transactions (Dandelion stem eligible).
    pub const SPREADING_TRANSACTIONS: u32 = 0x0001;
    /// Peer stores and forwards BBS messages.
    pub const BBS: u32 = 0x0002;
    /// Peer wants to receive address-book gossip.
    pub const SEND_PEERS: u32 = 0x0004;
    /// Peer offers to finalize mined block templates.
    pub const MINING_FINALIZATION: u32 = 0x0008;
    /// Peer is a viewer (watch-only; never asked for bodies).
    pub const VIEWER: u32 = 0x0010;
    /// Peer understands dependent-transaction contexts.
    pub const DEPENDENT_CONTEXT: u32 = 0x0020;
}

/// What a peer's `Authentication` signature proves control of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdType {
    /// The peer's long-term node key.
    Node,
    /// The owner (master view) key: unlocks owner-gated queries.
    Owner,
    /// A viewer key derived from the owner key.
    Viewer,
}

/// Reason codes carried by `Bye`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByeReason {
    /// Orderly shutdown.
    Stopping,
    /// Peer is banned.
    Ban,
    /// Connected to ourselves.
    Loopback,
    /// Protocol violation (malformed frame, tag mismatch, oversized pack).
    ProtocolBad,
    /// Data failed validation.
    BadData,
    /// Peer did not answer within the configured window.
    Timeout,
    /// Anything else.
    Other,
}
