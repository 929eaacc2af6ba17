//! Per-connection peer state owned by the reactor.

use std::collections::HashSet;
use std::net::SocketAddr;

use mist_network::SendQueue;
use mist_proto::{login_flags, ConnState};
use mist_types::{ContextHash, KernelId, NodeId, SystemState};

use crate::core::PeerToken;
use crate::scheduler::TaskKey;

pub struct PeerCtx {
    pub token: PeerToken,
    pub addr: SocketAddr,
    pub node_id: NodeId,
    pub state: ConnState,
    pub login_flags: u32,
    /// Authenticated with the owner key (unlocks owner-gated queries and
    /// mining finalization).
    pub owner: bool,
    /// Accepted inbound (as opposed to dialed by us).
    pub accepted_inbound: bool,
    /// The peer demonstrated it carries chain data from genesis.
    pub has_treasury: bool,
    /// Last tip the peer announced.
    pub tip: Option<SystemState>,
    /// Task keys this peer answered `DataMissing` for. Cleared on a new
    /// tip announcement and naturally on reconnect.
    pub rejected: HashSet<TaskKey>,
    pub send_queue: SendQueue,
    /// Fluff broadcast cursor: the last kernel advertised to this peer.
    pub tx_cursor: Option<KernelId>,
    /// Deadline for the response to this peer's first task.
    pub request_deadline_ms: Option<u64>,
    /// Last dependent-context link forwarded to this peer.
    pub dependent_sent: Option<ContextHash>,
}

impl PeerCtx {
    pub fn new(
        token: PeerToken,
        addr: SocketAddr,
        node_id: NodeId,
        login_flags: u32,
        owner: bool,
        accepted_inbound: bool,
        choking: usize,
        drown: usize,
    ) -> Self {
        Self {
            token,
            addr,
            node_id,
            state: ConnState::Active,
            login_flags,
            owner,
            accepted_inbound,
            has_treasury: false,
            tip: None,
            rejected: HashSet::new(),
            send_queue: SendQueue::new(choking, drown),
            tx_cursor: None,
            request_deadline_ms: None,
            dependent_sent: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnState::Active
    }

    pub fn spreads_txs(&self) -> bool {
        self.login_flags & login_flags::SPREADING_TRANSACTIONS != 0
    }

    pub fn has_bbs(&self) -> bool {
        self.login_flags & login_flags::BBS != 0
    }

    pub fn wants_peers(&self) -> bool {
        self.login_flags & login_flags::SEND_PEERS != 0
    }

    pub fn finalizes_mining(&self) -> bool {
        self.login_flags & login_flags::MINING_FINALIZATION != 0
    }

    pub fn is_viewer(&self) -> bool {
        self.login_flags & login_flags::VIEWER != 0
    }

    pub fn supports_dependent(&self) -> bool {
        self.login_flags & login_flags::DEPENDENT_CONTEXT != 0
    }

    /// Whether the peer can serve data for `id` according to its tip.
    pub fn tip_covers(&self, id: &mist_types::BlockId) -> bool {
        self.tip.map(|t| t.covers(id)).unwrap_or(false)
    }
}
