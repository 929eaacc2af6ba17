//! The reactor core.
//!
//! `NodeCore` owns every piece of mutable node state (peers, pools, the
//! task registry, the BBS, the chain controller, the miner driver) and is
//! driven entirely by explicit inputs: decoded peer messages, timer ticks,
//! miner events, and local submissions, each carrying `now_ms`. It never
//! performs I/O; instead it emits [`Outbound`] directives the shell turns
//! into socket writes, dials, and disconnects. That keeps the whole
//! protocol logic deterministic under test.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;

use mist_bbs::{BbsAdmit, BbsConfig, BbsStore};
use mist_chain::{
    ChainController, ChainProcessor, ControllerConfig, DataRequest, DataStatus, ProcessorEvent,
    ProofQuery,
};
use mist_crypto::blake2b_256_multi;
use mist_miner::{BlockTemplate, MinerAction, MinerDriver, MinerEvent};
use mist_network::{PeerManager, PeerStore, Wanted};
use mist_pool::{
    min_fee, DeferredQueue, DeferredTx, DependentAdd, DependentPool, DummyBook, FluffInsert,
    FluffPool, StemEntry, StemPool, TxVerdict, MAX_TX_WEIGHT,
};
use mist_proto::messages::{self, NodeMsg};
use mist_proto::{encode_frame, ByeReason, ConnState, IdType};
use mist_types::{
    BlockHash, BlockId, CoinId, ContextHash, KernelId, MsgId, NodeId, SystemState, Timestamp,
    Transaction, TxInput, TxOutput,
};

use crate::config::NodeConfig;
use crate::peer::PeerCtx;
use crate::scheduler::{Task, TaskRegistry};
use crate::validate::{TxValidation, TxValidator};

/// Reactor-local peer handle, unique per connection.
pub type PeerToken = u64;

/// Cap on headers served in one `HdrPack`.
const HDR_PACK_MAX: u32 = 2048;

/// Cap on fluff advertisements pushed per broadcast walk.
const TX_ADVERT_BATCH: usize = 256;

/// Cap on BBS backlog messages pushed on subscribe.
const BBS_BACKLOG_BATCH: usize = 64;

/// Keepalive ping cadence.
const PING_PERIOD_MS: u64 = 30_000;

/// Directives for the I/O shell.
#[derive(Debug)]
pub enum Outbound {
    Send { to: PeerToken, msg: NodeMsg },
    Disconnect { to: PeerToken, reason: ByeReason },
    Dial { addr: SocketAddr },
}

pub struct NodeCore {
    pub cfg: NodeConfig,
    pub processor: Box<dyn ChainProcessor>,
    pub validator: Box<dyn TxValidator>,
    pub controller: ChainController,
    pub peer_mgr: PeerManager,
    pub peer_store: Box<dyn PeerStore + Send>,
    pub peers: HashMap<PeerToken, PeerCtx>,
    pub tasks: TaskRegistry,
    pub fluff: FluffPool,
    pub stem: StemPool,
    pub dependent: DependentPool,
    pub deferred: DeferredQueue,
    pub dummies: DummyBook,
    pub bbs: BbsStore,
    pub wanted_tx: Wanted<KernelId>,
    pub wanted_bbs: Wanted<MsgId>,
    pub miner: MinerDriver,
    next_token: PeerToken,
    next_aggregation_ms: u64,
    next_bbs_cleanup_ms: u64,
    next_ping_ms: u64,
    out: Vec<Outbound>,
}

impl NodeCore {
    pub fn new(
        cfg: NodeConfig,
        processor: Box<dyn ChainProcessor>,
        validator: Box<dyn TxValidator>,
        peer_store: Box<dyn PeerStore + Send>,
        miner: MinerDriver,
    ) -> Self {
        let controller = ChainController::new(
            ControllerConfig {
                rollback_limit_max: cfg.rollback_limit.max,
                timeout_since_tip_s: cfg.rollback_limit.timeout_since_tip_s,
            },
            processor.rules_max_rollback(),
        );
        let peer_mgr = PeerManager::new(
            cfg.target_peers,
            cfg.target_peers * 64,
            cfg.timeout.peers_update_ms,
            cfg.timeout.peers_db_flush_ms,
        );
        let bbs = BbsStore::new(BbsConfig {
            message_timeout_s: cfg.bbs.message_timeout_s,
            limit_count: cfg.bbs.limit_count,
            limit_size: cfg.bbs.limit_size,
            cleanup_period_ms: cfg.bbs.cleanup_period_ms,
            pow_difficulty: cfg.bbs.pow_difficulty,
        });
        let mut core = Self {
            fluff: FluffPool::new(cfg.max_pool_transactions),
            stem: StemPool::new(),
            dependent: DependentPool::new(),
            deferred: DeferredQueue::new(cfg.max_deferred_transactions),
            dummies: DummyBook::new(),
            wanted_tx: Wanted::new(cfg.timeout.get_tx_ms),
            wanted_bbs: Wanted::new(cfg.timeout.get_bbs_msg_ms),
            controller,
            peer_mgr,
            peer_store,
            bbs,
            peers: HashMap::new(),
            tasks: TaskRegistry::new(),
            miner,
            next_token: 1,
            next_aggregation_ms: 0,
            next_bbs_cleanup_ms: 0,
            next_ping_ms: 0,
            out: Vec::new(),
            processor,
            validator,
            cfg,
        };
        if let Ok(records) = core.peer_store.load() {
            core.peer_mgr.restore(records);
        }
        for addr in core.cfg.connect.clone() {
            if core.cfg.peers_persistent {
                core.peer_mgr.add_persistent(addr, 0);
            } else {
                core.peer_mgr.add_peer(addr, None, 0);
            }
        }
        if let Some(tip) = core.processor.tip() {
            core.controller.on_new_state(tip, 0);
        }
        core
    }

    /// Drain the accumulated I/O directives.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.out)
    }

    fn now_s(now_ms: u64) -> u64 {
        now_ms / 1000
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Queue a message, accounting its encoded size against the peer's
    /// send queue. Crossing the drown threshold drops the peer.
    fn send(&mut self, to: PeerToken, msg: NodeMsg) {
        let size = match encode_frame(&msg) {
            Ok(frame) => frame.len(),
            Err(e) => {
                tracing::error!(msg = msg.name(), error = %e, "unencodable message dropped");
                return;
            }
        };
        let Some((drowned, addr, pending)) = self.peers.get_mut(&to).and_then(|peer| {
            if !peer.is_active() {
                return None;
            }
            peer.send_queue.on_queued(size);
            Some((
                peer.send_queue.is_drowning(),
                peer.addr,
                peer.send_queue.pending_bytes(),
            ))
        }) else {
            return;
        };
        self.out.push(Outbound::Send { to, msg });
        if drowned {
            tracing::warn!(peer = %addr, pending, "peer drowned");
            self.disconnect(to, ByeReason::Timeout, false, 0);
        }
    }

    /// Close a peer: send `Bye`, release its tasks, drop subscriptions,
    /// and tell the shell to tear the connection down.
    pub fn disconnect(&mut self, tok: PeerToken, reason: ByeReason, ban: bool, now_ms: u64) {
        let addr = match self.peers.get_mut(&tok) {
            Some(peer) if peer.state != ConnState::Closed => {
                peer.state = ConnState::Draining;
                peer.addr
            }
            _ => return,
        };
        tracing::info!(peer = %addr, ?reason, ban, "disconnecting peer");
        self.out.push(Outbound::Send {
            to: tok,
            msg: messages::Bye { reason }.into(),
        });
        self.out.push(Outbound::Disconnect { to: tok, reason });
        self.cleanup_peer(tok, now_ms);
        if ban {
            self.peer_mgr.ban(addr, now_ms);
        }
    }

    /// The shell observed the connection die (cleanly or not).
    pub fn on_peer_disconnected(&mut self, tok: PeerToken, now_ms: u64) {
        self.cleanup_peer(tok, now_ms);
    }

    fn cleanup_peer(&mut self, tok: PeerToken, now_ms: u64) {
        let Some(mut peer) = self.peers.remove(&tok) else {
            return;
        };
        peer.state = ConnState::Closed;
        let released = self.tasks.release_all(tok);
        if released > 0 {
            tracing::debug!(peer = %peer.addr, released, "released tasks of departing peer");
            self.try_assign_tasks(now_ms);
        }
        self.bbs.unsubscribe_all(tok);
        self.peer_mgr.mark_inactive(peer.addr);
        if self.miner.finalizer() == Some(peer.node_id) {
            self.miner.on_finalizer_detached(now_ms);
        }
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    /// Register a connection that completed its handshake.
    pub fn on_peer_connected(
        &mut self,
        addr: SocketAddr,
        node_id: NodeId,
        login: &messages::Login,
        id_type: IdType,
        accepted_inbound: bool,
        now_ms: u64,
    ) -> PeerToken {
        let tok = self.next_token;
        self.next_token += 1;

        let owner = matches!(id_type, IdType::Owner);
        let peer = PeerCtx::new(
            tok,
            addr,
            node_id,
            login.flags,
            owner,
            accepted_inbound,
            self.cfg.bandwidth.choking,
            self.cfg.bandwidth.drown,
        );
        tracing::info!(peer = %addr, node = %node_id, flags = login.flags, accepted_inbound, "peer active");
        let finalizes = peer.finalizes_mining();
        self.peers.insert(tok, peer);
        self.peer_mgr.add_peer(addr, Some(node_id), now_ms);
        self.peer_mgr.mark_active(addr);

        // Greet with our tip so the peer can start asking immediately.
        if let Some(tip) = self.processor.tip() {
            self.send(tok, messages::NewTip { state: tip }.into());
        }

        if owner && finalizes && self.miner.finalizer().is_none() {
            self.miner.on_finalizer_attached(node_id);
            self.update_miner_template(now_ms);
        }

        self.try_assign_tasks(now_ms);
        tok
    }

    /// Feed a beacon announcement into the address book.
    pub fn on_beacon_announcement(&mut self, node_id: NodeId, addr: SocketAddr, now_ms: u64) {
        self.peer_mgr.add_peer(addr, Some(node_id), now_ms);
    }

    /// An outbound dial (or its handshake) failed.
    pub fn on_dial_failed(&mut self, addr: SocketAddr, now_ms: u64) {
        tracing::debug!(peer = %addr, "dial failed");
        self.peer_mgr.mark_inactive(addr);
        self.peer_mgr.penalize_slow(addr, now_ms);
    }

    /// The shell flushed `bytes` of this peer's queue to the socket.
    pub fn on_peer_drained(&mut self, tok: PeerToken, bytes: usize, _now_ms: u64) {
        let resumed = {
            let Some(peer) = self.peers.get_mut(&tok) else {
                return;
            };
            let was_choking = peer.send_queue.is_choking();
            peer.send_queue.on_drained(bytes);
            was_choking && !peer.send_queue.is_choking()
        };
        if resumed {
            // Non-essential broadcasts resume where the cursor left off.
            self.broadcast_txs_to(tok);
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub fn on_peer_msg(&mut self, tok: PeerToken, msg: NodeMsg, now_ms: u64) {
        if !self.peers.get(&tok).map(|p| p.is_active()).unwrap_or(false) {
            return;
        }
        match msg {
            NodeMsg::Ping(_) => self.send(tok, messages::Pong.into()),
            NodeMsg::Pong(_) => {}
            NodeMsg::Bye(m) => {
                tracing::debug!(reason = ?m.reason, "peer said bye");
                self.on_peer_disconnected(tok, now_ms);
            }

            NodeMsg::NewTip(m) => self.on_new_tip(tok, m.state, now_ms),
            NodeMsg::GetHdr(m) => match self.processor.get_header(&m.id) {
                Some(state) => self.send(tok, messages::Hdr { state }.into()),
                None => self.send(tok, messages::DataMissing.into()),
            },
            NodeMsg::Hdr(m) => self.on_header_pack(tok, vec![m.state], now_ms),
            NodeMsg::GetHdrPack(m) => {
                let count = m.count.min(HDR_PACK_MAX);
                let states = self.processor.get_header_pack(&m.top, count);
                if states.is_empty() {
                    self.send(tok, messages::DataMissing.into());
                } else {
                    self.send(tok, messages::HdrPack { states }.into());
                }
            }
            NodeMsg::HdrPack(m) => self.on_header_pack(tok, m.states, now_ms),
            NodeMsg::EnumHdrs(m) => self.serve_enum_hdrs(tok, &m),
            NodeMsg::GetBody(m) => match self.processor.get_body(&m.id) {
                Some((perishable, eternal)) => {
                    let body = messages::BodyBuffers {
                        perishable,
                        eternal,
                    };
                    self.send(tok, messages::Body { body }.into());
                }
                None => self.send(tok, messages::DataMissing.into()),
            },
            NodeMsg::Body(m) => self.on_bodies(tok, vec![m.body], now_ms),
            NodeMsg::GetBodyPack(m) => self.serve_body_pack(tok, &m),
            NodeMsg::BodyPack(m) => self.on_bodies(tok, m.bodies, now_ms),
            NodeMsg::DataMissing(_) => self.on_data_missing(tok, now_ms),

            NodeMsg::NewTransaction(m) => {
                let verdict = self.on_transaction(m.tx, m.context, Some(tok), m.fluff, now_ms);
                if verdict == TxVerdict::Invalid {
                    self.disconnect(tok, ByeReason::BadData, true, now_ms);
                }
            }
            NodeMsg::HaveTransaction(m) => {
                let known = self.fluff.contains(&m.id)
                    || self.stem.contains_kernel(&m.id)
                    || self.dependent.contains_key(&m.id);
                if !known && self.wanted_tx.add(m.id, now_ms) {
                    self.send(tok, messages::GetTransaction { id: m.id }.into());
                }
            }
            NodeMsg::GetTransaction(m) => match self.fluff.get(&m.id).cloned() {
                Some(tx) => self.send(
                    tok,
                    messages::NewTransaction {
                        tx,
                        context: None,
                        fluff: true,
                    }
                    .into(),
                ),
                None => self.send(tok, messages::DataMissing.into()),
            },
            NodeMsg::SetDependentContext(m) => {
                tracing::trace!(ctx = %m.id, "peer announced dependent context");
            }

            // Proof queries route to the processor; unserved ones answer
            // with DataMissing.
            NodeMsg::GetProofState(m) => self.serve_proof(tok, ProofQuery::State(m.height)),
            NodeMsg::GetProofKernel(m) => self.serve_proof(tok, ProofQuery::Kernel(m.id)),
            NodeMsg::GetProofKernel2(m) => self.serve_proof(
                tok,
                ProofQuery::Kernel2 {
                    id: m.id,
                    fetch: m.fetch,
                },
            ),
            NodeMsg::GetProofUtxo(m) => self.serve_proof(tok, ProofQuery::Utxo(m.coin)),
            NodeMsg::GetProofShieldedOutp(m) => {
                self.serve_proof(tok, ProofQuery::ShieldedOutp(m.serial))
            }
            NodeMsg::GetProofShieldedInp(m) => {
                self.serve_proof(tok, ProofQuery::ShieldedInp(m.serial))
            }
            NodeMsg::GetProofAsset(m) => self.serve_proof(tok, ProofQuery::Asset(m.asset_id)),
            NodeMsg::GetProofChainWork(_) => self.serve_proof(tok, ProofQuery::ChainWork),
            NodeMsg::GetShieldedOutputsAt(m) => {
                self.serve_proof(tok, ProofQuery::ShieldedOutputsAt(m.height))
            }
            NodeMsg::GetShieldedList(m) => {
                let query = ProofQuery::ShieldedList {
                    from: m.from,
                    count: m.count,
                };
                match self.processor.get_proof(&query) {
                    Some(data) => self.send(tok, messages::ShieldedList { data }.into()),
                    None => self.send(tok, messages::DataMissing.into()),
                }
            }
            NodeMsg::GetStateSummary(_) => {
                let tip = self.processor.tip().map(|t| t.id()).unwrap_or(BlockId {
                    height: 0,
                    hash: BlockHash::ZERO,
                });
                self.send(
                    tok,
                    messages::StateSummary {
                        tip,
                        shielded_outputs: 0,
                        shielded_inputs: 0,
                    }
                    .into(),
                );
            }
            NodeMsg::GetEvents(m) => {
                // Owner-gated: events expose wallet-relevant history.
                if !self.peers.get(&tok).map(|p| p.owner).unwrap_or(false) {
                    self.disconnect(tok, ByeReason::ProtocolBad, true, now_ms);
                    return;
                }
                let query = ProofQuery::Events {
                    height_min: m.height_min,
                };
                let events = self.processor.get_proof(&query).unwrap_or_default();
                if self.cfg.log_events {
                    tracing::info!(from = m.height_min, bytes = events.len(), "events served");
                }
                self.send(tok, messages::Events { events }.into());
            }
            NodeMsg::ContractVarsEnum(m) => {
                let query = ProofQuery::ContractVars {
                    key_min: m.key_min,
                    key_max: m.key_max,
                };
                match self.processor.get_proof(&query) {
                    Some(data) => self.send(tok, messages::ContractVars { data }.into()),
                    None => self.send(tok, messages::DataMissing.into()),
                }
            }
            NodeMsg::ContractLogsEnum(m) => {
                let query = ProofQuery::ContractLogs {
                    height_min: m.height_min,
                    height_max: m.height_max,
                };
                match self.processor.get_proof(&query) {
                    Some(data) => self.send(tok, messages::ContractLogs { data }.into()),
                    None => self.send(tok, messages::DataMissing.into()),
                }
            }
            NodeMsg::GetContractVar(m) => self.serve_proof(tok, ProofQuery::ContractVar(m.key)),
            NodeMsg::GetContractLogProof(m) => self.serve_proof(
                tok,
                ProofQuery::ContractLogProof {
                    height: m.height,
                    idx: m.idx,
                },
            ),
            NodeMsg::ProofData(_)
            | NodeMsg::StateSummary(_)
            | NodeMsg::Events(_)
            | NodeMsg::ShieldedList(_)
            | NodeMsg::ContractVars(_)
            | NodeMsg::ContractLogs(_) => {
                // Replies we never solicit node-to-node.
                self.disconnect(tok, ByeReason::ProtocolBad, true, now_ms);
            }

            NodeMsg::PeerInfo(m) => self.peer_mgr.add_peer(m.addr, Some(m.node_id), now_ms),
            NodeMsg::PeerInfoSelf(m) => {
                if let Some((ip, node_id)) =
                    self.peers.get(&tok).map(|p| (p.addr.ip(), p.node_id))
                {
                    let advertised = SocketAddr::new(ip, m.port);
                    self.peer_mgr.add_peer(advertised, Some(node_id), now_ms);
                }
            }
            NodeMsg::GetExternalAddr(_) => {
                if let Some(addr) = self.peers.get(&tok).map(|p| p.addr) {
                    self.send(tok, messages::ExternalAddr { addr }.into());
                }
            }
            NodeMsg::ExternalAddr(_) => {}

            NodeMsg::BbsMsg(m) => self.on_bbs_msg(tok, m, now_ms),
            NodeMsg::BbsHaveMsg(m) => {
                if !self.bbs.contains(&m.id) && self.wanted_bbs.add(m.id, now_ms) {
                    self.send(tok, messages::BbsGetMsg { id: m.id }.into());
                }
            }
            NodeMsg::BbsGetMsg(m) => {
                let reply = self.bbs.get(&m.id).map(|stored| messages::BbsMsg {
                    channel: stored.channel,
                    time_posted: stored.time_posted,
                    payload: stored.payload.clone(),
                    nonce: stored.nonce,
                });
                match reply {
                    Some(msg) => self.send(tok, msg.into()),
                    None => self.send(tok, messages::DataMissing.into()),
                }
            }
            NodeMsg::BbsSubscribe(m) => {
                self.bbs.subscribe(tok, m.channel, m.time_from, m.on);
                if m.on {
                    self.push_bbs_backlog(tok, m.channel, m.time_from);
                }
            }
            NodeMsg::BbsResetSync(m) => self.bbs.reset_sync(tok, m.time_from),

            NodeMsg::GetBlockFinalization(m) => {
                tracing::trace!(height = m.height, "finalization request ignored (not a finalizer)");
            }
            NodeMsg::BlockFinalization(m) => self.on_block_finalization(tok, m.tx, now_ms),

            NodeMsg::SChannelInitiate(_)
            | NodeMsg::SChannelReady(_)
            | NodeMsg::Authentication(_)
            | NodeMsg::Login(_) => {
                // Handshake traffic after activation is a violation.
                self.disconnect(tok, ByeReason::ProtocolBad, true, now_ms);
            }
        }
    }

    fn serve_proof(&mut self, tok: PeerToken, query: ProofQuery) {
        match self.processor.get_proof(&query) {
            Some(proof) => self.send(tok, messages::ProofData { proof }.into()),
            None => self.send(tok, messages::DataMissing.into()),
        }
    }

    fn serve_enum_hdrs(&mut self, tok: PeerToken, m: &messages::EnumHdrs) {
        let tip_h = self.controller.tip_height();
        let top_h = m
            .from
            .saturating_add((m.count as u64).saturating_sub(1))
            .min(tip_h);
        let top = self
            .processor
            .tip()
            .filter(|t| t.height == top_h)
            .or_else(|| {
                let tip = self.processor.tip()?;
                self.processor
                    .get_header_pack(&tip.id(), HDR_PACK_MAX)
                    .into_iter()
                    .find(|s| s.height == top_h)
            });
        match top {
            Some(top) if m.count > 0 => {
                let count = (top_h.saturating_sub(m.from) + 1).min(HDR_PACK_MAX as u64);
                let states = self.processor.get_header_pack(&top.id(), count as u32);
                if states.is_empty() {
                    self.send(tok, messages::DataMissing.into());
                } else {
                    self.send(tok, messages::HdrPack { states }.into());
                }
            }
            _ => self.send(tok, messages::DataMissing.into()),
        }
    }

    fn serve_body_pack(&mut self, tok: PeerToken, req: &messages::GetBodyPack) {
        let count = req
            .count_extra
            .saturating_add(1)
            .min(self.cfg.bandwidth.max_body_pack_count);
        let states = self.processor.get_header_pack(&req.top, count);
        let mut bodies = Vec::new();
        let mut total = 0usize;
        // Serve newest-first availability but ship ascending like HdrPack.
        for state in &states {
            match self.processor.get_body(&state.id()) {
                Some((perishable, eternal)) => {
                    total += perishable.len() + eternal.len();
                    bodies.push(messages::BodyBuffers {
                        perishable,
                        eternal,
                    });
                    if total >= self.cfg.bandwidth.max_body_pack_size {
                        break;
                    }
                }
                None => break,
            }
        }
        if bodies.is_empty() {
            self.send(tok, messages::DataMissing.into());
        } else {
            self.send(tok, messages::BodyPack { bodies }.into());
        }
    }

    // ------------------------------------------------------------------
    // Chain data intake
    // ------------------------------------------------------------------

    fn on_new_tip(&mut self, tok: PeerToken, state: SystemState, now_ms: u64) {
        {
            let Some(peer) = self.peers.get_mut(&tok) else {
                return;
            };
            peer.tip = Some(state);
            peer.has_treasury = true;
            // A fresh tip voids the peer's previous refusals.
            peer.rejected.clear();
        }

        let known = self.processor.get_header(&state.id()).is_some();
        let better = self
            .processor
            .tip()
            .map(|t| state.chain_work > t.chain_work)
            .unwrap_or(true);
        if !known && better {
            self.intake_request(DataRequest {
                id: state.id(),
                is_body: false,
                target: state.id(),
            });
            self.try_assign_tasks(now_ms);
        }
    }

    /// Answer-order contract: whatever chain data a peer sends must answer
    /// its first task. Returns the completed task, or kills the peer.
    fn take_first_task_checked(
        &mut self,
        tok: PeerToken,
        is_body: bool,
        now_ms: u64,
    ) -> Option<Task> {
        let matches = self
            .tasks
            .first_task(tok)
            .map(|t| t.is_body() == is_body)
            .unwrap_or(false);
        if matches {
            let task = self.tasks.complete_first(tok);
            self.rearm_request_timer(tok, now_ms);
            task
        } else {
            self.disconnect(tok, ByeReason::ProtocolBad, true, now_ms);
            None
        }
    }

    fn on_header_pack(&mut self, tok: PeerToken, states: Vec<SystemState>, now_ms: u64) {
        let Some(task) = self.take_first_task_checked(tok, false, now_ms) else {
            return;
        };
        // Strict chaining: the pack must end at the requested id.
        if states.last().map(|s| s.id()) != Some(task.key.0) {
            self.fail_data(tok, task.key.0, false, task.target, now_ms);
            return;
        }
        let Some((node_id, addr)) = self.peers.get(&tok).map(|p| (p.node_id, p.addr)) else {
            return;
        };
        let (status, events) = self.processor.on_header_pack(&states, node_id);
        match status {
            DataStatus::Accepted => {
                let bytes = states.len() * std::mem::size_of::<SystemState>();
                self.peer_mgr.reward_data(addr, bytes, now_ms);
                self.controller.sync.header_done(1);
                self.apply_events(events, now_ms);
            }
            DataStatus::Rejected => {}
            DataStatus::Invalid | DataStatus::Unreachable => {
                // Strict chaining decision: a pack that does not attach is
                // treated as bad data.
                self.fail_data(tok, task.key.0, false, task.target, now_ms);
            }
        }
        self.try_assign_tasks(now_ms);
    }

    fn on_bodies(&mut self, tok: PeerToken, bodies: Vec<messages::BodyBuffers>, now_ms: u64) {
        let Some(task) = self.take_first_task_checked(tok, true, now_ms) else {
            return;
        };
        if bodies.is_empty() {
            self.fail_data(tok, task.key.0, true, task.target, now_ms);
            return;
        }
        // A pack covers the consecutive segment ending at the requested id;
        // recover the ids from the stored headers.
        let ids: Vec<BlockId> = if bodies.len() == 1 {
            vec![task.key.0]
        } else {
            self.processor
                .get_header_pack(&task.key.0, bodies.len() as u32)
                .iter()
                .map(|s| s.id())
                .collect()
        };
        if ids.len() != bodies.len() {
            self.fail_data(tok, task.key.0, true, task.target, now_ms);
            return;
        }

        let Some((node_id, addr)) = self.peers.get(&tok).map(|p| (p.node_id, p.addr)) else {
            return;
        };
        let mut accepted = 0u64;
        let mut bytes = 0usize;
        let mut all_events = Vec::new();
        let mut bad = false;
        for (id, body) in ids.iter().zip(&bodies) {
            bytes += body.len();
            let (status, events) =
                self.processor
                    .on_body(id, &body.perishable, &body.eternal, node_id);
            all_events.extend(events);
            match status {
                DataStatus::Accepted => accepted += 1,
                DataStatus::Rejected => {}
                DataStatus::Invalid | DataStatus::Unreachable => {
                    bad = true;
                    break;
                }
            }
        }
        if accepted > 0 {
            self.peer_mgr.reward_data(addr, bytes, now_ms);
            self.controller.sync.body_done(accepted);
        }
        self.apply_events(all_events, now_ms);
        if bad {
            self.fail_data(tok, task.key.0, true, task.target, now_ms);
        }
        self.try_assign_tasks(now_ms);
    }

    /// Bad data from a peer: demote hard, drop the connection, and put the
    /// demand back so another peer can serve it.
    fn fail_data(
        &mut self,
        tok: PeerToken,
        id: BlockId,
        is_body: bool,
        target: BlockId,
        now_ms: u64,
    ) {
        if let Some(addr) = self.peers.get(&tok).map(|p| p.addr) {
            self.peer_mgr.penalize_bad_data(addr, now_ms);
        }
        self.disconnect(tok, ByeReason::BadData, true, now_ms);
        self.intake_request(DataRequest { id, is_body, target });
        self.try_assign_tasks(now_ms);
    }

    fn on_data_missing(&mut self, tok: PeerToken, now_ms: u64) {
        let Some(key) = self.tasks.first_task(tok).map(|t| t.key) else {
            self.disconnect(tok, ByeReason::ProtocolBad, true, now_ms);
            return;
        };
        self.tasks.release_first(tok);
        if let Some(peer) = self.peers.get_mut(&tok) {
            peer.rejected.insert(key);
        }
        self.rearm_request_timer(tok, now_ms);
        self.try_assign_tasks(now_ms);
    }

    // ------------------------------------------------------------------
    // Processor events
    // ------------------------------------------------------------------

    fn apply_events(&mut self, events: Vec<ProcessorEvent>, now_ms: u64) {
        for event in events {
            match event {
                ProcessorEvent::NewState => {
                    let Some(tip) = self.processor.tip() else {
                        continue;
                    };
                    if self.controller.on_new_state(tip, now_ms) {
                        self.on_tip_changed(tip, now_ms);
                    }
                }
                ProcessorEvent::RolledBack(id) => {
                    tracing::info!(below = %id, "chain rolled back");
                    self.controller.on_rolled_back();
                    for peer in self.peers.values_mut() {
                        peer.rejected.clear();
                    }
                    self.dependent.clear();
                }
                ProcessorEvent::Modified => self.controller.on_modified(now_ms),
                ProcessorEvent::FastSyncSucceeded => {
                    self.controller.on_fast_sync_succeeded();
                    self.drain_deferred(now_ms);
                    self.update_miner_template(now_ms);
                }
                ProcessorEvent::PeerInsane(node_id) => {
                    self.controller.on_peer_insane(node_id);
                }
                ProcessorEvent::RequestData(req) => self.intake_request(req),
            }
        }
        // Insane peers queued above (possibly from a worker completion)
        // are disconnected here, on the reactor.
        for node_id in self.controller.take_insane_peers() {
            let tok = self
                .peers
                .iter()
                .find(|(_, p)| p.node_id == node_id)
                .map(|(t, _)| *t);
            if let Some(tok) = tok {
                self.disconnect(tok, ByeReason::BadData, true, now_ms);
            }
        }
    }

    fn intake_request(&mut self, req: DataRequest) {
        let (h0, txo_lo) = self.processor.fast_sync_horizons();
        if self
            .tasks
            .request_data(req.id, req.is_body, req.target, h0, txo_lo)
            .is_some()
        {
            if req.is_body {
                self.controller.sync.add_body_target(1);
            } else {
                self.controller.sync.add_header_target(1);
            }
        }
    }

    fn on_tip_changed(&mut self, tip: SystemState, now_ms: u64) {
        // Dependent contexts are tied to the state they were built on.
        self.dependent.clear();

        // Stem entries whose confirm deadline arrived get fluffed.
        let due = self.stem.pop_confirm_due(tip.height);
        for entry in due {
            tracing::debug!(key = %entry.tx.key(), "stem confirm deadline reached, fluffing");
            self.fluff_transaction(entry.tx, None, now_ms);
        }

        let targets: Vec<PeerToken> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_active())
            .map(|(t, _)| *t)
            .collect();
        for tok in targets {
            self.send(tok, messages::NewTip { state: tip }.into());
        }
        self.update_miner_template(now_ms);
    }

    // ------------------------------------------------------------------
    // Task assignment
    // ------------------------------------------------------------------

    fn request_timeout_for(&self, is_body: bool) -> u64 {
        if is_body {
            self.cfg.timeout.get_block_ms
        } else {
            self.cfg.timeout.get_state_ms
        }
    }

    fn rearm_request_timer(&mut self, tok: PeerToken, now_ms: u64) {
        let deadline = self
            .tasks
            .first_task(tok)
            .map(|t| now_ms + self.request_timeout_for(t.is_body()));
        if let Some(peer) = self.peers.get_mut(&tok) {
            peer.request_deadline_ms = deadline;
        }
    }

    /// Offer every unassigned task to the best capable peer.
    ///
    /// Peers are ranked by adjusted rating with ties broken by lowest node
    /// id, so reassignment is reproducible. A peer qualifies when its tip
    /// covers the task, it has not refused the key, and it has a free slot
    /// (bodies bounded by `max_concurrent_blocks_request`, headers by one).
    pub fn try_assign_tasks(&mut self, now_ms: u64) {
        for tid in self.tasks.unassigned_ids() {
            let Some((key, target)) = self.tasks.get(tid).map(|t| (t.key, t.target)) else {
                continue;
            };
            let (id, is_body) = key;

            let mut best: Option<(u32, NodeId, PeerToken)> = None;
            for (tok, peer) in &self.peers {
                if !peer.is_active() || peer.is_viewer() {
                    continue;
                }
                if peer.rejected.contains(&key) || !peer.tip_covers(&id) {
                    continue;
                }
                let has_slot = if is_body {
                    self.tasks.body_count(*tok)
                        < self.cfg.max_concurrent_blocks_request as usize
                } else {
                    self.tasks.header_count(*tok) < 1
                };
                if !has_slot {
                    continue;
                }
                let rating = self.peer_mgr.rating(peer.addr, now_ms).unwrap_or(0);
                best = match best {
                    Some(cur) if (cur.0, std::cmp::Reverse(cur.1)) >= (rating, std::cmp::Reverse(peer.node_id)) => {
                        Some(cur)
                    }
                    _ => Some((rating, peer.node_id, *tok)),
                };
            }

            let Some((_, _, tok)) = best else {
                continue;
            };
            let (h0, txo_lo) = self.processor.fast_sync_horizons();
            self.tasks.assign(tid, tok, now_ms, h0, txo_lo);

            let msg: NodeMsg = if is_body {
                let span = id.height.saturating_sub(h0.saturating_add(1));
                let pack_cap = (self.cfg.bandwidth.max_body_pack_count as u64).saturating_sub(1);
                let count_extra = if self.processor.is_fast_sync() && span > 0 {
                    span.min(pack_cap) as u32
                } else {
                    0
                };
                if count_extra > 0 {
                    messages::GetBodyPack {
                        top: id,
                        count_extra,
                        height_hard_lo: h0,
                        height_txo_lo: txo_lo,
                    }
                    .into()
                } else {
                    messages::GetBody { id }.into()
                }
            } else {
                let count = id.height.min(HDR_PACK_MAX as u64) as u32;
                messages::GetHdrPack { top: id, count }.into()
            };
            self.send(tok, msg);
            if self.tasks.assigned_count(tok) == 1 {
                self.rearm_request_timer(tok, now_ms);
            }
            tracing::debug!(id = %id, is_body, target = %target, "task assigned");
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Local submission (RPC-side entry).
    pub fn on_tx_submitted(
        &mut self,
        tx: Transaction,
        context: Option<ContextHash>,
        fluff: bool,
        now_ms: u64,
    ) -> TxVerdict {
        self.on_transaction(tx, context, None, fluff, now_ms)
    }

    /// The shared acceptance pipeline.
    pub fn on_transaction(
        &mut self,
        tx: Transaction,
        context: Option<ContextHash>,
        from: Option<PeerToken>,
        fluff: bool,
        now_ms: u64,
    ) -> TxVerdict {
        // Until fast-sync completes we cannot validate; park the submission.
        if !self.controller.is_full_mode() {
            let from_peer = from.and_then(|t| self.peers.get(&t)).map(|p| p.node_id);
            self.deferred.push(DeferredTx {
                tx,
                context,
                from_peer,
                fluff,
            });
            return TxVerdict::Ok;
        }

        if tx.kernels.is_empty() {
            return TxVerdict::Invalid;
        }
        if tx.weight() > MAX_TX_WEIGHT {
            return TxVerdict::TooBig;
        }
        let key = tx.key();
        if self.fluff.contains(&key) || self.stem.contains_kernel(&key) {
            return TxVerdict::Duplicate;
        }
        if tx.fee() < min_fee(tx.weight()) {
            return TxVerdict::LowFee;
        }
        let tip = self.controller.tip_height();
        if !tx.height_range().contains(tip + 1) {
            return TxVerdict::Invalid;
        }
        let fee_reserve = match self.validator.validate(&tx, tip) {
            TxValidation::Valid { fee_reserve } => fee_reserve,
            TxValidation::Invalid => return TxVerdict::Invalid,
            TxValidation::Obscured => return TxVerdict::Obscured,
            TxValidation::InsufficientFeeReserve => return TxVerdict::InsufficientFeeReserve,
        };

        if let Some(parent) = context {
            return self.accept_dependent(tx, parent);
        }

        let roll = rand::thread_rng().gen::<u16>();
        if fluff || roll < self.cfg.dandelion.fluff_probability {
            self.fluff_transaction(tx, from, now_ms)
        } else {
            self.accept_stem(tx, fee_reserve, now_ms)
        }
    }

    fn accept_stem(&mut self, tx: Transaction, fee_reserve: u64, now_ms: u64) -> TxVerdict {
        let d = &self.cfg.dandelion;
        let embargo = now_ms + rand::thread_rng().gen_range(d.timeout_min_ms..=d.timeout_max_ms);
        let entry = StemEntry {
            aggregating: true,
            embargo_at_ms: embargo,
            confirm_deadline: self.controller.tip_height() + d.dh_stem_confirm,
            fee_reserve,
            tx,
        };
        let key = entry.tx.key();
        if !self.stem.insert(entry) {
            return TxVerdict::Duplicate;
        }
        if self.cfg.log_tx_stem {
            tracing::info!(key = %key, embargo_ms = embargo, "tx entered stem pool");
        }
        TxVerdict::Ok
    }

    fn accept_dependent(&mut self, tx: Transaction, parent: ContextHash) -> TxVerdict {
        let tip_ctx = self.tip_context();
        let parent_opt = if parent == tip_ctx { None } else { Some(parent) };
        let new_ctx = ContextHash::new(blake2b_256_multi(&[
            parent.as_bytes(),
            tx.key().as_bytes(),
        ]));
        match self.dependent.add(tx, new_ctx, parent_opt) {
            DependentAdd::Added => {
                let targets: Vec<PeerToken> = self
                    .peers
                    .iter()
                    .filter(|(_, p)| p.is_active() && p.supports_dependent())
                    .map(|(t, _)| *t)
                    .collect();
                for tok in targets {
                    if let Some(peer) = self.peers.get_mut(&tok) {
                        peer.dependent_sent = Some(new_ctx);
                    }
                    self.send(
                        tok,
                        messages::SetDependentContext {
                            id: new_ctx,
                            parent,
                        }
                        .into(),
                    );
                }
                TxVerdict::Ok
            }
            DependentAdd::DuplicateContext => TxVerdict::Duplicate,
            DependentAdd::ParentNotFound => TxVerdict::DependentNotFound,
        }
    }

    /// The root context of the dependent chain: the current tip.
    pub fn tip_context(&self) -> ContextHash {
        match self.processor.tip() {
            Some(tip) => ContextHash::new(*tip.hash.as_bytes()),
            None => ContextHash::ZERO,
        }
    }

    /// Insert into the fluff pool and advertise to spreading peers.
    fn fluff_transaction(
        &mut self,
        tx: Transaction,
        from: Option<PeerToken>,
        now_ms: u64,
    ) -> TxVerdict {
        let key = tx.key();
        // Arriving by fluff supersedes any stem copy (someone fluffed it).
        self.stem.remove_by_kernel(&key);
        self.wanted_tx.remove(&key);

        match self.fluff.insert(tx) {
            FluffInsert::Duplicate => TxVerdict::Duplicate,
            FluffInsert::Added { evicted } => {
                if evicted.contains(&key) {
                    return TxVerdict::MempoolFull;
                }
                if self.cfg.log_tx_fluff {
                    tracing::info!(key = %key, "tx entered fluff pool");
                }
                let targets: Vec<PeerToken> = self
                    .peers
                    .iter()
                    .filter(|(t, p)| p.is_active() && p.spreads_txs() && Some(**t) != from)
                    .map(|(t, _)| *t)
                    .collect();
                for tok in targets {
                    self.broadcast_txs_to(tok);
                }
                // A richer pool is a reason to re-template the miner.
                self.update_miner_template(now_ms);
                TxVerdict::Ok
            }
        }
    }

    /// Advance one peer's fluff advertisement cursor, honoring choking.
    fn broadcast_txs_to(&mut self, tok: PeerToken) {
        loop {
            let cursor = match self.peers.get(&tok) {
                Some(p) if p.is_active() && p.spreads_txs() && !p.send_queue.is_choking() => {
                    p.tx_cursor
                }
                _ => return,
            };
            let batch = self.fluff.keys_after(cursor, TX_ADVERT_BATCH);
            if batch.is_empty() {
                return;
            }
            let last = *batch.last().expect("non-empty batch");
            for id in batch {
                self.send(tok, messages::HaveTransaction { id }.into());
            }
            if let Some(peer) = self.peers.get_mut(&tok) {
                peer.tx_cursor = Some(last);
            }
        }
    }

    fn drain_deferred(&mut self, now_ms: u64) {
        while let Some(item) = self.deferred.pop() {
            let verdict = self.on_transaction(item.tx, item.context, None, item.fluff, now_ms);
            tracing::debug!(?verdict, "deferred transaction processed");
        }
    }

    // ------------------------------------------------------------------
    // Dandelion aggregation
    // ------------------------------------------------------------------

    /// Periodic aggregation pass: merge compatible stem entries, pad
    /// under-sized ones with dummies, then relay each aggregate along the
    /// stem to one spreading peer.
    fn aggregate_stem(&mut self, now_ms: u64) {
        let d = self.cfg.dandelion.clone();

        // Greedy pairwise merging in deterministic key order.
        let mut open = self.stem.aggregating_keys();
        let mut i = 0;
        while i < open.len() {
            let mut j = i + 1;
            while j < open.len() {
                match self.stem.merge(&open[i], &open[j], d.outputs_max) {
                    Some(merged) => {
                        open[i] = merged;
                        open.remove(j);
                    }
                    None => j += 1,
                }
            }
            i += 1;
        }

        for key in open {
            let Some((mut tx, fee_reserve)) = self
                .stem
                .get(&key)
                .map(|e| (e.tx.clone(), e.fee_reserve))
            else {
                continue;
            };
            let io = tx.io_count();
            if io < d.outputs_min && d.dummy_lifetime_hi > 0 {
                self.pad_with_dummies(&mut tx, d.outputs_min - io, fee_reserve);
            }

            // Re-key if padding changed the transaction; either way the
            // element stops aggregating and starts its relay phase.
            let Some(old) = self.stem.remove(&key) else {
                continue;
            };
            let relayed_key = tx.key();
            let inserted = self.stem.insert(StemEntry {
                tx: tx.clone(),
                aggregating: false,
                embargo_at_ms: old.embargo_at_ms,
                confirm_deadline: old.confirm_deadline,
                fee_reserve: old.fee_reserve,
            });
            debug_assert!(inserted, "re-keyed stem entry must not collide");
            if self.cfg.log_tx_stem {
                tracing::info!(key = %relayed_key, io = tx.io_count(), "stem aggregate relayed");
            }
            self.relay_stem(tx);
        }
        let _ = now_ms;
    }

    /// Add dummy outputs (and spendable matured dummy inputs) to disguise
    /// an under-sized aggregate.
    fn pad_with_dummies(&mut self, tx: &mut Transaction, missing: usize, fee_reserve: u64) {
        let tip = self.controller.tip_height();
        let (lifetime_lo, lifetime_hi) = (
            self.cfg.dandelion.dummy_lifetime_lo,
            self.cfg.dandelion.dummy_lifetime_hi,
        );

        // Spend dummies whose maturity height arrived.
        for coin in self.dummies.take_ready(tip, missing) {
            tx.inputs.push(TxInput { spends: coin });
        }

        // Fund fresh dummies from the fee reserve, one unit each.
        let affordable = (fee_reserve as usize).min(missing);
        let mut rng = rand::thread_rng();
        for _ in 0..affordable {
            let mut raw = [0u8; 32];
            rng.fill(&mut raw);
            let coin = CoinId::new(raw);
            let lifetime = rng.gen_range(lifetime_lo..=lifetime_hi);
            self.dummies.add(coin, tip + lifetime);
            tx.outputs.push(TxOutput { commitment: coin });
        }
    }

    /// Relay a stem transaction to one random spreading peer.
    fn relay_stem(&mut self, tx: Transaction) {
        let candidates: Vec<PeerToken> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_active() && p.spreads_txs())
            .map(|(t, _)| *t)
            .collect();
        if candidates.is_empty() {
            // Nobody to stem through; the embargo timer will fluff it.
            return;
        }
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        self.send(
            pick,
            messages::NewTransaction {
                tx,
                context: None,
                fluff: false,
            }
            .into(),
        );
    }

    // ------------------------------------------------------------------
    // Mining
    // ------------------------------------------------------------------

    /// Rebuild the block template from the current tip and pool and hand
    /// it to the driver.
    pub fn update_miner_template(&mut self, now_ms: u64) {
        if !self.miner.is_enabled() || !self.controller.is_full_mode() {
            return;
        }
        let Some(tip) = self.processor.tip() else {
            return;
        };
        let fees: u64 = self.fluff.iter_by_density_desc().map(|tx| tx.fee()).sum();
        let height = tip.height + 1;
        let input = blake2b_256_multi(&[
            tip.hash.as_bytes(),
            &height.to_le_bytes(),
            &fees.to_le_bytes(),
        ]);
        let template = BlockTemplate {
            height,
            prev: tip.hash,
            fees,
            input,
            difficulty: tip.difficulty,
        };
        match self.miner.set_template(template, now_ms) {
            MinerAction::None => {}
            MinerAction::SendToFinalizer { peer, height, fees } => {
                let tok = self
                    .peers
                    .iter()
                    .find(|(_, p)| p.node_id == peer)
                    .map(|(t, _)| *t);
                if let Some(tok) = tok {
                    self.send(tok, messages::GetBlockFinalization { height, fees }.into());
                }
            }
        }
    }

    /// A solution arrived from a worker thread or the fake-PoW timer.
    pub fn on_miner_event(&mut self, event: MinerEvent, now_ms: u64) {
        let MinerEvent::Solved {
            template, nonce, ..
        } = event;
        let Some(tip) = self.processor.tip() else {
            return;
        };
        if template.prev != tip.hash {
            tracing::debug!(height = template.height, "stale solution dropped");
            return;
        }
        let digest = mist_miner::pow_digest(&template.input, nonce);
        let state = SystemState {
            height: template.height,
            prev: template.prev,
            hash: BlockHash::new(digest),
            definition: BlockHash::ZERO,
            chain_work: tip.chain_work + template.difficulty.to_work(),
            difficulty: template.difficulty,
            timestamp: Timestamp::new(Self::now_s(now_ms)),
        };
        tracing::info!(height = state.height, hash = %state.hash, "block mined");
        let node_id = NodeId::ZERO;
        let (status, mut events) = self.processor.on_header_pack(&[state], node_id);
        if status == DataStatus::Accepted {
            let (_, more) = self.processor.on_body(&state.id(), &[], &[], node_id);
            events.extend(more);
        }
        self.apply_events(events, now_ms);
    }

    /// The finalizer returned its assembled coinbase.
    fn on_block_finalization(&mut self, tok: PeerToken, _tx: Transaction, now_ms: u64) {
        let is_finalizer = self
            .peers
            .get(&tok)
            .map(|p| self.miner.finalizer() == Some(p.node_id))
            .unwrap_or(false);
        if !is_finalizer {
            self.disconnect(tok, ByeReason::ProtocolBad, true, now_ms);
            return;
        }
        if let Some(template) = self.miner.on_finalized() {
            // The finalized template still needs PoW; solve locally.
            self.miner.solve_finalized(template, now_ms);
        }
    }

    // ------------------------------------------------------------------
    // BBS
    // ------------------------------------------------------------------

    fn on_bbs_msg(&mut self, from: PeerToken, m: messages::BbsMsg, now_ms: u64) {
        let admit = self.bbs.post(
            m.channel,
            m.time_posted,
            m.payload.clone(),
            m.nonce,
            Self::now_s(now_ms),
        );
        match admit {
            BbsAdmit::Stored { id } => {
                self.wanted_bbs.remove(&id);
                // Direct delivery to subscribers of the channel; everyone
                // else with BBS gets an advertisement. Both honor choking.
                let subscribers = self.bbs.subscribers(m.channel);
                let others: Vec<PeerToken> = self
                    .peers
                    .iter()
                    .filter(|(t, p)| {
                        p.is_active()
                            && p.has_bbs()
                            && **t != from
                            && !subscribers.contains(t)
                            && !p.send_queue.is_choking()
                    })
                    .map(|(t, _)| *t)
                    .collect();
                for tok in subscribers {
                    if tok == from {
                        continue;
                    }
                    let choking = self
                        .peers
                        .get(&tok)
                        .map(|p| p.send_queue.is_choking())
                        .unwrap_or(true);
                    if choking {
                        continue;
                    }
                    self.send(tok, m.clone().into());
                    self.bbs.advance_cursor(tok, m.channel, m.time_posted);
                }
                for tok in others {
                    self.send(tok, messages::BbsHaveMsg { id }.into());
                }
            }
            BbsAdmit::Duplicate { .. } => {}
            BbsAdmit::PowInvalid | BbsAdmit::TooLarge => {
                self.disconnect(from, ByeReason::ProtocolBad, true, now_ms);
            }
            BbsAdmit::TimeOutOfRange => {
                tracing::trace!("bbs message outside the retention window");
            }
        }
    }

    fn push_bbs_backlog(&mut self, tok: PeerToken, channel: u32, time_from: Timestamp) {
        let after = Timestamp::new(time_from.secs().saturating_sub(1));
        let backlog = self.bbs.enum_after(channel, after, BBS_BACKLOG_BATCH);
        for id in backlog {
            let choking = self
                .peers
                .get(&tok)
                .map(|p| p.send_queue.is_choking())
                .unwrap_or(true);
            if choking {
                return;
            }
            let Some((msg, time)) = self.bbs.get(&id).map(|stored| {
                (
                    messages::BbsMsg {
                        channel: stored.channel,
                        time_posted: stored.time_posted,
                        payload: stored.payload.clone(),
                        nonce: stored.nonce,
                    },
                    stored.time_posted,
                )
            }) else {
                continue;
            };
            self.send(tok, msg.into());
            self.bbs.advance_cursor(tok, channel, time);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// The earliest deadline across every subsystem.
    pub fn next_wakeup_ms(&mut self) -> Option<u64> {
        let candidates = [
            self.controller.next_wakeup_ms(),
            self.stem.next_embargo_ms(),
            Some(self.next_aggregation_ms),
            Some(self.next_bbs_cleanup_ms),
            Some(self.next_ping_ms),
            self.wanted_tx.next_expiry_ms(),
            self.wanted_bbs.next_expiry_ms(),
            self.miner.next_wakeup_ms(),
            self.peers
                .values()
                .filter_map(|p| p.request_deadline_ms)
                .min(),
        ];
        candidates.into_iter().flatten().min()
    }

    /// Run every due periodic duty. Safe to call at any time.
    pub fn on_timer(&mut self, now_ms: u64) {
        // Chain controller deadlines.
        if self.controller.take_flush_due(now_ms) {
            if let Err(e) = self.processor.flush() {
                tracing::warn!(error = %e, "db flush failed, rescheduling");
                self.controller.on_modified(now_ms);
            }
        }
        if self.controller.take_go_up_due(now_ms) {
            let allowance = self.controller.max_auto_rollback(Self::now_s(now_ms));
            let events = self.processor.try_go_up(allowance);
            self.apply_events(events, now_ms);
            let requests = self.processor.enum_congestions();
            for req in requests {
                self.intake_request(req);
            }
            self.try_assign_tasks(now_ms);
        }

        // Stem embargoes: fluff regardless of aggregation state.
        for entry in self.stem.pop_embargoed(now_ms) {
            tracing::debug!(key = %entry.tx.key(), "stem embargo expired, fluffing");
            self.fluff_transaction(entry.tx, None, now_ms);
        }

        // Aggregation cadence.
        if now_ms >= self.next_aggregation_ms {
            self.next_aggregation_ms = now_ms + self.cfg.dandelion.aggregation_time_ms;
            self.aggregate_stem(now_ms);
        }

        // Expired wants are forgotten; a fresh advertisement re-requests.
        for id in self.wanted_tx.pop_expired(now_ms) {
            tracing::trace!(key = %id, "wanted tx expired");
        }
        for id in self.wanted_bbs.pop_expired(now_ms) {
            tracing::trace!(id = %id, "wanted bbs msg expired");
        }

        // BBS cleanup cadence.
        if now_ms >= self.next_bbs_cleanup_ms {
            self.next_bbs_cleanup_ms = now_ms + self.cfg.bbs.cleanup_period_ms;
            self.bbs.maybe_cleanup(now_ms);
        }

        // Keepalive pings.
        if now_ms >= self.next_ping_ms {
            self.next_ping_ms = now_ms + PING_PERIOD_MS;
            let targets: Vec<PeerToken> = self
                .peers
                .iter()
                .filter(|(_, p)| p.is_active())
                .map(|(t, _)| *t)
                .collect();
            for tok in targets {
                self.send(tok, messages::Ping.into());
            }
        }

        // Peer request timeouts.
        let overdue: Vec<PeerToken> = self
            .peers
            .iter()
            .filter(|(_, p)| p.request_deadline_ms.map(|d| now_ms >= d).unwrap_or(false))
            .map(|(t, _)| *t)
            .collect();
        for tok in overdue {
            self.on_request_timeout(tok, now_ms);
        }

        // Peer activation and address-book flush.
        for addr in self.peer_mgr.activate_more_peers(now_ms) {
            self.out.push(Outbound::Dial { addr });
        }
        if self.peer_mgr.should_flush(now_ms) {
            if let Err(e) = self.peer_mgr.flush(self.peer_store.as_mut(), now_ms) {
                tracing::warn!(error = %e, "peer store flush failed");
            }
        }

        // Miner deadlines (soft-restart window, fake PoW cadence).
        self.miner.on_timer(now_ms);

        // Idle work once fast-sync is open.
        if self.controller.is_full_mode() && !self.deferred.is_empty() {
            self.drain_deferred(now_ms);
        }
    }

    /// The first task of `tok` timed out.
    fn on_request_timeout(&mut self, tok: PeerToken, now_ms: u64) {
        let addr = {
            let Some(peer) = self.peers.get_mut(&tok) else {
                return;
            };
            peer.request_deadline_ms = None;
            peer.addr
        };
        self.peer_mgr.penalize_slow(addr, now_ms);

        let only_task = self.tasks.assigned_count(tok) == 1;
        let key = self.tasks.release_first(tok);
        tracing::debug!(peer = %addr, ?key, only_task, "request timed out");
        if only_task {
            self.disconnect(tok, ByeReason::Timeout, false, now_ms);
        } else {
            self.rearm_request_timer(tok, now_ms);
        }
        self.try_assign_tasks(now_ms);
    }
}
