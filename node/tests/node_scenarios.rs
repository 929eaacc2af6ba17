//! End-to-end reactor scenarios, driven deterministically through
//! `NodeCore` with the in-memory chain processor.

use std::net::SocketAddr;

use mist_chain::testing::MockProcessor;
use mist_miner::{MinerConfig, MinerDriver, MinerEvent};
use mist_network::MemPeerStore;
use mist_node::config::NodeConfig;
use mist_node::core::{NodeCore, Outbound, PeerToken};
use mist_node::validate::AcceptAllValidator;
use mist_pool::TxVerdict;
use mist_proto::messages::{self, Login, NodeMsg};
use mist_proto::{login_flags, IdType};
use mist_types::{
    BlockHash, ChainWork, Difficulty, Height, KernelId, NodeId, SystemState, Timestamp,
    Transaction, TxKernel, MAX_HEIGHT,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn hash_at(h: Height, branch: u8) -> BlockHash {
    let mut bytes = [branch; 32];
    bytes[..8].copy_from_slice(&h.to_le_bytes());
    BlockHash::new(bytes)
}

fn chain(from: Height, to: Height, branch: u8) -> Vec<SystemState> {
    let mut states = Vec::new();
    let mut prev = if from <= 1 {
        BlockHash::ZERO
    } else {
        hash_at(from - 1, branch)
    };
    for h in from..=to {
        let s = SystemState {
            height: h,
            prev,
            hash: hash_at(h, branch),
            definition: BlockHash::ZERO,
            chain_work: ChainWork((h as u128) * (1 + branch as u128)),
            difficulty: Difficulty(0),
            timestamp: Timestamp::new(h * 60),
        };
        prev = s.hash;
        states.push(s);
    }
    states
}

fn base_config() -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.dandelion.fluff_probability = 0;
    cfg.dandelion.dummy_lifetime_hi = 0; // keep test transactions unpadded
    cfg.bbs.pow_difficulty = 0;
    cfg
}

fn make_core(cfg: NodeConfig, processor: MockProcessor) -> NodeCore {
    // The receiver may drop: a disabled driver never posts solutions.
    let (miner_tx, _miner_rx) = std::sync::mpsc::channel();
    let miner = MinerDriver::new(
        MinerConfig {
            threads: 0,
            soft_restart_ms: cfg.timeout.mining_soft_restart_ms,
            fake_pow_solve_time_ms: None,
        },
        None,
        miner_tx,
    );
    NodeCore::new(
        cfg,
        Box::new(processor),
        Box::new(AcceptAllValidator),
        Box::new(MemPeerStore::default()),
        miner,
    )
}

fn addr(last: u8) -> SocketAddr {
    format!("10.0.0.{last}:31744").parse().unwrap()
}

fn connect(core: &mut NodeCore, last: u8, flags: u32, now: u64) -> PeerToken {
    let login = Login {
        flags,
        min_fork_height: 0,
    };
    let tok = core.on_peer_connected(
        addr(last),
        NodeId([last; 32]),
        &login,
        IdType::Node,
        false,
        now,
    );
    core.take_outbound();
    tok
}

fn announce_tip(core: &mut NodeCore, tok: PeerToken, state: SystemState, now: u64) {
    core.on_peer_msg(tok, messages::NewTip { state }.into(), now);
}

fn sends_to(out: &[Outbound], tok: PeerToken) -> Vec<&NodeMsg> {
    out.iter()
        .filter_map(|o| match o {
            Outbound::Send { to, msg } if *to == tok => Some(msg),
            _ => None,
        })
        .collect()
}

fn disconnected(out: &[Outbound], tok: PeerToken) -> bool {
    out.iter()
        .any(|o| matches!(o, Outbound::Disconnect { to, .. } if *to == tok))
}

fn tx_with(tag: u8, fee: u64) -> Transaction {
    Transaction {
        inputs: vec![],
        outputs: vec![],
        kernels: vec![TxKernel {
            id: KernelId::new([tag; 32]),
            fee,
            height_min: 0,
            height_max: MAX_HEIGHT,
        }],
    }
}

// ---------------------------------------------------------------------------
// Scenario: stem transactions fluff on embargo expiry
// ---------------------------------------------------------------------------

#[test]
fn stem_transaction_fluffs_after_embargo() {
    let mut processor = MockProcessor::new(60);
    processor.seed_chain(&chain(1, 3, 0));
    let mut core = make_core(base_config(), processor);
    core.controller.on_fast_sync_succeeded();

    let observer = connect(&mut core, 9, login_flags::SPREADING_TRANSACTIONS, 0);

    // FluffProbability is zero: the submission must take the stem route.
    let verdict = core.on_tx_submitted(tx_with(1, 1000), None, false, 1000);
    assert_eq!(verdict, TxVerdict::Ok);
    assert_eq!(core.stem.len(), 1);
    assert!(core.fluff.is_empty());

    // Before the embargo nothing is advertised to the observer.
    core.take_outbound();

    let embargo_at = core.stem.next_embargo_ms().unwrap();
    assert!((21_000..=51_000).contains(&embargo_at));

    // The aggregation tick may relay the stem tx, but it stays embargoed.
    core.on_timer(11_000);
    assert_eq!(core.stem.len(), 1);
    assert!(core.fluff.is_empty());
    core.take_outbound();

    core.on_timer(embargo_at);
    assert!(core.stem.is_empty());
    assert_eq!(core.fluff.len(), 1);

    let out = core.take_outbound();
    let adverts: Vec<_> = sends_to(&out, observer)
        .into_iter()
        .filter(|m| matches!(m, NodeMsg::HaveTransaction(_)))
        .collect();
    assert_eq!(adverts.len(), 1, "observer sees the fluffed transaction");
}

#[test]
fn resending_known_transaction_is_duplicate_and_silent() {
    let mut processor = MockProcessor::new(60);
    processor.seed_chain(&chain(1, 3, 0));
    let mut core = make_core(base_config(), processor);
    core.controller.on_fast_sync_succeeded();

    let peer = connect(&mut core, 9, login_flags::SPREADING_TRANSACTIONS, 0);

    assert_eq!(
        core.on_tx_submitted(tx_with(1, 1000), None, true, 0),
        TxVerdict::Ok
    );
    let out = core.take_outbound();
    assert_eq!(sends_to(&out, peer).len(), 1);

    assert_eq!(
        core.on_tx_submitted(tx_with(1, 1000), None, true, 10),
        TxVerdict::Duplicate
    );
    let out = core.take_outbound();
    assert!(sends_to(&out, peer).is_empty(), "no re-broadcast");
}

// ---------------------------------------------------------------------------
// Scenario: task reassignment on timeout
// ---------------------------------------------------------------------------

#[test]
fn body_task_reassigned_after_timeout_and_slow_peer_dropped() {
    let target = chain(1, 1, 0);
    let tip = *target.last().unwrap();

    let mut core = make_core(base_config(), MockProcessor::new(60));
    let p1 = connect(&mut core, 1, 0, 0);
    let p2 = connect(&mut core, 2, 0, 0);

    // P1 announces an unknown tip; the header task goes to P1.
    announce_tip(&mut core, p1, tip, 100);
    announce_tip(&mut core, p2, tip, 100);
    let out = core.take_outbound();
    assert!(sends_to(&out, p1)
        .iter()
        .any(|m| matches!(m, NodeMsg::GetHdrPack(_))));

    // P1 delivers the headers; a body task emerges and goes back to P1
    // (its rating rose when it served the pack).
    core.on_peer_msg(p1, messages::HdrPack { states: target }.into(), 200);
    let out = core.take_outbound();
    assert!(sends_to(&out, p1)
        .iter()
        .any(|m| matches!(m, NodeMsg::GetBody(_))));
    assert_eq!(core.tasks.assigned_count(p1), 1);

    // P1 stalls. At GetBlock_ms the task is released; since it was P1's
    // only task the peer is disconnected, and the task lands on P2.
    core.on_timer(200 + 30_000);
    let out = core.take_outbound();
    assert!(disconnected(&out, p1));
    assert!(sends_to(&out, p2)
        .iter()
        .any(|m| matches!(m, NodeMsg::GetBody(_))));
    assert_eq!(core.tasks.assigned_count(p2), 1);

    // P2 delivers; the task is satisfied and the chain advances.
    core.on_peer_msg(
        p2,
        messages::Body {
            body: messages::BodyBuffers::default(),
        }
        .into(),
        200 + 30_100,
    );
    assert!(core.tasks.is_empty());
    assert_eq!(core.processor.tip().unwrap().height, 1);

    // Once validated, the data is never re-requested.
    announce_tip(&mut core, p2, tip, 200 + 30_200);
    assert!(core.tasks.is_empty());
}

#[test]
fn data_missing_reassigns_without_dropping_the_peer() {
    let target = chain(1, 1, 0);
    let tip = *target.last().unwrap();

    let mut core = make_core(base_config(), MockProcessor::new(60));
    let p1 = connect(&mut core, 1, 0, 0);
    let p2 = connect(&mut core, 2, 0, 0);
    announce_tip(&mut core, p1, tip, 100);
    announce_tip(&mut core, p2, tip, 100);
    core.on_peer_msg(p1, messages::HdrPack { states: target }.into(), 200);
    core.take_outbound();
    assert_eq!(core.tasks.assigned_count(p1), 1);

    core.on_peer_msg(p1, messages::DataMissing.into(), 300);
    let out = core.take_outbound();
    assert!(!disconnected(&out, p1));
    assert!(sends_to(&out, p2)
        .iter()
        .any(|m| matches!(m, NodeMsg::GetBody(_))));

    // The refused key is remembered until P1 announces a new tip.
    let key = core.tasks.first_task(p2).unwrap().key;
    assert!(core.peers[&p1].rejected.contains(&key));
    announce_tip(&mut core, p1, tip, 400);
    assert!(core.peers[&p1].rejected.is_empty());
}

// ---------------------------------------------------------------------------
// Scenario: mined blocks flow through the normal intake
// ---------------------------------------------------------------------------

#[test]
fn fake_pow_produces_blocks_on_cadence() {
    let mut processor = MockProcessor::new(60);
    processor.seed_chain(&chain(1, 2, 0));

    let cfg = base_config();
    let (miner_tx, miner_rx) = std::sync::mpsc::channel();
    let miner = MinerDriver::new(
        MinerConfig {
            threads: 0,
            soft_restart_ms: 1000,
            fake_pow_solve_time_ms: Some(15_000),
        },
        None,
        miner_tx,
    );
    let mut core = NodeCore::new(
        cfg,
        Box::new(processor),
        Box::new(AcceptAllValidator),
        Box::new(MemPeerStore::default()),
        miner,
    );
    core.controller.on_fast_sync_succeeded();
    let watcher = connect(&mut core, 5, 0, 0);
    core.take_outbound();

    core.update_miner_template(1000);
    assert_eq!(core.miner.next_wakeup_ms(), Some(16_000));

    core.on_timer(16_000);
    let solved: Vec<MinerEvent> = miner_rx.try_iter().collect();
    assert_eq!(solved.len(), 1);
    for ev in solved {
        core.on_miner_event(ev, 16_001);
    }
    assert_eq!(core.processor.tip().unwrap().height, 3);

    // The freshly mined tip is announced to peers.
    let out = core.take_outbound();
    assert!(sends_to(&out, watcher)
        .iter()
        .any(|m| matches!(m, NodeMsg::NewTip(_))));
}

// ---------------------------------------------------------------------------
// Scenario: rollback ceiling
// ---------------------------------------------------------------------------

#[test]
fn rollback_beyond_ceiling_waits_for_tip_age() {
    let mut processor = MockProcessor::new(120);
    processor.seed_chain(&chain(1, 100, 0));
    // Heavier fork at depth 70: beyond the configured ceiling of 60.
    processor.seed_competing_branch(30, chain(31, 170, 1));

    let mut core = make_core(base_config(), processor);

    // The go-up pass armed at startup refuses the deep reorg.
    core.on_timer(10);
    assert_eq!(core.processor.tip().unwrap().height, 100);

    // An hour of stale tip later, the wider allowance applies. The tip
    // has not moved, so re-announcing it arms another pass without
    // resetting the tip age.
    let later = 3_601_000;
    let tip = core.processor.tip().unwrap();
    core.controller.on_new_state(tip, later);
    core.on_timer(later + 10_000);
    assert_eq!(core.processor.tip().unwrap().height, 170);
}

// ---------------------------------------------------------------------------
// Scenario: fast-sync gate and deferred drain
// ---------------------------------------------------------------------------

#[test]
fn transactions_defer_until_fast_sync_then_drain_in_order() {
    let mut processor = MockProcessor::new(60);
    processor.seed_chain(&chain(1, 3, 0));
    let mut core = make_core(base_config(), processor);

    assert_eq!(
        core.on_tx_submitted(tx_with(1, 1000), None, false, 0),
        TxVerdict::Ok
    );
    assert_eq!(
        core.on_tx_submitted(tx_with(2, 1000), None, false, 1),
        TxVerdict::Ok
    );
    assert_eq!(core.deferred.len(), 2);
    assert_eq!(core.stem.len(), 0);

    core.controller.on_fast_sync_succeeded();
    core.on_timer(100);
    assert_eq!(core.deferred.len(), 0);
    assert_eq!(core.stem.len(), 2, "deferred drained into the stem pool");
}

// ---------------------------------------------------------------------------
// Scenario: backpressure boundaries
// ---------------------------------------------------------------------------

#[test]
fn choking_stalls_fluff_broadcast_until_drain() {
    // No seeded chain: the connect greeting must not pre-fill the queue.
    let mut cfg = base_config();
    cfg.bandwidth.choking = 30; // one HaveTransaction frame crosses this
    cfg.bandwidth.drown = 1 << 20;
    let mut core = make_core(cfg, MockProcessor::new(60));
    core.controller.on_fast_sync_succeeded();

    let peer = connect(&mut core, 9, login_flags::SPREADING_TRANSACTIONS, 0);

    assert_eq!(
        core.on_tx_submitted(tx_with(1, 1000), None, true, 0),
        TxVerdict::Ok
    );
    let out = core.take_outbound();
    assert_eq!(sends_to(&out, peer).len(), 1);
    assert!(core.peers[&peer].send_queue.is_choking());

    // A second fluff while choked: the advert is withheld.
    assert_eq!(
        core.on_tx_submitted(tx_with(2, 1000), None, true, 10),
        TxVerdict::Ok
    );
    let out = core.take_outbound();
    assert!(sends_to(&out, peer).is_empty());

    // Draining resumes the cursor walk.
    let pending = core.peers[&peer].send_queue.pending_bytes();
    core.on_peer_drained(peer, pending, 20);
    let out = core.take_outbound();
    assert_eq!(sends_to(&out, peer).len(), 1);
}

#[test]
fn drown_threshold_drops_the_peer() {
    // No seeded chain: the greeting would hit the tiny threshold alone.
    let mut cfg = base_config();
    cfg.bandwidth.choking = 4;
    cfg.bandwidth.drown = 8;
    let mut core = make_core(cfg, MockProcessor::new(60));
    core.controller.on_fast_sync_succeeded();

    let peer = connect(&mut core, 9, 0, 0);

    // Pongs are essential traffic and ignore choking; each is a 2-byte
    // frame, so a handful pushes pending bytes across the drown line.
    for t in 0..5u64 {
        core.on_peer_msg(peer, messages::Ping.into(), t);
    }
    let out = core.take_outbound();
    assert!(disconnected(&out, peer));
    assert!(!core.peers.contains_key(&peer));
}

// ---------------------------------------------------------------------------
// Scenario: BBS relay and cleanup
// ---------------------------------------------------------------------------

#[test]
fn bbs_message_forwards_to_subscribers_and_advertises_to_others() {
    let mut processor = MockProcessor::new(60);
    processor.seed_chain(&chain(1, 3, 0));
    let mut core = make_core(base_config(), processor);

    let poster = connect(&mut core, 1, login_flags::BBS, 0);
    let subscriber = connect(&mut core, 2, login_flags::BBS, 0);
    let bystander = connect(&mut core, 3, login_flags::BBS, 0);

    core.on_peer_msg(
        subscriber,
        messages::BbsSubscribe {
            channel: 7,
            time_from: Timestamp::new(0),
            on: true,
        }
        .into(),
        100,
    );
    core.take_outbound();

    let now_ms = 1_700_000_000_000u64;
    core.on_peer_msg(
        poster,
        messages::BbsMsg {
            channel: 7,
            time_posted: Timestamp::new(now_ms / 1000),
            payload: b"hello channel".to_vec(),
            nonce: 0,
        }
        .into(),
        now_ms,
    );
    let out = core.take_outbound();
    assert!(sends_to(&out, subscriber)
        .iter()
        .any(|m| matches!(m, NodeMsg::BbsMsg(_))));
    assert!(sends_to(&out, bystander)
        .iter()
        .any(|m| matches!(m, NodeMsg::BbsHaveMsg(_))));
    assert!(sends_to(&out, poster).is_empty(), "sender is excluded");
}

#[test]
fn bbs_cap_evicts_oldest_message() {
    let mut processor = MockProcessor::new(60);
    processor.seed_chain(&chain(1, 3, 0));
    let mut cfg = base_config();
    cfg.bbs.limit_count = 2;
    let mut core = make_core(cfg, processor);
    let poster = connect(&mut core, 1, login_flags::BBS, 0);

    let base_s = 1_700_000_000u64;
    for (i, body) in [&b"one"[..], &b"two"[..], &b"three"[..]].iter().enumerate() {
        core.on_peer_msg(
            poster,
            messages::BbsMsg {
                channel: 1,
                time_posted: Timestamp::new(base_s + i as u64),
                payload: body.to_vec(),
                nonce: 0,
            }
            .into(),
            base_s * 1000 + i as u64,
        );
    }
    let (count, _) = core.bbs.totals();
    assert_eq!(count, 2);
    // The oldest is gone, the newest two remain.
    let oldest = mist_bbs::store::msg_id(1, Timestamp::new(base_s), b"one", 0);
    let newest = mist_bbs::store::msg_id(1, Timestamp::new(base_s + 2), b"three", 0);
    assert!(!core.bbs.contains(&oldest));
    assert!(core.bbs.contains(&newest));
}
