//! Peer address book: ratings, bans, activation scheduling, and persistence.
//!
//! Entries are keyed by socket address (a node id is attached once the peer
//! has authenticated). Every rating carries a wall-clock decay so that stale
//! reputation fades toward zero; candidate selection orders by the adjusted
//! value with a deterministic tie-break on the lowest node id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

use mist_types::NodeId;

use crate::error::NetworkError;

// ---------------------------------------------------------------------------
// Rating model
// ---------------------------------------------------------------------------

/// Starting rating of a freshly learned peer.
pub const RATING_INIT: u32 = 1024;
/// Rating ceiling.
pub const RATING_MAX: u32 = 10 * 1024;
/// Reward for a useful reply.
const REWARD_REPLY: u32 = 16;
/// Additional reward per KiB of delivered chain data.
const REWARD_PER_KIB: u32 = 1;
/// Penalty for a slow or timed-out request.
const PENALTY_SLOW: u32 = 128;
/// Adjusted-rating decay per hour since the last rating event.
const DECAY_PER_HOUR: u32 = 64;
/// Default ban length.
const BAN_DURATION_MS: u64 = 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// The persisted shape of an address-book entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfoRecord {
    pub node_id: Option<NodeId>,
    pub addr: SocketAddr,
    pub raw_rating: u32,
    pub last_rating_ms: u64,
    pub banned_until_ms: u64,
}

#[derive(Clone, Debug)]
struct PeerEntry {
    record: PeerInfoRecord,
    active: bool,
    /// Config-pinned peers: always redialed, never evicted or banned.
    persistent: bool,
}

impl PeerEntry {
    fn adjusted_rating(&self, now_ms: u64) -> u32 {
        let hours = now_ms.saturating_sub(self.record.last_rating_ms) / (60 * 60 * 1000);
        let decay = (hours as u32).saturating_mul(DECAY_PER_HOUR);
        self.record.raw_rating.saturating_sub(decay)
    }

    fn is_banned(&self, now_ms: u64) -> bool {
        !self.persistent && self.record.banned_until_ms > now_ms
    }
}

/// Storage collaborator the address book is flushed through.
pub trait PeerStore {
    fn load(&self) -> Result<Vec<PeerInfoRecord>, NetworkError>;
    fn save(&mut self, records: &[PeerInfoRecord]) -> Result<(), NetworkError>;
}

/// In-memory store, for tests and db-less runs.
#[derive(Default)]
pub struct MemPeerStore {
    records: Vec<PeerInfoRecord>,
}

impl PeerStore for MemPeerStore {
    fn load(&self) -> Result<Vec<PeerInfoRecord>, NetworkError> {
        Ok(self.records.clone())
    }

    fn save(&mut self, records: &[PeerInfoRecord]) -> Result<(), NetworkError> {
        self.records = records.to_vec();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Peer manager
// ---------------------------------------------------------------------------

pub struct PeerManager {
    entries: HashMap<SocketAddr, PeerEntry>,
    /// How many peers the node tries to keep active.
    target_active: usize,
    /// Upper bound on address-book size.
    max_entries: usize,
    update_period_ms: u64,
    flush_period_ms: u64,
    last_update_ms: Option<u64>,
    last_flush_ms: Option<u64>,
    num_active: usize,
}

impl PeerManager {
    pub fn new(
        target_active: usize,
        max_entries: usize,
        update_period_ms: u64,
        flush_period_ms: u64,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            target_active,
            max_entries,
            update_period_ms,
            flush_period_ms,
            last_update_ms: None,
            last_flush_ms: None,
            num_active: 0,
        }
    }

    // -- Learning addresses ------------------------------------------------

    /// Learn (or refresh) a peer address. New entries start at
    /// [`RATING_INIT`]; when the book is full the worst non-active entry is
    /// evicted first.
    pub fn add_peer(&mut self, addr: SocketAddr, node_id: Option<NodeId>, now_ms: u64) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if let Some(id) = node_id {
                entry.record.node_id = Some(id);
            }
            return;
        }

        if self.entries.len() >= self.max_entries && !self.evict_one(now_ms) {
            return;
        }

        self.entries.insert(
            addr,
            PeerEntry {
                record: PeerInfoRecord {
                    node_id,
                    addr,
                    raw_rating: RATING_INIT,
                    last_rating_ms: now_ms,
                    banned_until_ms: 0,
                },
                active: false,
                persistent: false,
            },
        );
    }

    /// Pin a peer from the config connect list: dialed forever, immune to
    /// eviction and bans.
    pub fn add_persistent(&mut self, addr: SocketAddr, now_ms: u64) {
        let entry = self.entries.entry(addr).or_insert(PeerEntry {
            record: PeerInfoRecord {
                node_id: None,
                addr,
                raw_rating: RATING_INIT,
                last_rating_ms: now_ms,
                banned_until_ms: 0,
            },
            active: false,
            persistent: false,
        });
        entry.persistent = true;
        entry.record.banned_until_ms = 0;
    }

    /// Drop the adjusted-rating-worst inactive, non-persistent entry.
    /// Returns false when nothing is evictable.
    fn evict_one(&mut self, now_ms: u64) -> bool {
        let victim = self
            .entries
            .values()
            .filter(|e| !e.active && !e.persistent)
            .min_by_key(|e| (e.adjusted_rating(now_ms), e.record.addr))
            .map(|e| e.record.addr);
        match victim {
            Some(addr) => {
                tracing::debug!(peer = %addr, "evicted worst peer to make room");
                self.entries.remove(&addr);
                true
            }
            None => false,
        }
    }

    // -- Activation --------------------------------------------------------

    /// Mark a peer as active (a connection is up or being dialed).
    pub fn mark_active(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if !entry.active {
                entry.active = true;
                self.num_active += 1;
            }
        }
    }

    /// Mark a peer inactive again (connection closed or dial failed).
    pub fn mark_inactive(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if entry.active {
                entry.active = false;
                self.num_active = self.num_active.saturating_sub(1);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.num_active
    }

    /// Number of known addresses, banned ones included.
    pub fn known_count(&self) -> usize {
        self.entries.len()
    }

    /// Periodic activation pass: while the active count is below target and
    /// candidates remain, emit dial orders best-candidate-first.
    ///
    /// Candidates are ordered by adjusted rating (descending); ties are
    /// broken by lowest node id, then address, so runs are reproducible.
    pub fn activate_more_peers(&mut self, now_ms: u64) -> Vec<SocketAddr> {
        match self.last_update_ms {
            Some(last) if now_ms.saturating_sub(last) < self.update_period_ms => return Vec::new(),
            _ => self.last_update_ms = Some(now_ms),
        }

        let want = self.target_active.saturating_sub(self.num_active);
        if want == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<&PeerEntry> = self
            .entries
            .values()
            .filter(|e| !e.active && !e.is_banned(now_ms))
            .collect();
        candidates.sort_by(|a, b| {
            b.adjusted_rating(now_ms)
                .cmp(&a.adjusted_rating(now_ms))
                .then_with(|| a.record.node_id.cmp(&b.record.node_id))
                .then_with(|| a.record.addr.cmp(&b.record.addr))
        });

        let picked: Vec<SocketAddr> = candidates
            .into_iter()
            .take(want)
            .map(|e| e.record.addr)
            .collect();
        for addr in &picked {
            self.mark_active(*addr);
        }
        picked
    }

    // -- Rating events -----------------------------------------------------

    /// A useful reply arrived.
    pub fn reward_reply(&mut self, addr: SocketAddr, now_ms: u64) {
        self.bump(addr, REWARD_REPLY as i64, now_ms);
    }

    /// Bulk chain data arrived; reward proportionally to size.
    pub fn reward_data(&mut self, addr: SocketAddr, bytes: usize, now_ms: u64) {
        let kib = (bytes / 1024).max(1) as i64;
        self.bump(addr, REWARD_REPLY as i64 + kib * REWARD_PER_KIB as i64, now_ms);
    }

    /// The peer was slow or timed out.
    pub fn penalize_slow(&mut self, addr: SocketAddr, now_ms: u64) {
        self.bump(addr, -(PENALTY_SLOW as i64), now_ms);
    }

    /// The peer served data that failed validation: rating floored and a
    /// time-limited ban imposed.
    pub fn penalize_bad_data(&mut self, addr: SocketAddr, now_ms: u64) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.record.raw_rating = 0;
            entry.record.last_rating_ms = now_ms;
        }
        self.ban(addr, now_ms);
    }

    fn bump(&mut self, addr: SocketAddr, delta: i64, now_ms: u64) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            // Fold the pending decay into the raw value before applying the
            // event, so the adjusted rating never jumps upward on an event.
            let current = entry.adjusted_rating(now_ms) as i64;
            entry.record.raw_rating = current.saturating_add(delta).clamp(0, RATING_MAX as i64) as u32;
            entry.record.last_rating_ms = now_ms;
        }
    }

    pub fn rating(&self, addr: SocketAddr, now_ms: u64) -> Option<u32> {
        self.entries.get(&addr).map(|e| e.adjusted_rating(now_ms))
    }

    // -- Bans --------------------------------------------------------------

    /// Ban a peer for the default duration. Persistent peers are exempt.
    pub fn ban(&mut self, addr: SocketAddr, now_ms: u64) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if entry.persistent {
                return;
            }
            entry.record.banned_until_ms = now_ms + BAN_DURATION_MS;
            tracing::info!(peer = %addr, until_ms = entry.record.banned_until_ms, "peer banned");
        }
    }

    pub fn is_banned(&self, addr: SocketAddr, now_ms: u64) -> bool {
        self.entries
            .get(&addr)
            .is_some_and(|e| e.is_banned(now_ms))
    }

    // -- Persistence -------------------------------------------------------

    /// Whether the periodic flush is due.
    pub fn should_flush(&self, now_ms: u64) -> bool {
        match self.last_flush_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.flush_period_ms,
        }
    }

    /// Snapshot all entries for the store and arm the next flush window.
    pub fn flush(&mut self, store: &mut dyn PeerStore, now_ms: u64) -> Result<(), NetworkError> {
        let mut records: Vec<PeerInfoRecord> =
            self.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.addr);
        store.save(&records)?;
        self.last_flush_ms = Some(now_ms);
        Ok(())
    }

    /// Repopulate the book from persisted records (startup).
    pub fn restore(&mut self, records: Vec<PeerInfoRecord>) {
        for record in records {
            let addr = record.addr;
            self.entries.entry(addr).or_insert(PeerEntry {
                record,
                active: false,
                persistent: false,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:31744").parse().unwrap()
    }

    fn manager() -> PeerManager {
        PeerManager::new(4, 16, 1000, 60_000)
    }

    #[test]
    fn new_peers_start_at_rating_init() {
        let mut pm = manager();
        pm.add_peer(addr(1), None, 0);
        assert_eq!(pm.rating(addr(1), 0), Some(RATING_INIT));
    }

    #[test]
    fn adjusted_rating_decays_toward_zero() {
        let mut pm = manager();
        pm.add_peer(addr(1), None, 0);
        let fresh = pm.rating(addr(1), 0).unwrap();
        let aged = pm.rating(addr(1), 10 * HOUR_MS).unwrap();
        assert!(aged < fresh);
        let ancient = pm.rating(addr(1), 10_000 * HOUR_MS).unwrap();
        assert_eq!(ancient, 0);
    }

    #[test]
    fn rewards_and_penalties_clamp() {
        let mut pm = manager();
        pm.add_peer(addr(1), None, 0);
        for _ in 0..10_000 {
            pm.reward_reply(addr(1), 0);
        }
        assert_eq!(pm.rating(addr(1), 0), Some(RATING_MAX));

        for _ in 0..10_000 {
            pm.penalize_slow(addr(1), 0);
        }
        assert_eq!(pm.rating(addr(1), 0), Some(0));
    }

    #[test]
    fn bad_data_floors_rating_and_bans() {
        let mut pm = manager();
        pm.add_peer(addr(1), None, 0);
        pm.penalize_bad_data(addr(1), 1000);
        assert_eq!(pm.rating(addr(1), 1000), Some(0));
        assert!(pm.is_banned(addr(1), 1000));
        assert!(pm.is_banned(addr(1), 1000 + BAN_DURATION_MS - 1));
        assert!(!pm.is_banned(addr(1), 1000 + BAN_DURATION_MS));
    }

    #[test]
    fn activation_respects_target_and_period() {
        let mut pm = manager();
        for i in 1..=8 {
            pm.add_peer(addr(i), None, 0);
        }
        let first = pm.activate_more_peers(0);
        assert_eq!(first.len(), 4);
        assert_eq!(pm.active_count(), 4);

        // Within the update period nothing more happens.
        assert!(pm.activate_more_peers(500).is_empty());

        // After one disconnects, the next tick refills.
        pm.mark_inactive(first[0]);
        let refill = pm.activate_more_peers(1500);
        assert_eq!(refill.len(), 1);
    }

    #[test]
    fn activation_prefers_higher_rating_then_lowest_id() {
        let mut pm = PeerManager::new(1, 16, 1000, 60_000);
        pm.add_peer(addr(1), Some(NodeId([9; 32])), 0);
        pm.add_peer(addr(2), Some(NodeId([1; 32])), 0);
        pm.add_peer(addr(3), Some(NodeId([5; 32])), 0);
        pm.reward_reply(addr(3), 0);

        // addr(3) has the best rating.
        assert_eq!(pm.activate_more_peers(0), vec![addr(3)]);

        pm.mark_inactive(addr(3));
        pm.ban(addr(3), 1000);
        // Remaining two tie on rating; lowest node id (addr 2) wins.
        assert_eq!(pm.activate_more_peers(2000), vec![addr(2)]);
    }

    #[test]
    fn banned_peers_are_not_activated() {
        let mut pm = PeerManager::new(4, 16, 1000, 60_000);
        pm.add_peer(addr(1), None, 0);
        pm.ban(addr(1), 0);
        assert!(pm.activate_more_peers(0).is_empty());

        // Ban expiry frees the candidate again.
        let later = BAN_DURATION_MS + 1000;
        assert_eq!(pm.activate_more_peers(later), vec![addr(1)]);
    }

    #[test]
    fn persistent_peers_ignore_bans_and_eviction() {
        let mut pm = PeerManager::new(4, 2, 1000, 60_000);
        pm.add_persistent(addr(1), 0);
        pm.ban(addr(1), 0);
        assert!(!pm.is_banned(addr(1), 0));

        pm.add_peer(addr(2), None, 0);
        pm.add_peer(addr(3), None, 0); // book full; addr(2) evicted, not addr(1)
        assert_eq!(pm.known_count(), 2);
        assert!(pm.rating(addr(1), 0).is_some());
    }

    #[test]
    fn flush_and_restore_reproduce_selection() {
        let mut pm = manager();
        for i in 1..=6 {
            pm.add_peer(addr(i), Some(NodeId([i; 32])), 0);
        }
        pm.reward_reply(addr(5), 0);
        pm.penalize_slow(addr(2), 0);

        let mut store = MemPeerStore::default();
        pm.flush(&mut store, 0).unwrap();

        let mut restored = manager();
        restored.restore(store.load().unwrap());

        assert_eq!(pm.activate_more_peers(1), restored.activate_more_peers(1));
    }

    #[test]
    fn flush_cadence() {
        let mut pm = manager();
        let mut store = MemPeerStore::default();
        assert!(pm.should_flush(0));
        pm.flush(&mut store, 0).unwrap();
        assert!(!pm.should_flush(59_999));
        assert!(pm.should_flush(60_000));
    }

    #[test]
    fn eviction_prefers_worst_inactive(){
        let mut pm = PeerManager::new(4, 2, 1000, 60_000);
        pm.add_peer(addr(1), None, 0);
        pm.add_peer(addr(2), None, 0);
        pm.penalize_slow(addr(2), 0);

        pm.add_peer(addr(3), None, 0);
        assert!(pm.rating(addr(2), 0).is_none());
        assert!(pm.rating(addr(1), 0).is_some());
        assert!(pm.rating(addr(3), 0).is_some());
    }
}
