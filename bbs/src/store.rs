//! The message bank behind the BBS.
//!
//! Messages are owned by the id map; the `(channel, time, id)` index serves
//! subscriber enumeration and the global `(time, id)` index drives eviction.
//! All three are maintained through one removal helper.

use std::collections::{BTreeSet, HashMap};

use mist_crypto::blake2b_256_multi;
use mist_types::{Difficulty, MsgId, Timestamp};

/// Largest accepted message payload.
pub const MAX_MSG_SIZE: usize = 1024 * 1024;

/// How far into the future a message timestamp may point.
const TIME_AHEAD_MAX_S: u64 = 15 * 60;

#[derive(Clone, Debug)]
pub struct BbsConfig {
    /// Message retention, seconds. Default 12 hours.
    pub message_timeout_s: u64,
    /// Global message-count cap.
    pub limit_count: u64,
    /// Global byte-size cap (payload bytes).
    pub limit_size: u64,
    /// Cleanup cadence, milliseconds. Default 1 hour.
    pub cleanup_period_ms: u64,
    /// Proof-of-work bits demanded of every message id.
    pub pow_difficulty: u32,
}

impl Default for BbsConfig {
    fn default() -> Self {
        Self {
            message_timeout_s: 12 * 3600,
            limit_count: 20_000_000,
            limit_size: 5 * 1024 * 1024 * 1024,
            cleanup_period_ms: 3600 * 1000,
            pow_difficulty: 8,
        }
    }
}

impl BbsConfig {
    /// BBS replication is disabled by zeroing the count cap.
    pub fn is_enabled(&self) -> bool {
        self.limit_count > 0
    }

    /// Difficulty demanded on `channel`. Uniform for now; the per-channel
    /// knob exists so popular channels can be made more expensive later.
    pub fn channel_difficulty(&self, _channel: u32) -> Difficulty {
        Difficulty(self.pow_difficulty)
    }
}

#[derive(Clone, Debug)]
pub struct StoredMsg {
    pub id: MsgId,
    pub channel: u32,
    pub time_posted: Timestamp,
    pub payload: Vec<u8>,
    pub nonce: u64,
}

/// Outcome of posting a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BbsAdmit {
    Stored { id: MsgId },
    Duplicate { id: MsgId },
    TooLarge,
    TimeOutOfRange,
    PowInvalid,
}

/// Compute a message id: the digest of everything including the nonce, so
/// grinding the nonce is exactly the proof of work.
pub fn msg_id(channel: u32, time_posted: Timestamp, payload: &[u8], nonce: u64) -> MsgId {
    MsgId::new(blake2b_256_multi(&[
        &channel.to_le_bytes(),
        &time_posted.secs().to_le_bytes(),
        payload,
        &nonce.to_le_bytes(),
    ]))
}

pub struct BbsStore {
    cfg: BbsConfig,
    by_id: HashMap<MsgId, StoredMsg>,
    by_channel_time: BTreeSet<(u32, Timestamp, MsgId)>,
    by_time: BTreeSet<(Timestamp, MsgId)>,
    total_size: u64,
    last_cleanup_ms: Option<u64>,
    /// Subscriptions, maintained symmetrically in both directions so a
    /// disconnecting peer can be detached in one call.
    subs_by_channel: HashMap<u32, BTreeSet<u64>>,
    subs_by_peer: HashMap<u64, HashMap<u32, Timestamp>>,
}

impl BbsStore {
    pub fn new(cfg: BbsConfig) -> Self {
        Self {
            cfg,
            by_id: HashMap::new(),
            by_channel_time: BTreeSet::new(),
            by_time: BTreeSet::new(),
            total_size: 0,
            last_cleanup_ms: None,
            subs_by_channel: HashMap::new(),
            subs_by_peer: HashMap::new(),
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.by_id.len() as u64, self.total_size)
    }

    pub fn is_in_limits(&self) -> bool {
        let (count, size) = self.totals();
        count <= self.cfg.limit_count && size <= self.cfg.limit_size
    }

    // -- Posting -----------------------------------------------------------

    /// Validate and store a message. `now_s` is the node's wall clock.
    pub fn post(
        &mut self,
        channel: u32,
        time_posted: Timestamp,
        payload: Vec<u8>,
        nonce: u64,
        now_s: u64,
    ) -> BbsAdmit {
        if payload.len() > MAX_MSG_SIZE {
            return BbsAdmit::TooLarge;
        }
        let t = time_posted.secs();
        if t + self.cfg.message_timeout_s <= now_s || t > now_s + TIME_AHEAD_MAX_S {
            return BbsAdmit::TimeOutOfRange;
        }

        let id = msg_id(channel, time_posted, &payload, nonce);
        if !self
            .cfg
            .channel_difficulty(channel)
            .is_met(id.as_bytes())
        {
            return BbsAdmit::PowInvalid;
        }
        if self.by_id.contains_key(&id) {
            return BbsAdmit::Duplicate { id };
        }

        self.total_size += payload.len() as u64;
        self.by_channel_time.insert((channel, time_posted, id));
        self.by_time.insert((time_posted, id));
        self.by_id.insert(
            id,
            StoredMsg {
                id,
                channel,
                time_posted,
                payload,
                nonce,
            },
        );

        // Cap crossing triggers an immediate partial cleanup.
        if !self.is_in_limits() {
            self.evict_until_in_limits();
        }
        BbsAdmit::Stored { id }
    }

    pub fn get(&self, id: &MsgId) -> Option<&StoredMsg> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &MsgId) -> bool {
        self.by_id.contains_key(id)
    }

    fn remove(&mut self, id: MsgId) {
        if let Some(msg) = self.by_id.remove(&id) {
            self.by_channel_time
                .remove(&(msg.channel, msg.time_posted, id));
            self.by_time.remove(&(msg.time_posted, id));
            self.total_size -= msg.payload.len() as u64;
        }
    }

    // -- Synchronization ---------------------------------------------------

    /// Messages on `channel` strictly newer than `after`, in `(time, id)`
    /// order, up to `limit`.
    pub fn enum_after(&self, channel: u32, after: Timestamp, limit: usize) -> Vec<MsgId> {
        let lo = (channel, Timestamp::new(after.secs() + 1), MsgId::ZERO);
        self.by_channel_time
            .range(lo..)
            .take_while(|(c, _, _)| *c == channel)
            .take(limit)
            .map(|(_, _, id)| *id)
            .collect()
    }

    // -- Subscriptions -----------------------------------------------------

    /// Subscribe (`on = true`) or unsubscribe a peer token from a channel.
    /// `time_from` seeds the peer's sync cursor for the channel.
    pub fn subscribe(&mut self, peer: u64, channel: u32, time_from: Timestamp, on: bool) {
        if on {
            self.subs_by_channel.entry(channel).or_default().insert(peer);
            self.subs_by_peer
                .entry(peer)
                .or_default()
                .insert(channel, time_from);
        } else {
            if let Some(peers) = self.subs_by_channel.get_mut(&channel) {
                peers.remove(&peer);
                if peers.is_empty() {
                    self.subs_by_channel.remove(&channel);
                }
            }
            if let Some(channels) = self.subs_by_peer.get_mut(&peer) {
                channels.remove(&channel);
                if channels.is_empty() {
                    self.subs_by_peer.remove(&peer);
                }
            }
        }
    }

    /// Detach every subscription of a disconnecting peer.
    pub fn unsubscribe_all(&mut self, peer: u64) {
        if let Some(channels) = self.subs_by_peer.remove(&peer) {
            for (channel, _) in channels {
                if let Some(peers) = self.subs_by_channel.get_mut(&channel) {
                    peers.remove(&peer);
                    if peers.is_empty() {
                        self.subs_by_channel.remove(&channel);
                    }
                }
            }
        }
    }

    /// Peer tokens subscribed to `channel`, in token order.
    pub fn subscribers(&self, channel: u32) -> Vec<u64> {
        self.subs_by_channel
            .get(&channel)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn cursor(&self, peer: u64, channel: u32) -> Option<Timestamp> {
        self.subs_by_peer.get(&peer)?.get(&channel).copied()
    }

    /// Advance a peer's cursor after it acknowledged messages up to `t`.
    /// Cursors only move forward; `BbsResetSync` rewinds via re-subscribe.
    pub fn advance_cursor(&mut self, peer: u64, channel: u32, t: Timestamp) {
        if let Some(channels) = self.subs_by_peer.get_mut(&peer) {
            if let Some(cursor) = channels.get_mut(&channel) {
                if t > *cursor {
                    *cursor = t;
                }
            }
        }
    }

    /// Rewind every cursor of `peer` to `time_from` (`BbsResetSync`).
    pub fn reset_sync(&mut self, peer: u64, time_from: Timestamp) {
        if let Some(channels) = self.subs_by_peer.get_mut(&peer) {
            for cursor in channels.values_mut() {
                *cursor = time_from;
            }
        }
    }

    /// Channels `peer` is subscribed to.
    pub fn peer_channels(&self, peer: u64) -> Vec<u32> {
        self.subs_by_peer
            .get(&peer)
            .map(|m| {
                let mut v: Vec<u32> = m.keys().copied().collect();
                v.sort_unstable();
                v
            })
            .unwrap_or_default()
    }

    // -- Cleanup -----------------------------------------------------------

    /// Periodic tick: runs a full cleanup when the cadence elapsed.
    /// Returns the number of evicted messages.
    pub fn maybe_cleanup(&mut self, now_ms: u64) -> usize {
        let due = match self.last_cleanup_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.cfg.cleanup_period_ms,
        };
        if !due && self.is_in_limits() {
            return 0;
        }
        self.cleanup(now_ms)
    }

    /// Evict expired messages, then the oldest until both caps hold.
    pub fn cleanup(&mut self, now_ms: u64) -> usize {
        self.last_cleanup_ms = Some(now_ms);
        let now_s = now_ms / 1000;
        let cutoff = Timestamp::new(now_s.saturating_sub(self.cfg.message_timeout_s));

        let mut evicted = 0;
        let expired: Vec<MsgId> = self
            .by_time
            .iter()
            .take_while(|(t, _)| *t <= cutoff)
            .map(|(_, id)| *id)
            .collect();
        for id in expired {
            self.remove(id);
            evicted += 1;
        }
        evicted += self.evict_until_in_limits();
        if evicted > 0 {
            let (count, size) = self.totals();
            tracing::debug!(evicted, count, size, "bbs cleanup");
        }
        evicted
    }

    fn evict_until_in_limits(&mut self) -> usize {
        let mut evicted = 0;
        while !self.is_in_limits() {
            let oldest = match self.by_time.iter().next() {
                Some((_, id)) => *id,
                None => break,
            };
            self.remove(oldest);
            evicted += 1;
        }
        evicted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
