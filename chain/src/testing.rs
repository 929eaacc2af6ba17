//! A hand-rolled in-memory `ChainProcessor` for tests.
//!
//! Follows the chaining and verdict contract of the real processor closely
//! enough for node-level scenarios: header packs must chain, each accepted
//! header demands its body, bodies complete heights in order, and a seeded
//! competing branch exercises the rollback policy. A body whose eternal
//! part equals `b"invalid"` fails validation and flags the sender insane.

use std::collections::HashMap;

use mist_types::{BlockId, Height, NodeId, SystemState};

use crate::error::ChainError;
use crate::processor::{ChainProcessor, DataRequest, DataStatus, ProcessorEvent, ProofQuery};

pub struct MockProcessor {
    headers: HashMap<BlockId, SystemState>,
    bodies: HashMap<BlockId, (Vec<u8>, Vec<u8>)>,
    tip: Option<SystemState>,
    /// Highest chained header: bodies are demanded up to here.
    best_header: Option<SystemState>,
    competing: Option<(Height, Vec<SystemState>)>,
    fast_sync: bool,
    rules_max_rollback: Height,
    pub flush_count: usize,
    pub accepted_headers: Vec<BlockId>,
    pub accepted_bodies: Vec<BlockId>,
}

impl MockProcessor {
    pub fn new(rules_max_rollback: Height) -> Self {
        Self {
            headers: HashMap::new(),
            bodies: HashMap::new(),
            tip: None,
            best_header: None,
            competing: None,
            fast_sync: false,
            rules_max_rollback,
            flush_count: 0,
            accepted_headers: Vec::new(),
            accepted_bodies: Vec::new(),
        }
    }

    /// Adopt a chain wholesale (genesis bootstrap for tests). Headers and
    /// empty bodies become servable; the last state becomes the tip.
    pub fn seed_chain(&mut self, states: &[SystemState]) {
        for s in states {
            self.headers.insert(s.id(), *s);
            self.bodies.insert(s.id(), (Vec::new(), Vec::new()));
        }
        self.tip = states.last().copied();
        self.best_header = self.tip;
    }

    /// Present a competing branch forking at `fork_height`; `try_go_up`
    /// will consider switching to it under the rollback allowance.
    pub fn seed_competing_branch(&mut self, fork_height: Height, branch: Vec<SystemState>) {
        self.competing = Some((fork_height, branch));
    }

    pub fn set_fast_sync(&mut self, on: bool) {
        self.fast_sync = on;
    }

    pub fn tip_id(&self) -> Option<BlockId> {
        self.tip.map(|t| t.id())
    }
}

impl ChainProcessor for MockProcessor {
    fn tip(&self) -> Option<SystemState> {
        self.tip
    }

    fn rules_max_rollback(&self) -> Height {
        self.rules_max_rollback
    }

    fn is_fast_sync(&self) -> bool {
        self.fast_sync
    }

    fn fast_sync_horizons(&self) -> (Height, Height) {
        (0, 0)
    }

    fn on_header_pack(
        &mut self,
        states: &[SystemState],
        _from: NodeId,
    ) -> (DataStatus, Vec<ProcessorEvent>) {
        if states.is_empty() {
            return (DataStatus::Invalid, Vec::new());
        }
        for pair in states.windows(2) {
            if !pair[1].is_valid_successor_of(&pair[0]) {
                return (DataStatus::Invalid, Vec::new());
            }
        }
        // Strict chaining: the pack must attach to something we know,
        // unless it starts at genesis.
        let first = &states[0];
        let attached = first.height == 1
            || self
                .headers
                .values()
                .any(|s| s.hash == first.prev && s.height + 1 == first.height);
        if !attached {
            return (DataStatus::Unreachable, Vec::new());
        }

        let mut events = Vec::new();
        let mut fresh = false;
        for s in states {
            if self.headers.insert(s.id(), *s).is_none() {
                fresh = true;
                self.accepted_headers.push(s.id());
                if !self.bodies.contains_key(&s.id()) {
                    events.push(ProcessorEvent::RequestData(DataRequest {
                        id: s.id(),
                        is_body: true,
                        target: states.last().expect("non-empty").id(),
                    }));
                }
            }
        }
        if !fresh {
            return (DataStatus::Rejected, Vec::new());
        }

        let last = states.last().expect("non-empty");
        if self
            .best_header
            .map(|b| last.chain_work > b.chain_work)
            .unwrap_or(true)
        {
            self.best_header = Some(*last);
        }
        events.push(ProcessorEvent::Modified);
        (DataStatus::Accepted, events)
    }

    fn on_body(
        &mut self,
        id: &BlockId,
        perishable: &[u8],
        eternal: &[u8],
        from: NodeId,
    ) -> (DataStatus, Vec<ProcessorEvent>) {
        if eternal == b"invalid" {
            return (DataStatus::Invalid, vec![ProcessorEvent::PeerInsane(from)]);
        }
        if !self.headers.contains_key(id) {
            return (DataStatus::Unreachable, Vec::new());
        }
        if self.bodies.contains_key(id) {
            return (DataStatus::Rejected, Vec::new());
        }
        self.bodies.insert(*id, (perishable.to_vec(), eternal.to_vec()));
        self.accepted_bodies.push(*id);

        let mut events = vec![ProcessorEvent::Modified];
        let next_height = self.tip.map(|t| t.height + 1).unwrap_or(1);
        if id.height == next_height {
            self.tip = Some(self.headers[id]);
            events.push(ProcessorEvent::NewState);
        }
        (DataStatus::Accepted, events)
    }

    fn try_go_up(&mut self, max_rollback: Height) -> Vec<ProcessorEvent> {
        let mut events = Vec::new();

        // Branch switch first, if a heavier fork is on offer.
        if let Some((fork_height, branch)) = self.competing.clone() {
            let better = match (self.tip, branch.last()) {
                (Some(tip), Some(end)) => end.chain_work > tip.chain_work,
                (None, Some(_)) => true,
                _ => false,
            };
            if better {
                let depth = self.tip.map(|t| t.height.saturating_sub(fork_height)).unwrap_or(0);
                if depth <= max_rollback {
                    for s in &branch {
                        self.headers.insert(s.id(), *s);
                        self.bodies.insert(s.id(), (Vec::new(), Vec::new()));
                    }
                    self.tip = branch.last().copied();
                    self.best_header = self.tip;
                    self.competing = None;
                    events.push(ProcessorEvent::RolledBack(BlockId {
                        height: fork_height,
                        hash: branch[0].prev,
                    }));
                    events.push(ProcessorEvent::NewState);
                    events.push(ProcessorEvent::Modified);
                    return events;
                }
            }
        }

        // Otherwise walk upward through completed heights.
        loop {
            let next_height = self.tip.map(|t| t.height + 1).unwrap_or(1);
            let next = self
                .headers
                .values()
                .find(|s| {
                    s.height == next_height
                        && self.bodies.contains_key(&s.id())
                        && self.tip.map(|t| s.prev == t.hash).unwrap_or(true)
                })
                .copied();
            match next {
                Some(s) => {
                    self.tip = Some(s);
                    events.push(ProcessorEvent::NewState);
                }
                None => break,
            }
        }
        events
    }

    fn enum_congestions(&mut self) -> Vec<DataRequest> {
        let target = match self.best_header {
            Some(b) => b.id(),
            None => return Vec::new(),
        };
        let mut missing: Vec<DataRequest> = self
            .headers
            .values()
            .filter(|s| !self.bodies.contains_key(&s.id()))
            .map(|s| DataRequest {
                id: s.id(),
                is_body: true,
                target,
            })
            .collect();
        missing.sort_by_key(|r| r.id);
        missing
    }

    fn flush(&mut self) -> Result<(), ChainError> {
        self.flush_count += 1;
        Ok(())
    }

    fn get_header(&self, id: &BlockId) -> Option<SystemState> {
        self.headers.get(id).copied()
    }

    fn get_header_pack(&self, top: &BlockId, count: u32) -> Vec<SystemState> {
        let mut states = Vec::new();
        let mut cursor = match self.headers.get(top) {
            Some(s) => *s,
            None => return states,
        };
        states.push(cursor);
        while (states.len() as u32) < count {
            let parent = self
                .headers
                .values()
                .find(|s| s.hash == cursor.prev && s.height + 1 == cursor.height)
                .copied();
            match parent {
                Some(p) => {
                    states.push(p);
                    cursor = p;
                }
                None => break,
            }
        }
        states.reverse();
        states
    }

    fn get_body(&self, id: &BlockId) -> Option<(Vec<u8>, Vec<u8>)> {
        self.bodies.get(id).cloned()
    }

    fn get_proof(&self, query: &ProofQuery) -> Option<Vec<u8>> {
        match query {
            ProofQuery::ChainWork => self.tip.map(|t| t.chain_work.0.to_le_bytes().to_vec()),
            ProofQuery::State(h) if *h <= self.tip.map(|t| t.height).unwrap_or(0) => {
                Some(h.to_le_bytes().to_vec())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_types::{BlockHash, ChainWork, Difficulty, Timestamp};

    pub fn chain(from: Height, to: Height, branch: u8) -> Vec<SystemState> {
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
                difficulty: Difficulty(8),
                timestamp: Timestamp::new(h * 60),
            };
            prev = s.hash;
            states.push(s);
        }
        states
    }

    fn hash_at(h: Height, branch: u8) -> BlockHash {
        let mut bytes = [branch; 32];
        bytes[..8].copy_from_slice(&h.to_le_bytes());
        BlockHash::new(bytes)
    }

    #[test]
    fn header_pack_must_chain() {
        let mut p = MockProcessor::new(60);
        let mut states = chain(1, 3, 0);
        states[2].prev = BlockHash::new([0xEE; 32]);
        let (status, _) = p.on_header_pack(&states, NodeId::ZERO);
        assert_eq!(status, DataStatus::Invalid);
    }

    #[test]
    fn detached_pack_is_unreachable() {
        let mut p = MockProcessor::new(60);
        let states = chain(10, 12, 0);
        let (status, _) = p.on_header_pack(&states, NodeId::ZERO);
        assert_eq!(status, DataStatus::Unreachable);
    }

    #[test]
    fn bodies_advance_the_tip_in_order() {
        let mut p = MockProcessor::new(60);
        let states = chain(1, 3, 0);
        let (status, events) = p.on_header_pack(&states, NodeId::ZERO);
        assert_eq!(status, DataStatus::Accepted);
        let requests: Vec<&ProcessorEvent> = events
            .iter()
            .filter(|e| matches!(e, ProcessorEvent::RequestData(_)))
            .collect();
        assert_eq!(requests.len(), 3);

        let (s, ev) = p.on_body(&states[0].id(), b"", b"", NodeId::ZERO);
        assert_eq!(s, DataStatus::Accepted);
        assert!(ev.contains(&ProcessorEvent::NewState));
        assert_eq!(p.tip().unwrap().height, 1);

        // Height 3 before height 2: stored but tip holds.
        p.on_body(&states[2].id(), b"", b"", NodeId::ZERO);
        assert_eq!(p.tip().unwrap().height, 1);

        p.on_body(&states[1].id(), b"", b"", NodeId::ZERO);
        assert_eq!(p.tip().unwrap().height, 2);
        let events = p.try_go_up(60);
        assert_eq!(events, vec![ProcessorEvent::NewState]);
        assert_eq!(p.tip().unwrap().height, 3);
    }

    #[test]
    fn invalid_body_flags_the_sender() {
        let mut p = MockProcessor::new(60);
        let states = chain(1, 1, 0);
        p.on_header_pack(&states, NodeId::ZERO);
        let peer = NodeId([7; 32]);
        let (status, events) = p.on_body(&states[0].id(), b"", b"invalid", peer);
        assert_eq!(status, DataStatus::Invalid);
        assert_eq!(events, vec![ProcessorEvent::PeerInsane(peer)]);
    }

    #[test]
    fn competing_branch_respects_rollback_allowance() {
        let mut p = MockProcessor::new(120);
        p.seed_chain(&chain(1, 100, 0));
        // Fork at 30, heavier branch up to 170: depth 70.
        p.seed_competing_branch(30, chain(31, 170, 1));

        assert!(p.try_go_up(60).is_empty());
        assert_eq!(p.tip().unwrap().height, 100);

        let events = p.try_go_up(120);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProcessorEvent::RolledBack(_))));
        assert_eq!(p.tip().unwrap().height, 170);
    }

    #[test]
    fn header_pack_serving_walks_prev_links() {
        let mut p = MockProcessor::new(60);
        let states = chain(1, 5, 0);
        p.seed_chain(&states);
        let pack = p.get_header_pack(&states[4].id(), 3);
        assert_eq!(pack.len(), 3);
        assert_eq!(pack[0].height, 3);
        assert_eq!(pack[2].height, 5);
    }
}
