//! The sync task registry.
//!
//! A task is a request for one header pack or one block body, keyed by
//! `(BlockId, is_body)`. At most one task per key exists globally; every
//! task is at every instant either on the unassigned list or on exactly one
//! peer's list. Tasks live in an arena; the key index, the unassigned FIFO,
//! and the per-peer queues all hold arena handles, and every mutation goes
//! through the registry so the containers cannot diverge.

use std::collections::{BTreeMap, HashMap, VecDeque};

use mist_types::{BlockId, Height};

use crate::core::PeerToken;

pub type TaskId = usize;
pub type TaskKey = (BlockId, bool);

#[derive(Clone, Debug)]
pub struct Task {
    pub key: TaskKey,
    /// Still wanted by the processor; cleared when the demand lapses.
    pub needed: bool,
    /// How many times the task has been handed to a peer.
    pub replication: u32,
    pub time_assigned_ms: u64,
    /// The sync cursor this request works toward.
    pub target: BlockId,
    /// Fast-sync horizons captured at assignment time.
    pub h0: Height,
    pub txo_lo: Height,
    pub owner: Option<PeerToken>,
}

impl Task {
    pub fn is_body(&self) -> bool {
        self.key.1
    }
}

pub struct TaskRegistry {
    arena: Vec<Option<Task>>,
    free: Vec<TaskId>,
    by_key: BTreeMap<TaskKey, TaskId>,
    unassigned: VecDeque<TaskId>,
    per_peer: HashMap<PeerToken, VecDeque<TaskId>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            by_key: BTreeMap::new(),
            unassigned: VecDeque::new(),
            per_peer: HashMap::new(),
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.arena.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn contains_key(&self, key: &TaskKey) -> bool {
        self.by_key.contains_key(key)
    }

    // -- Demand intake -----------------------------------------------------

    /// Register demand for a piece of data. Deduplicates on the key;
    /// an existing task is refreshed (`needed`, target) instead.
    /// Returns the task id when a new task was created.
    pub fn request_data(
        &mut self,
        id: BlockId,
        is_body: bool,
        target: BlockId,
        h0: Height,
        txo_lo: Height,
    ) -> Option<TaskId> {
        let key = (id, is_body);
        if let Some(&existing) = self.by_key.get(&key) {
            if let Some(task) = self.arena[existing].as_mut() {
                task.needed = true;
                task.target = target;
            }
            return None;
        }

        let task = Task {
            key,
            needed: true,
            replication: 0,
            time_assigned_ms: 0,
            target,
            h0,
            txo_lo,
            owner: None,
        };
        let tid = match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(task);
                slot
            }
            None => {
                self.arena.push(Some(task));
                self.arena.len() - 1
            }
        };
        self.by_key.insert(key, tid);
        self.unassigned.push_back(tid);
        Some(tid)
    }

    // -- Assignment --------------------------------------------------------

    /// Unassigned task ids in queue order.
    pub fn unassigned_ids(&self) -> Vec<TaskId> {
        self.unassigned.iter().copied().collect()
    }

    /// Hand a task to a peer. The task must currently be unassigned.
    pub fn assign(&mut self, tid: TaskId, peer: PeerToken, now_ms: u64, h0: Height, txo_lo: Height) {
        let task = self.arena[tid].as_mut().expect("assigning a live task");
        debug_assert!(task.owner.is_none());
        task.owner = Some(peer);
        task.time_assigned_ms = now_ms;
        task.replication += 1;
        task.h0 = h0;
        task.txo_lo = txo_lo;
        self.unassigned.retain(|&t| t != tid);
        self.per_peer.entry(peer).or_default().push_back(tid);
    }

    /// Tasks currently owned by a peer, front = first (oldest) task.
    pub fn peer_tasks(&self, peer: PeerToken) -> Vec<TaskId> {
        self.per_peer
            .get(&peer)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The peer's first task: the one its next response must answer.
    pub fn first_task(&self, peer: PeerToken) -> Option<&Task> {
        let tid = *self.per_peer.get(&peer)?.front()?;
        self.get(tid)
    }

    pub fn assigned_count(&self, peer: PeerToken) -> usize {
        self.per_peer.get(&peer).map(|q| q.len()).unwrap_or(0)
    }

    pub fn body_count(&self, peer: PeerToken) -> usize {
        self.count_kind(peer, true)
    }

    pub fn header_count(&self, peer: PeerToken) -> usize {
        self.count_kind(peer, false)
    }

    fn count_kind(&self, peer: PeerToken, is_body: bool) -> usize {
        self.per_peer
            .get(&peer)
            .map(|q| {
                q.iter()
                    .filter(|&&tid| {
                        self.get(tid).map(|t| t.key.1 == is_body).unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    // -- Completion / release ----------------------------------------------

    /// The peer's first task was answered: remove it globally and return
    /// it. The caller verifies that the answer matches the key.
    pub fn complete_first(&mut self, peer: PeerToken) -> Option<Task> {
        let queue = self.per_peer.get_mut(&peer)?;
        let tid = queue.pop_front()?;
        if queue.is_empty() {
            self.per_peer.remove(&peer);
        }
        self.delete_slot(tid)
    }

    /// Return the peer's first task to the unassigned list (timeout or
    /// `DataMissing`); it will be offered to other peers.
    pub fn release_first(&mut self, peer: PeerToken) -> Option<TaskKey> {
        let queue = self.per_peer.get_mut(&peer)?;
        let tid = queue.pop_front()?;
        if queue.is_empty() {
            self.per_peer.remove(&peer);
        }
        let task = self.arena[tid].as_mut()?;
        task.owner = None;
        self.unassigned.push_front(tid);
        Some(task.key)
    }

    /// Cascading release on peer destruction: every owned task goes back
    /// to unassigned.
    pub fn release_all(&mut self, peer: PeerToken) -> usize {
        let Some(queue) = self.per_peer.remove(&peer) else {
            return 0;
        };
        let count = queue.len();
        for tid in queue {
            if let Some(task) = self.arena[tid].as_mut() {
                task.owner = None;
                self.unassigned.push_back(tid);
            }
        }
        count
    }

    /// Delete a task outright (demand lapsed, e.g. data arrived elsewhere).
    pub fn delete_by_key(&mut self, key: &TaskKey) -> Option<Task> {
        let tid = *self.by_key.get(key)?;
        if let Some(owner) = self.get(tid).and_then(|t| t.owner) {
            if let Some(queue) = self.per_peer.get_mut(&owner) {
                queue.retain(|&t| t != tid);
                if queue.is_empty() {
                    self.per_peer.remove(&owner);
                }
            }
        } else {
            self.unassigned.retain(|&t| t != tid);
        }
        self.delete_slot(tid)
    }

    fn delete_slot(&mut self, tid: TaskId) -> Option<Task> {
        let task = self.arena[tid].take()?;
        self.by_key.remove(&task.key);
        self.free.push(tid);
        Some(task)
    }

    // -- Invariant audit (used by property tests) --------------------------

    /// Verify that every live task sits in exactly one list and that the
    /// key index matches the arena.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen: HashMap<TaskId, &'static str> = HashMap::new();
        for &tid in &self.unassigned {
            if seen.insert(tid, "unassigned").is_some() {
                return Err(format!("task {tid} listed twice"));
            }
            match self.get(tid) {
                Some(t) if t.owner.is_none() => {}
                _ => return Err(format!("unassigned task {tid} has an owner or is dead")),
            }
        }
        for (&peer, queue) in &self.per_peer {
            for &tid in queue {
                if seen.insert(tid, "assigned").is_some() {
                    return Err(format!("task {tid} listed twice"));
                }
                match self.get(tid) {
                    Some(t) if t.owner == Some(peer) => {}
                    _ => return Err(format!("assigned task {tid} owner mismatch")),
                }
            }
        }
        if seen.len() != self.by_key.len() {
            return Err(format!(
                "index holds {} tasks, lists hold {}",
                self.by_key.len(),
                seen.len()
            ));
        }
        for (key, &tid) in &self.by_key {
            match self.get(tid) {
                Some(t) if t.key == *key => {}
                _ => return Err(format!("key index entry {key:?} is stale")),
            }
        }
        Ok(())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
