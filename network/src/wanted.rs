//! Generic "I want X, ask peers" lookup table with expiry.
//!
//! Keys live in two containers: a membership map carrying each key's expiry
//! deadline, and a FIFO deque in advertisement order. Removal only touches
//! the map; the deque entry becomes a tombstone that [`Wanted::pop_expired`]
//! skips. Deadlines are monotone because the timeout is fixed per instance,
//! so the deque front always expires first.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

pub struct Wanted<K> {
    timeout_ms: u64,
    deadlines: HashMap<K, u64>,
    queue: VecDeque<(K, u64)>,
}

impl<K: Eq + Hash + Copy> Wanted<K> {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            deadlines: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Start wanting `key`. Returns `false` if it was already wanted.
    pub fn add(&mut self, key: K, now_ms: u64) -> bool {
        match self.deadlines.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let deadline = now_ms + self.timeout_ms;
                slot.insert(deadline);
                self.queue.push_back((key, deadline));
                true
            }
        }
    }

    /// Stop wanting `key` (it arrived, or the advertiser vanished).
    /// Returns `true` if it was wanted.
    pub fn remove(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// The next deadline to arm a timer for, if anything is pending.
    pub fn next_expiry_ms(&mut self) -> Option<u64> {
        self.skip_tombstones();
        self.queue.front().map(|(_, deadline)| *deadline)
    }

    /// Drain every key whose deadline has passed.
    pub fn pop_expired(&mut self, now_ms: u64) -> Vec<K> {
        let mut expired = Vec::new();
        loop {
            self.skip_tombstones();
            let due = matches!(self.queue.front(), Some((_, deadline)) if *deadline <= now_ms);
            if !due {
                return expired;
            }
            let (key, deadline) = self.queue.pop_front().expect("front checked");
            // A re-added key has a newer deadline in the map; this queue
            // entry is then stale.
            if self.deadlines.get(&key) == Some(&deadline) {
                self.deadlines.remove(&key);
                expired.push(key);
            }
        }
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.queue.clear();
    }

    fn skip_tombstones(&mut self) {
        while let Some((key, deadline)) = self.queue.front() {
            if self.deadlines.get(key) == Some(deadline) {
                return;
            }
            self.queue.pop_front();
        }
    }
}
