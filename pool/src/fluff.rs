//! The fluff pool: validated transactions gossiped freely.
//!
//! Entries sit in two containers: the key-ordered map (which also serves
//! the per-peer broadcast cursor) and a fee-density index used for eviction
//! when the pool exceeds its capacity. Both are updated through the single
//! removal helper so they cannot drift apart.

use std::collections::{BTreeMap, BTreeSet};

use mist_types::{Height, KernelId, Transaction};

#[derive(Clone, Debug)]
pub struct FluffEntry {
    pub tx: Transaction,
    /// Set when a reorg made the entry conflict at this height; such
    /// entries are skipped by broadcast and re-validated lazily.
    pub outdated_at: Option<Height>,
}

/// Outcome of a fluff insertion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FluffInsert {
    /// Stored; the listed keys were evicted to make room (possibly the new
    /// transaction itself if its fee density was the lowest).
    Added { evicted: Vec<KernelId> },
    /// The kernel is already pooled.
    Duplicate,
}

pub struct FluffPool {
    max_entries: usize,
    entries: BTreeMap<KernelId, FluffEntry>,
    /// `(fee_density, key)` ascending: the first element is the cheapest.
    by_density: BTreeSet<(u64, KernelId)>,
}

impl FluffPool {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: BTreeMap::new(),
            by_density: BTreeSet::new(),
        }
    }

    /// Insert a validated transaction, evicting the lowest fee-density
    /// entries while over capacity.
    pub fn insert(&mut self, tx: Transaction) -> FluffInsert {
        let key = tx.key();
        if self.entries.contains_key(&key) {
            return FluffInsert::Duplicate;
        }

        self.by_density.insert((tx.fee_density(), key));
        self.entries.insert(
            key,
            FluffEntry {
                tx,
                outdated_at: None,
            },
        );

        let mut evicted = Vec::new();
        while self.entries.len() > self.max_entries {
            let cheapest = match self.by_density.iter().next() {
                Some(&pair) => pair,
                None => break,
            };
            self.remove_indexed(cheapest.1);
            tracing::debug!(key = %cheapest.1, density = cheapest.0, "fluff pool evicted");
            evicted.push(cheapest.1);
        }
        FluffInsert::Added { evicted }
    }

    pub fn get(&self, key: &KernelId) -> Option<&Transaction> {
        self.entries.get(key).map(|e| &e.tx)
    }

    pub fn contains(&self, key: &KernelId) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry (confirmed in a block, or superseded).
    pub fn remove(&mut self, key: &KernelId) -> Option<Transaction> {
        self.remove_indexed(*key).map(|e| e.tx)
    }

    fn remove_indexed(&mut self, key: KernelId) -> Option<FluffEntry> {
        let entry = self.entries.remove(&key)?;
        self.by_density.remove(&(entry.tx.fee_density(), key));
        Some(entry)
    }

    /// Mark an entry as conflicting after a rollback.
    pub fn mark_outdated(&mut self, key: &KernelId, height: Height) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.outdated_at = Some(height);
        }
    }

    pub fn is_outdated(&self, key: &KernelId) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.outdated_at.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys after `cursor` in key order: the per-peer broadcast walk.
    /// Outdated entries are skipped. `None` starts from the beginning.
    pub fn keys_after(&self, cursor: Option<KernelId>, limit: usize) -> Vec<KernelId> {
        let iter: Box<dyn Iterator<Item = (&KernelId, &FluffEntry)>> = match cursor {
            Some(c) => Box::new(
                self.entries
                    .range((std::ops::Bound::Excluded(c), std::ops::Bound::Unbounded)),
            ),
            None => Box::new(self.entries.iter()),
        };
        iter.filter(|(_, e)| e.outdated_at.is_none())
            .take(limit)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Transactions ordered by descending fee density: block assembly order.
    pub fn iter_by_density_desc(&self) -> impl Iterator<Item = &Transaction> {
        self.by_density
            .iter()
            .rev()
            .filter_map(move |(_, key)| self.entries.get(key))
            .filter(|e| e.outdated_at.is_none())
            .map(|e| &e.tx)
    }
}
