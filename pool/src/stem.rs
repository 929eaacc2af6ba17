//! The stem pool: transactions traversing the Dandelion privacy relay.
//!
//! Every entry carries an embargo deadline (when it will be force-fluffed)
//! and a confirm-height deadline (force-fluffed if not mined within a few
//! blocks). Entries still marked `aggregating` may be merged with peers of
//! compatible size before release. Each entry owns exactly one embargo slot
//! in the deadline index.

use std::collections::{BTreeSet, HashMap};

use mist_types::{Height, KernelId, Transaction};

#[derive(Clone, Debug)]
pub struct StemEntry {
    pub tx: Transaction,
    /// Still eligible for aggregation (not yet scheduled for broadcast).
    pub aggregating: bool,
    /// Wall-clock deadline after which the entry is fluffed regardless.
    pub embargo_at_ms: u64,
    /// Chain height after which the entry is fluffed regardless.
    pub confirm_deadline: Height,
    /// Fee headroom available to fund dummy outputs.
    pub fee_reserve: u64,
}

pub struct StemPool {
    entries: HashMap<KernelId, StemEntry>,
    /// Every kernel of every pooled transaction, mapped to its entry key.
    kernel_owner: HashMap<KernelId, KernelId>,
    by_embargo: BTreeSet<(u64, KernelId)>,
    by_confirm: BTreeSet<(Height, KernelId)>,
}

impl StemPool {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            kernel_owner: HashMap::new(),
            by_embargo: BTreeSet::new(),
            by_confirm: BTreeSet::new(),
        }
    }

    /// Insert a stem transaction. Fails (returns `false`) when any of its
    /// kernels is already pooled: the caller reports `Duplicate`.
    pub fn insert(&mut self, entry: StemEntry) -> bool {
        let key = entry.tx.key();
        if self.entries.contains_key(&key)
            || entry
                .tx
                .kernels
                .iter()
                .any(|k| self.kernel_owner.contains_key(&k.id))
        {
            return false;
        }

        for k in &entry.tx.kernels {
            self.kernel_owner.insert(k.id, key);
        }
        self.by_embargo.insert((entry.embargo_at_ms, key));
        self.by_confirm.insert((entry.confirm_deadline, key));
        self.entries.insert(key, entry);
        true
    }

    pub fn contains_kernel(&self, id: &KernelId) -> bool {
        self.kernel_owner.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &KernelId) -> Option<&StemEntry> {
        self.entries.get(key)
    }

    /// Remove an entry, dropping it from every index.
    pub fn remove(&mut self, key: &KernelId) -> Option<StemEntry> {
        let entry = self.entries.remove(key)?;
        for k in &entry.tx.kernels {
            self.kernel_owner.remove(&k.id);
        }
        self.by_embargo.remove(&(entry.embargo_at_ms, *key));
        self.by_confirm.remove(&(entry.confirm_deadline, *key));
        Some(entry)
    }

    /// Remove the entry owning `kernel` (it was mined, or arrived by fluff).
    pub fn remove_by_kernel(&mut self, kernel: &KernelId) -> Option<StemEntry> {
        let key = *self.kernel_owner.get(kernel)?;
        self.remove(&key)
    }

    /// The earliest embargo deadline, for timer arming.
    pub fn next_embargo_ms(&self) -> Option<u64> {
        self.by_embargo.iter().next().map(|(at, _)| *at)
    }

    /// Drain entries whose embargo has expired.
    pub fn pop_embargoed(&mut self, now_ms: u64) -> Vec<StemEntry> {
        let due: Vec<KernelId> = self
            .by_embargo
            .iter()
            .take_while(|(at, _)| *at <= now_ms)
            .map(|(_, key)| *key)
            .collect();
        due.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Drain entries whose confirm-height deadline has been reached.
    pub fn pop_confirm_due(&mut self, tip: Height) -> Vec<StemEntry> {
        let due: Vec<KernelId> = self
            .by_confirm
            .iter()
            .take_while(|(h, _)| *h <= tip)
            .map(|(_, key)| *key)
            .collect();
        due.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Keys of entries still open to aggregation, in deterministic order.
    pub fn aggregating_keys(&self) -> Vec<KernelId> {
        let mut keys: Vec<KernelId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.aggregating)
            .map(|(k, _)| *k)
            .collect();
        keys.sort();
        keys
    }

    /// Merge `src` into `target` when the combined transaction stays within
    /// `outputs_max` inputs+outputs. Both entries are replaced by the merged
    /// one; the merged entry keeps the earlier deadlines and the summed fee
    /// reserve. Returns the merged entry's key.
    pub fn merge(
        &mut self,
        target: &KernelId,
        src: &KernelId,
        outputs_max: usize,
    ) -> Option<KernelId> {
        {
            let t = self.entries.get(target)?;
            let s = self.entries.get(src)?;
            if !t.aggregating || !s.aggregating {
                return None;
            }
            if t.tx.io_count() + s.tx.io_count() > outputs_max {
                return None;
            }
        }

        let t = self.remove(target).expect("checked above");
        let s = self.remove(src).expect("checked above");

        let mut tx = t.tx;
        tx.inputs.extend(s.tx.inputs);
        tx.outputs.extend(s.tx.outputs);
        tx.kernels.extend(s.tx.kernels);

        let merged = StemEntry {
            tx,
            aggregating: true,
            embargo_at_ms: t.embargo_at_ms.min(s.embargo_at_ms),
            confirm_deadline: t.confirm_deadline.min(s.confirm_deadline),
            fee_reserve: t.fee_reserve.saturating_add(s.fee_reserve),
        };
        let key = merged.tx.key();
        let inserted = self.insert(merged);
        debug_assert!(inserted, "merged kernels were disjoint");
        Some(key)
    }
}

impl Default for StemPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_types::{CoinId, TxKernel, TxOutput, MAX_HEIGHT};

    fn tx(tag: u8, outputs: usize) -> Transaction {
        Transaction {
            inputs: vec![],
            outputs: (0..outputs)
                .map(|i| TxOutput {
                    commitment: CoinId::new([tag.wrapping_add(i as u8 + 1); 32]),
                })
                .collect(),
            kernels: vec![TxKernel {
                id: KernelId::new([tag; 32]),
                fee: 100,
                height_min: 0,
                height_max: MAX_HEIGHT,
            }],
        }
    }

    fn entry(tag: u8, outputs: usize, embargo: u64, confirm: Height) -> StemEntry {
        StemEntry {
            tx: tx(tag, outputs),
            aggregating: true,
            embargo_at_ms: embargo,
            confirm_deadline: confirm,
            fee_reserve: 10,
        }
    }

    #[test]
    fn kernel_collision_rejected() {
        let mut pool = StemPool::new();
        assert!(pool.insert(entry(1, 2, 100, 50)));
        assert!(!pool.insert(entry(1, 3, 200, 60)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn embargo_pops_in_deadline_order() {
        let mut pool = StemPool::new();
        pool.insert(entry(1, 1, 300, 999));
        pool.insert(entry(2, 1, 100, 999));
        pool.insert(entry(3, 1, 200, 999));

        assert_eq!(pool.next_embargo_ms(), Some(100));
        assert!(pool.pop_embargoed(99).is_empty());

        let due = pool.pop_embargoed(250);
        let keys: Vec<KernelId> = due.iter().map(|e| e.tx.key()).collect();
        assert_eq!(keys, vec![KernelId::new([2; 32]), KernelId::new([3; 32])]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn confirm_deadline_pops_by_height() {
        let mut pool = StemPool::new();
        pool.insert(entry(1, 1, u64::MAX, 105));
        pool.insert(entry(2, 1, u64::MAX, 110));

        assert!(pool.pop_confirm_due(104).is_empty());
        let due = pool.pop_confirm_due(105);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].tx.key(), KernelId::new([1; 32]));
    }

    #[test]
    fn remove_by_kernel_clears_every_index() {
        let mut pool = StemPool::new();
        pool.insert(entry(1, 2, 100, 50));
        let removed = pool.remove_by_kernel(&KernelId::new([1; 32])).unwrap();
        assert_eq!(removed.tx.key(), KernelId::new([1; 32]));
        assert!(pool.is_empty());
        assert!(pool.by_embargo.is_empty());
        assert!(pool.by_confirm.is_empty());
        assert!(pool.kernel_owner.is_empty());
    }

    #[test]
    fn merge_respects_output_bound() {
        let mut pool = StemPool::new();
        pool.insert(entry(1, 3, 100, 50));
        pool.insert(entry(10, 3, 200, 60));

        // 3 + 3 > 5: refused.
        assert!(pool
            .merge(&KernelId::new([1; 32]), &KernelId::new([10; 32]), 5)
            .is_none());
        assert_eq!(pool.len(), 2);

        let merged = pool
            .merge(&KernelId::new([1; 32]), &KernelId::new([10; 32]), 6)
            .unwrap();
        assert_eq!(pool.len(), 1);
        let e = pool.get(&merged).unwrap();
        assert_eq!(e.tx.kernels.len(), 2);
        assert_eq!(e.tx.outputs.len(), 6);
        // Earlier embargo wins.
        assert_eq!(e.embargo_at_ms, 100);
        assert_eq!(e.fee_reserve, 20);
    }

    #[test]
    fn merged_entry_has_one_embargo_slot() {
        let mut pool = StemPool::new();
        pool.insert(entry(1, 1, 100, 50));
        pool.insert(entry(10, 1, 200, 60));
        pool.merge(&KernelId::new([1; 32]), &KernelId::new([10; 32]), 40)
            .unwrap();
        assert_eq!(pool.by_embargo.len(), 1);
        assert_eq!(pool.by_confirm.len(), 1);
    }

    #[test]
    fn aggregating_keys_are_sorted() {
        let mut pool = StemPool::new();
        pool.insert(entry(9, 1, 100, 50));
        pool.insert(entry(2, 1, 100, 50));
        let mut only_broadcast = entry(5, 1, 100, 50);
        only_broadcast.aggregating = false;
        pool.insert(only_broadcast);

        assert_eq!(
            pool.aggregating_keys(),
            vec![KernelId::new([2; 32]), KernelId::new([9; 32])]
        );
    }
}
