//! The dependent pool: transactions spending outputs of an uncommitted
//! mempool ancestor, forming a linear chain of contexts.
//!
//! A context hash identifies each link; a child names its parent's context.
//! The pool tracks cumulative fee and size along the chain and keeps a
//! `best` pointer at the most valuable deepest link, which block assembly
//! consumes. The whole pool is cleared on a tip change: contexts are only
//! meaningful against the state they were validated on.

use std::collections::HashMap;

use mist_types::{ContextHash, KernelId, Transaction};

#[derive(Clone, Debug)]
pub struct DependentEntry {
    pub tx: Transaction,
    pub ctx: ContextHash,
    pub parent: Option<ContextHash>,
    /// Fee of this transaction plus all ancestors.
    pub total_fee: u64,
    /// Weight of this transaction plus all ancestors.
    pub total_weight: usize,
}

/// Outcome of a dependent insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependentAdd {
    Added,
    DuplicateContext,
    ParentNotFound,
}

pub struct DependentPool {
    by_ctx: HashMap<ContextHash, DependentEntry>,
    by_key: HashMap<KernelId, ContextHash>,
    best: Option<ContextHash>,
}

impl DependentPool {
    pub fn new() -> Self {
        Self {
            by_ctx: HashMap::new(),
            by_key: HashMap::new(),
            best: None,
        }
    }

    /// Add a link. `parent` of `None` roots a chain at the current tip.
    pub fn add(
        &mut self,
        tx: Transaction,
        ctx: ContextHash,
        parent: Option<ContextHash>,
    ) -> DependentAdd {
        if self.by_ctx.contains_key(&ctx) {
            return DependentAdd::DuplicateContext;
        }

        let (parent_fee, parent_weight) = match parent {
            None => (0, 0),
            Some(p) => match self.by_ctx.get(&p) {
                None => return DependentAdd::ParentNotFound,
                Some(entry) => (entry.total_fee, entry.total_weight),
            },
        };

        let entry = DependentEntry {
            total_fee: parent_fee.saturating_add(tx.fee()),
            total_weight: parent_weight.saturating_add(tx.weight()),
            ctx,
            parent,
            tx,
        };
        self.by_key.insert(entry.tx.key(), ctx);

        let better = match self.best.as_ref().and_then(|b| self.by_ctx.get(b)) {
            None => true,
            Some(best) => entry.total_fee > best.total_fee,
        };
        if better {
            self.best = Some(ctx);
        }
        self.by_ctx.insert(ctx, entry);
        DependentAdd::Added
    }

    pub fn get(&self, ctx: &ContextHash) -> Option<&DependentEntry> {
        self.by_ctx.get(ctx)
    }

    pub fn contains_key(&self, key: &KernelId) -> bool {
        self.by_key.contains_key(key)
    }

    /// The most valuable chain end, if any.
    pub fn best(&self) -> Option<&DependentEntry> {
        self.best.as_ref().and_then(|ctx| self.by_ctx.get(ctx))
    }

    /// The chain from root to `ctx`, in apply order.
    pub fn chain_to(&self, ctx: &ContextHash) -> Vec<&DependentEntry> {
        let mut links = Vec::new();
        let mut cursor = self.by_ctx.get(ctx);
        while let Some(entry) = cursor {
            links.push(entry);
            cursor = entry.parent.as_ref().and_then(|p| self.by_ctx.get(p));
        }
        links.reverse();
        links
    }

    pub fn len(&self) -> usize {
        self.by_ctx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ctx.is_empty()
    }

    /// Drop everything: contexts do not survive a tip change.
    pub fn clear(&mut self) {
        self.by_ctx.clear();
        self.by_key.clear();
        self.best = None;
    }
}

impl Default for DependentPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_types::{TxKernel, MAX_HEIGHT};

    fn tx(tag: u8, fee: u64) -> Transaction {
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

    fn ctx(tag: u8) -> ContextHash {
        ContextHash::new([tag; 32])
    }

    #[test]
    fn missing_parent_is_reported() {
        let mut pool = DependentPool::new();
        assert_eq!(
            pool.add(tx(1, 10), ctx(1), Some(ctx(99))),
            DependentAdd::ParentNotFound
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn chain_accumulates_fee_and_weight() {
        let mut pool = DependentPool::new();
        assert_eq!(pool.add(tx(1, 10), ctx(1), None), DependentAdd::Added);
        assert_eq!(pool.add(tx(2, 20), ctx(2), Some(ctx(1))), DependentAdd::Added);
        assert_eq!(pool.add(tx(3, 5), ctx(3), Some(ctx(2))), DependentAdd::Added);

        let end = pool.get(&ctx(3)).unwrap();
        assert_eq!(end.total_fee, 35);
        assert_eq!(end.total_weight, tx(1, 0).weight() * 3);
    }

    #[test]
    fn best_tracks_highest_cumulative_fee() {
        let mut pool = DependentPool::new();
        pool.add(tx(1, 10), ctx(1), None);
        assert_eq!(pool.best().unwrap().ctx, ctx(1));

        // A fork off the root with a lower fee does not displace the best.
        pool.add(tx(2, 5), ctx(2), Some(ctx(1)));
        assert_eq!(pool.best().unwrap().ctx, ctx(2));

        pool.add(tx(3, 1), ctx(3), None);
        assert_eq!(pool.best().unwrap().ctx, ctx(2));
    }

    #[test]
    fn duplicate_context_is_rejected() {
        let mut pool = DependentPool::new();
        pool.add(tx(1, 10), ctx(1), None);
        assert_eq!(
            pool.add(tx(2, 10), ctx(1), None),
            DependentAdd::DuplicateContext
        );
    }

    #[test]
    fn chain_to_walks_root_first() {
        let mut pool = DependentPool::new();
        pool.add(tx(1, 10), ctx(1), None);
        pool.add(tx(2, 10), ctx(2), Some(ctx(1)));
        pool.add(tx(3, 10), ctx(3), Some(ctx(2)));

        let links: Vec<ContextHash> = pool.chain_to(&ctx(3)).iter().map(|e| e.ctx).collect();
        assert_eq!(links, vec![ctx(1), ctx(2), ctx(3)]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut pool = DependentPool::new();
        pool.add(tx(1, 10), ctx(1), None);
        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.best().is_none());
        assert!(!pool.contains_key(&KernelId::new([1; 32])));
    }
}
