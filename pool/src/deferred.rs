//! Submissions buffered until fast-sync completes.

use std::collections::VecDeque;

use mist_types::{ContextHash, NodeId, Transaction};

#[derive(Clone, Debug)]
pub struct DeferredTx {
    pub tx: Transaction,
    pub context: Option<ContextHash>,
    pub from_peer: Option<NodeId>,
    pub fluff: bool,
}

/// FIFO of transactions received before the node can validate them.
pub struct DeferredQueue {
    cap: usize,
    items: VecDeque<DeferredTx>,
}

impl DeferredQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            items: VecDeque::new(),
        }
    }

    /// Queue a submission. Returns `false` (dropping it) when full.
    pub fn push(&mut self, item: DeferredTx) -> bool {
        if self.items.len() >= self.cap {
            tracing::debug!(cap = self.cap, "deferred queue full, dropping transaction");
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Dequeue in insertion order.
    pub fn pop(&mut self) -> Option<DeferredTx> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
