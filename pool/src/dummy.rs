//! Ledger of dummy outputs created for Dandelion padding.
//!
//! Dummies are throwaway coins added to under-sized aggregates. Each is
//! created with a spend height drawn from the dummy-lifetime distribution;
//! once the chain reaches that height the dummy becomes spendable and is
//! consumed as a dummy input of a later aggregate.

use std::collections::BTreeSet;

use mist_types::{CoinId, Height};

#[derive(Default)]
pub struct DummyBook {
    by_spend_height: BTreeSet<(Height, CoinId)>,
}

impl DummyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly created dummy and the height it should be spent at.
    pub fn add(&mut self, coin: CoinId, spend_height: Height) {
        self.by_spend_height.insert((spend_height, coin));
    }

    /// Take up to `limit` dummies whose spend height has arrived.
    pub fn take_ready(&mut self, tip: Height, limit: usize) -> Vec<CoinId> {
        let ready: Vec<(Height, CoinId)> = self
            .by_spend_height
            .iter()
            .take_while(|(h, _)| *h <= tip)
            .take(limit)
            .copied()
            .collect();
        for pair in &ready {
            self.by_spend_height.remove(pair);
        }
        ready.into_iter().map(|(_, coin)| coin).collect()
    }

    /// Forget a dummy (it was spent by someone else or rolled back).
    pub fn remove(&mut self, coin: &CoinId, spend_height: Height) -> bool {
        self.by_spend_height.remove(&(spend_height, *coin))
    }

    pub fn len(&self) -> usize {
        self.by_spend_height.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_spend_height.is_empty()
    }
}
