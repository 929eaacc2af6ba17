//! The chain controller: reacts to processor events on behalf of the
//! reactor, owning the timers and policy the processor itself must not:
//! debounced DB flushes, coalesced go-up scheduling, the automatic-rollback
//! ceiling, the insane-peer queue, and the fast-sync gate.

use std::collections::VecDeque;

use mist_types::{Height, NodeId, SystemState};

use crate::sync::SyncProgress;

/// How long modifications accumulate before a flush (storm coalescing).
const FLUSH_DELAY_MS: u64 = 5000;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Configured ceiling on silent automatic rollback.
    pub rollback_limit_max: Height,
    /// Tip age beyond which deeper rollback becomes permissible.
    pub timeout_since_tip_s: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rollback_limit_max: 60,
            timeout_since_tip_s: 3600,
        }
    }
}

pub struct ChainController {
    cfg: ControllerConfig,
    rules_max_rollback: Height,
    tip: Option<SystemState>,
    /// When the current tip was adopted, wall-clock seconds.
    tip_updated_s: u64,
    flush_due_ms: Option<u64>,
    go_up_due_ms: Option<u64>,
    insane_peers: VecDeque<NodeId>,
    fast_sync_done: bool,
    pub sync: SyncProgress,
}

impl ChainController {
    pub fn new(cfg: ControllerConfig, rules_max_rollback: Height) -> Self {
        Self {
            cfg,
            rules_max_rollback,
            tip: None,
            tip_updated_s: 0,
            flush_due_ms: None,
            go_up_due_ms: None,
            insane_peers: VecDeque::new(),
            fast_sync_done: false,
            sync: SyncProgress::new(),
        }
    }

    pub fn tip(&self) -> Option<&SystemState> {
        self.tip.as_ref()
    }

    pub fn tip_height(&self) -> Height {
        self.tip.as_ref().map(|t| t.height).unwrap_or(0)
    }

    // -- Event intake ------------------------------------------------------

    /// The processor adopted a new tip. Arms a coalesced go-up pass and
    /// tells the caller whether the tip should be broadcast. The tip age
    /// only resets when the tip actually moved.
    pub fn on_new_state(&mut self, tip: SystemState, now_ms: u64) -> bool {
        let changed = self.tip.map(|t| t.id()) != Some(tip.id());
        self.tip = Some(tip);
        if changed {
            self.tip_updated_s = now_ms / 1000;
        }
        if self.go_up_due_ms.is_none() {
            self.go_up_due_ms = Some(now_ms);
        }
        changed
    }

    /// Persistent state changed; arm the debounced flush. Repeated storms
    /// within the window coalesce into one flush.
    pub fn on_modified(&mut self, now_ms: u64) {
        if self.flush_due_ms.is_none() {
            self.flush_due_ms = Some(now_ms + FLUSH_DELAY_MS);
        }
    }

    pub fn on_rolled_back(&mut self) {
        self.sync.reset();
    }

    pub fn on_fast_sync_succeeded(&mut self) {
        if !self.fast_sync_done {
            tracing::info!("fast-sync complete, entering full validation mode");
        }
        self.fast_sync_done = true;
    }

    /// Full-validation gate: mempool acceptance and mining wait on this.
    pub fn is_full_mode(&self) -> bool {
        self.fast_sync_done
    }

    /// Queue a peer for disconnection on the reactor. Safe to call from an
    /// event posted by a validation worker; the disconnect itself happens
    /// when the reactor drains the queue.
    pub fn on_peer_insane(&mut self, peer: NodeId) {
        tracing::warn!(peer = %peer, "peer flagged insane");
        self.insane_peers.push_back(peer);
    }

    pub fn take_insane_peers(&mut self) -> Vec<NodeId> {
        self.insane_peers.drain(..).collect()
    }

    // -- Timers ------------------------------------------------------------

    /// The earliest pending deadline, for reactor timer arming.
    pub fn next_wakeup_ms(&self) -> Option<u64> {
        match (self.flush_due_ms, self.go_up_due_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// True when the debounced flush should run now; disarms the timer.
    pub fn take_flush_due(&mut self, now_ms: u64) -> bool {
        match self.flush_due_ms {
            Some(due) if now_ms >= due => {
                self.flush_due_ms = None;
                true
            }
            _ => false,
        }
    }

    /// True when the coalesced go-up pass should run now; disarms the timer.
    pub fn take_go_up_due(&mut self, now_ms: u64) -> bool {
        match self.go_up_due_ms {
            Some(due) if now_ms >= due => {
                self.go_up_due_ms = None;
                true
            }
            _ => false,
        }
    }

    // -- Rollback policy ---------------------------------------------------

    pub fn tip_age_s(&self, now_s: u64) -> u64 {
        now_s.saturating_sub(self.tip_updated_s)
    }

    /// How deep the node may reorganize right now. Up to the configured
    /// ceiling silently; beyond it only once the tip has been stale longer
    /// than `timeout_since_tip_s`, and never beyond the consensus bound.
    pub fn max_auto_rollback(&self, now_s: u64) -> Height {
        let ceiling = self.rules_max_rollback.min(self.cfg.rollback_limit_max);
        if self.tip_age_s(now_s) > self.cfg.timeout_since_tip_s {
            self.rules_max_rollback
        } else {
            ceiling
        }
    }

    pub fn may_auto_rollback(&self, depth: Height, now_s: u64) -> bool {
        depth <= self.max_auto_rollback(now_s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mist_types::{BlockHash, ChainWork, Difficulty, Timestamp};

    fn state(height: Height, tag: u8) -> SystemState {
        SystemState {
            height,
            prev: BlockHash::ZERO,
            hash: BlockHash::new([tag; 32]),
            definition: BlockHash::ZERO,
            chain_work: ChainWork(height as u128),
            difficulty: Difficulty(8),
            timestamp: Timestamp::new(0),
        }
    }

    fn controller() -> ChainController {
        ChainController::new(ControllerConfig::default(), 120)
    }

    #[test]
    fn new_state_reports_change_and_arms_go_up() {
        let mut c = controller();
        assert!(c.on_new_state(state(1, 1), 1000));
        assert!(!c.on_new_state(state(1, 1), 2000));
        assert!(c.on_new_state(state(2, 2), 3000));
        assert!(c.take_go_up_due(3000));
        assert!(!c.take_go_up_due(3000));
    }

    #[test]
    fn go_up_storms_coalesce() {
        let mut c = controller();
        c.on_new_state(state(1, 1), 1000);
        c.on_new_state(state(2, 2), 1001);
        c.on_new_state(state(3, 3), 1002);
        assert_eq!(c.next_wakeup_ms(), Some(1000));
        assert!(c.take_go_up_due(1002));
        assert_eq!(c.next_wakeup_ms(), None);
    }

    #[test]
    fn flush_debounces_storm_writes() {
        let mut c = controller();
        c.on_modified(1000);
        c.on_modified(2000);
        c.on_modified(4000);
        // First edge decides the deadline.
        assert!(!c.take_flush_due(5999));
        assert!(c.take_flush_due(6000));
        assert!(!c.take_flush_due(7000));
    }

    #[test]
    fn rollback_ceiling_is_min_of_rules_and_config() {
        let mut c = controller();
        c.on_new_state(state(100, 1), 0);
        assert_eq!(c.max_auto_rollback(0), 60);
        assert!(c.may_auto_rollback(60, 0));
        assert!(!c.may_auto_rollback(61, 0));
    }

    #[test]
    fn stale_tip_widens_the_ceiling_to_rules_max() {
        let mut c = controller();
        c.on_new_state(state(100, 1), 0);
        let stale = 3601;
        assert_eq!(c.max_auto_rollback(stale), 120);
        assert!(c.may_auto_rollback(70, stale));
        assert!(!c.may_auto_rollback(121, stale));
    }

    #[test]
    fn rules_bound_caps_a_generous_config() {
        let cfg = ControllerConfig {
            rollback_limit_max: 10_000,
            timeout_since_tip_s: 3600,
        };
        let c = ChainController::new(cfg, 120);
        assert_eq!(c.max_auto_rollback(0), 120);
    }

    #[test]
    fn fast_sync_gate_opens_once() {
        let mut c = controller();
        assert!(!c.is_full_mode());
        c.on_fast_sync_succeeded();
        assert!(c.is_full_mode());
    }

    #[test]
    fn insane_peers_drain_in_order() {
        let mut c = controller();
        c.on_peer_insane(NodeId([1; 32]));
        c.on_peer_insane(NodeId([2; 32]));
        assert_eq!(
            c.take_insane_peers(),
            vec![NodeId([1; 32]), NodeId([2; 32])]
        );
        assert!(c.take_insane_peers().is_empty());
    }

    #[test]
    fn rolled_back_resets_sync_progress() {
        let mut c = controller();
        c.sync.add_body_target(10);
        c.sync.body_done(5);
        c.on_rolled_back();
        assert_eq!(c.sync.status(), (0, 0));
    }
}
