//! Weighted sync-progress metric.
//!
//! Headers count 1, bodies count 8 (bodies dominate the real work). The
//! first observed `done` value becomes the baseline so a restarted node
//! reports progress relative to where it began, and the reported `done`
//! is clamped monotonic between rollbacks.

const WEIGHT_HDR: u64 = 1;
const WEIGHT_BODY: u64 = 8;

#[derive(Debug, Default)]
pub struct SyncProgress {
    done: u64,
    total: u64,
    baseline: u64,
    baseline_set: bool,
    reported_done: u64,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_header_target(&mut self, count: u64) {
        self.total += WEIGHT_HDR * count;
    }

    pub fn add_body_target(&mut self, count: u64) {
        self.total += WEIGHT_BODY * count;
    }

    pub fn header_done(&mut self, count: u64) {
        self.done = (self.done + WEIGHT_HDR * count).min(self.total);
    }

    pub fn body_done(&mut self, count: u64) {
        self.done = (self.done + WEIGHT_BODY * count).min(self.total);
    }

    /// `(done, total)` normalized to the first observed progress.
    pub fn status(&mut self) -> (u64, u64) {
        if !self.baseline_set && self.done > 0 {
            self.baseline = self.done;
            self.baseline_set = true;
        }
        let rel_done = self.done.saturating_sub(self.baseline);
        let rel_total = self.total.saturating_sub(self.baseline);
        self.reported_done = self.reported_done.max(rel_done);
        (self.reported_done, rel_total.max(self.reported_done))
    }

    pub fn is_synced(&self) -> bool {
        self.done >= self.total
    }

    /// Rollbacks invalidate the metric; start a fresh window.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
