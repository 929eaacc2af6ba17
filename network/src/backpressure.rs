//! Per-peer send backpressure accounting.
//!
//! Two thresholds on pending (queued but unsent) bytes: at `choking` the
//! peer stops receiving non-essential traffic (BBS forwards, transaction
//! fluff, body packs) until the queue drains; at `drown` the peer is beyond
//! saving and must be disconnected.

/// Soft threshold: non-essential sends stall. Default 1 MiB.
pub const DEFAULT_CHOKING: usize = 1024 * 1024;
/// Hard threshold: disconnect. Default 20 MiB.
pub const DEFAULT_DROWN: usize = 20 * 1024 * 1024;

#[derive(Debug)]
pub struct SendQueue {
    pending: usize,
    choking: usize,
    drown: usize,
}

impl SendQueue {
    pub fn new(choking: usize, drown: usize) -> Self {
        Self {
            pending: 0,
            choking,
            drown,
        }
    }

    /// Account `bytes` queued for sending.
    pub fn on_queued(&mut self, bytes: usize) {
        self.pending = self.pending.saturating_add(bytes);
    }

    /// Account `bytes` actually written to the socket.
    pub fn on_drained(&mut self, bytes: usize) {
        self.pending = self.pending.saturating_sub(bytes);
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending
    }

    /// True exactly from `choking` pending bytes upward.
    pub fn is_choking(&self) -> bool {
        self.pending >= self.choking
    }

    /// Like [`is_choking`], but asks whether queueing `extra` more bytes
    /// would choke: used to gate a send before enqueueing it.
    ///
    /// [`is_choking`]: SendQueue::is_choking
    pub fn would_choke(&self, extra: usize) -> bool {
        self.pending.saturating_add(extra) >= self.choking
    }

    /// True exactly from `drown` pending bytes upward.
    pub fn is_drowning(&self) -> bool {
        self.pending >= self.drown
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CHOKING, DEFAULT_DROWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_inclusive() {
        let mut q = SendQueue::new(100, 1000);
        q.on_queued(99);
        assert!(!q.is_choking());
        q.on_queued(1);
        assert!(q.is_choking());
        assert!(!q.is_drowning());
        q.on_queued(900);
        assert!(q.is_drowning());
    }

    #[test]
    fn draining_releases_the_choke() {
        let mut q = SendQueue::new(100, 1000);
        q.on_queued(150);
        assert!(q.is_choking());
        q.on_drained(60);
        assert!(!q.is_choking());
        assert_eq!(q.pending_bytes(), 90);
    }

    #[test]
    fn would_choke_previews_the_send() {
        let mut q = SendQueue::new(100, 1000);
        q.on_queued(50);
        assert!(!q.would_choke(49));
        assert!(q.would_choke(50));
    }

    #[test]
    fn drain_never_underflows() {
        let mut q = SendQueue::new(100, 1000);
        q.on_drained(10);
        assert_eq!(q.pending_bytes(), 0);
    }

    #[test]
    fn defaults_match_protocol_limits() {
        let q = SendQueue::default();
        assert_eq!(q.choking, DEFAULT_CHOKING);
        assert_eq!(q.drown, DEFAULT_DROWN);
    }
}
