//! The mining driver.
//!
//! Owns whichever solving backend the config selected and the soft-restart
//! policy. The reactor calls [`MinerDriver::set_template`] whenever the tip
//! or the mempool changes; cooperating solvers observe the shared stop flag
//! between nonce batches and pick up the fresh template. Restarts are rate
//! limited to one per `soft_restart_ms`: a storm of template changes rides
//! the pending-restart deadline instead of thrashing the workers.
//!
//! Solutions travel to the reactor over a plain `mpsc` sender; the node
//! bridges that onto its event queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use mist_types::{Height, NodeId};

use crate::external::{ExternalSolver, JobRing};
use crate::template::BlockTemplate;

/// Nonces tried between stop-flag polls.
const NONCE_BATCH: u64 = 2048;

/// A solved template, posted from a worker thread or the fake-PoW timer.
#[derive(Clone, Debug)]
pub enum MinerEvent {
    Solved {
        job_id: u64,
        template: BlockTemplate,
        nonce: u64,
    },
}

/// What the reactor must do after handing the driver a template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MinerAction {
    None,
    /// A finalizer peer is attached: send it the template instead of
    /// solving locally.
    SendToFinalizer {
        peer: NodeId,
        height: Height,
        fees: u64,
    },
}

#[derive(Clone, Debug)]
pub struct MinerConfig {
    /// In-process worker threads; 0 disables local mining.
    pub threads: usize,
    /// Minimum spacing between cooperative solver restarts.
    pub soft_restart_ms: u64,
    /// Test mode: produce a block this long after each template, no work.
    pub fake_pow_solve_time_ms: Option<u64>,
}

struct Job {
    job_id: u64,
    template: BlockTemplate,
    stop: AtomicBool,
    nonce_seed: u64,
    stride: u64,
}

struct WorkerState {
    job: Option<Arc<Job>>,
    shutdown: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    cv: Condvar,
}

enum Mode {
    Disabled,
    Internal {
        shared: Arc<WorkerShared>,
        workers: Vec<thread::JoinHandle<()>>,
    },
    External {
        solver: Box<dyn ExternalSolver>,
        ring: JobRing,
    },
    Fake {
        solve_time_ms: u64,
        due_ms: Option<u64>,
        job: Option<(u64, BlockTemplate)>,
    },
}

pub struct MinerDriver {
    mode: Mode,
    solved_tx: Sender<MinerEvent>,
    job_counter: u64,
    last_restart_ms: Option<u64>,
    restart_due_ms: Option<u64>,
    latest_template: Option<BlockTemplate>,
    soft_restart_ms: u64,
    finalizer: Option<NodeId>,
    pending_finalize: Option<BlockTemplate>,
    fake_blocks_pending: u32,
}

impl MinerDriver {
    /// Build the driver for the configured mode. An external solver takes
    /// precedence over internal threads; fake PoW overrides both.
    pub fn new(
        cfg: MinerConfig,
        external: Option<Box<dyn ExternalSolver>>,
        solved_tx: Sender<MinerEvent>,
    ) -> Self {
        let mode = if let Some(solve_time_ms) = cfg.fake_pow_solve_time_ms {
            Mode::Fake {
                solve_time_ms,
                due_ms: None,
                job: None,
            }
        } else if let Some(solver) = external {
            Mode::External {
                solver,
                ring: JobRing::new(),
            }
        } else if cfg.threads > 0 {
            let shared = Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    job: None,
                    shutdown: false,
                }),
                cv: Condvar::new(),
            });
            let workers = (0..cfg.threads)
                .map(|idx| {
                    let shared = Arc::clone(&shared);
                    let tx = solved_tx.clone();
                    thread::Builder::new()
                        .name(format!("mist-miner-{idx}"))
                        .spawn(move || run_worker(idx, shared, tx))
                        .expect("spawn miner thread")
                })
                .collect();
            Mode::Internal { shared, workers }
        } else {
            Mode::Disabled
        };

        Self {
            mode,
            solved_tx,
            job_counter: 0,
            last_restart_ms: None,
            restart_due_ms: None,
            latest_template: None,
            soft_restart_ms: cfg.soft_restart_ms,
            finalizer: None,
            pending_finalize: None,
            fake_blocks_pending: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.mode, Mode::Disabled) || self.finalizer.is_some()
    }

    pub fn current_job_id(&self) -> u64 {
        self.job_counter
    }

    // -- Template intake ---------------------------------------------------

    /// Accept a freshly assembled template. Applies the soft-restart window
    /// and the finalizer handoff.
    pub fn set_template(&mut self, template: BlockTemplate, now_ms: u64) -> MinerAction {
        self.latest_template = Some(template);

        if let Some(peer) = self.finalizer {
            self.pending_finalize = Some(template);
            return MinerAction::SendToFinalizer {
                peer,
                height: template.height,
                fees: template.fees,
            };
        }

        match self.last_restart_ms {
            Some(last) if now_ms.saturating_sub(last) < self.soft_restart_ms => {
                // Too soon: arm the deferred restart instead.
                self.restart_due_ms = Some(last + self.soft_restart_ms);
            }
            _ => self.restart_now(now_ms),
        }
        MinerAction::None
    }

    fn restart_now(&mut self, now_ms: u64) {
        let Some(template) = self.latest_template else {
            return;
        };
        self.last_restart_ms = Some(now_ms);
        self.restart_due_ms = None;
        self.job_counter += 1;
        let job_id = self.job_counter;

        match &mut self.mode {
            Mode::Disabled => {}
            Mode::Internal { shared, workers } => {
                // Stride equals the worker count so threads partition the
                // nonce space.
                let job = Arc::new(Job {
                    job_id,
                    template,
                    stop: AtomicBool::new(false),
                    nonce_seed: rand::random(),
                    stride: workers.len().max(1) as u64,
                });
                let mut st = shared.state.lock().expect("miner state");
                if let Some(old) = &st.job {
                    old.stop.store(true, Ordering::Relaxed);
                }
                st.job = Some(job);
                shared.cv.notify_all();
                drop(st);
                tracing::debug!(job_id, height = template.height, "mining restarted");
            }
            Mode::External { solver, ring } => {
                ring.put(job_id, template);
                solver.new_job(job_id, template.input, template.difficulty);
                tracing::debug!(job_id, height = template.height, "external job issued");
            }
            Mode::Fake {
                solve_time_ms,
                due_ms,
                job,
            } => {
                *job = Some((job_id, template));
                *due_ms = if self.fake_blocks_pending > 0 {
                    self.fake_blocks_pending -= 1;
                    Some(now_ms)
                } else {
                    Some(now_ms + *solve_time_ms)
                };
            }
        }
    }

    // -- Timers ------------------------------------------------------------

    pub fn next_wakeup_ms(&self) -> Option<u64> {
        let fake_due = match &self.mode {
            Mode::Fake { due_ms, .. } => *due_ms,
            _ => None,
        };
        match (self.restart_due_ms, fake_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now_ms: u64) {
        if let Some(due) = self.restart_due_ms {
            if now_ms >= due {
                self.restart_now(now_ms);
            }
        }
        if let Mode::Fake { due_ms, job, .. } = &mut self.mode {
            if let (Some(due), Some((job_id, template))) = (*due_ms, *job) {
                if now_ms >= due {
                    *due_ms = None;
                    *job = None;
                    let _ = self.solved_tx.send(MinerEvent::Solved {
                        job_id,
                        template,
                        nonce: 0,
                    });
                }
            }
        }
    }

    /// Test hook: the next `n` templates solve immediately (fake mode).
    pub fn generate_fake_blocks(&mut self, n: u32, now_ms: u64) {
        self.fake_blocks_pending = self.fake_blocks_pending.saturating_add(n);
        if let Mode::Fake { due_ms, job, .. } = &mut self.mode {
            if job.is_some() && self.fake_blocks_pending > 0 {
                self.fake_blocks_pending -= 1;
                *due_ms = Some(now_ms);
            }
        }
    }

    // -- External results --------------------------------------------------

    /// A result arrived from the external solver. Returns the matching
    /// template when the job is known and the nonce actually solves it;
    /// stale or bogus results are dropped silently.
    pub fn on_external_result(&mut self, job_id: u64, nonce: u64) -> Option<BlockTemplate> {
        let Mode::External { ring, .. } = &mut self.mode else {
            return None;
        };
        match ring.get(job_id) {
            Some(template) if template.is_solution(nonce) => ring.take(job_id),
            Some(_) => {
                tracing::debug!(job_id, "external result does not meet difficulty");
                None
            }
            None => {
                tracing::trace!(job_id, "stale external result dropped");
                None
            }
        }
    }

    // -- Finalizer handoff -------------------------------------------------

    /// A `MiningFinalization` peer was selected; local solving stops.
    pub fn on_finalizer_attached(&mut self, peer: NodeId) {
        tracing::info!(peer = %peer, "mining finalizer attached");
        self.finalizer = Some(peer);
        self.stop_current_job();
    }

    /// The finalizer disconnected: fall back to local mode by soft-restart.
    pub fn on_finalizer_detached(&mut self, now_ms: u64) {
        self.finalizer = None;
        if let Some(template) = self.pending_finalize.take().or(self.latest_template) {
            self.set_template(template, now_ms);
        }
    }

    pub fn finalizer(&self) -> Option<NodeId> {
        self.finalizer
    }

    /// The finalizer returned an assembled block; the reactor validates it
    /// and proceeds as if internally mined.
    pub fn on_finalized(&mut self) -> Option<BlockTemplate> {
        self.pending_finalize.take()
    }

    /// Solve a finalizer-completed template locally, bypassing the handoff
    /// and the soft-restart window (finalization already rate-limits).
    pub fn solve_finalized(&mut self, template: BlockTemplate, now_ms: u64) {
        self.latest_template = Some(template);
        self.restart_now(now_ms);
    }

    // -- Shutdown ----------------------------------------------------------

    fn stop_current_job(&mut self) {
        match &mut self.mode {
            Mode::Internal { shared, .. } => {
                let st = shared.state.lock().expect("miner state");
                if let Some(job) = &st.job {
                    job.stop.store(true, Ordering::Relaxed);
                }
            }
            Mode::External { solver, .. } => solver.stop(),
            Mode::Fake { due_ms, job, .. } => {
                *due_ms = None;
                *job = None;
            }
            Mode::Disabled => {}
        }
    }

    /// Flip the stop flag and join every worker thread.
    pub fn hard_abort_safe(&mut self) {
        self.stop_current_job();
        if let Mode::Internal { shared, workers } = &mut self.mode {
            {
                let mut st = shared.state.lock().expect("miner state");
                st.shutdown = true;
                st.job = None;
            }
            shared.cv.notify_all();
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for MinerDriver {
    fn drop(&mut self) {
        self.hard_abort_safe();
    }
}

fn run_worker(idx: usize, shared: Arc<WorkerShared>, tx: Sender<MinerEvent>) {
    let mut last_job_id = 0u64;
    loop {
        let job: Arc<Job> = {
            let mut st = shared.state.lock().expect("miner state");
            loop {
                if st.shutdown {
                    return;
                }
                match &st.job {
                    Some(j) if j.job_id != last_job_id && !j.stop.load(Ordering::Relaxed) => {
                        break j.clone()
                    }
                    _ => st = shared.cv.wait(st).expect("miner state"),
                }
            }
        };
        last_job_id = job.job_id;

        // Work on a private copy of the template; only the stop flag is
        // shared with the driver.
        let mut nonce = job.nonce_seed.wrapping_add(idx as u64);
        'mine: while !job.stop.load(Ordering::Relaxed) {
            for _ in 0..NONCE_BATCH {
                if job.template.is_solution(nonce) {
                    job.stop.store(true, Ordering::Relaxed);
                    let _ = tx.send(MinerEvent::Solved {
                        job_id: job.job_id,
                        template: job.template,
                        nonce,
                    });
                    break 'mine;
                }
                nonce = nonce.wrapping_add(job.stride);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mist_types::{BlockHash, Difficulty};
    use std::sync::mpsc;
    use std::time::Duration;

    fn template(height: u64, difficulty: u32) -> BlockTemplate {
        BlockTemplate {
            height,
            prev: BlockHash::ZERO,
            fees: 100,
            input: [height as u8; 32],
            difficulty: Difficulty(difficulty),
        }
    }

    fn internal(threads: usize) -> (MinerDriver, mpsc::Receiver<MinerEvent>) {
        let (tx, rx) = mpsc::channel();
        let driver = MinerDriver::new(
            MinerConfig {
                threads,
                soft_restart_ms: 1000,
                fake_pow_solve_time_ms: None,
            },
            None,
            tx,
        );
        (driver, rx)
    }

    #[test]
    fn internal_workers_solve_and_report() {
        let (mut driver, rx) = internal(2);
        driver.set_template(template(5, 4), 0);

        let MinerEvent::Solved {
            template: t, nonce, ..
        } = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(t.height, 5);
        assert!(t.is_solution(nonce));
        driver.hard_abort_safe();
    }

    #[test]
    fn soft_restart_window_defers_the_second_restart() {
        let (mut driver, _rx) = internal(1);
        driver.set_template(template(1, 255), 0);
        assert_eq!(driver.current_job_id(), 1);

        // Within the window: no new job yet, deadline armed.
        driver.set_template(template(2, 255), 500);
        assert_eq!(driver.current_job_id(), 1);
        assert_eq!(driver.next_wakeup_ms(), Some(1000));

        driver.on_timer(1000);
        assert_eq!(driver.current_job_id(), 2);
        driver.hard_abort_safe();
    }

    #[test]
    fn restart_after_window_is_immediate() {
        let (mut driver, _rx) = internal(1);
        driver.set_template(template(1, 255), 0);
        driver.set_template(template(2, 255), 1000);
        assert_eq!(driver.current_job_id(), 2);
        assert_eq!(driver.next_wakeup_ms(), None);
        driver.hard_abort_safe();
    }

    #[test]
    fn fake_mode_produces_on_cadence() {
        let (tx, rx) = mpsc::channel();
        let mut driver = MinerDriver::new(
            MinerConfig {
                threads: 0,
                soft_restart_ms: 1000,
                fake_pow_solve_time_ms: Some(15_000),
            },
            None,
            tx,
        );
        driver.set_template(template(1, 30), 0);
        assert_eq!(driver.next_wakeup_ms(), Some(15_000));

        driver.on_timer(14_999);
        assert!(rx.try_recv().is_err());

        driver.on_timer(15_000);
        let MinerEvent::Solved { template: t, .. } = rx.try_recv().unwrap();
        assert_eq!(t.height, 1);
    }

    #[test]
    fn generate_fake_blocks_short_circuits_the_cadence() {
        let (tx, rx) = mpsc::channel();
        let mut driver = MinerDriver::new(
            MinerConfig {
                threads: 0,
                soft_restart_ms: 1000,
                fake_pow_solve_time_ms: Some(15_000),
            },
            None,
            tx,
        );
        driver.generate_fake_blocks(2, 0);
        driver.set_template(template(1, 30), 0);
        driver.on_timer(0);
        assert!(rx.try_recv().is_ok());

        // Second freebie: the next template also solves immediately.
        driver.set_template(template(2, 30), 2000);
        driver.on_timer(2000);
        assert!(rx.try_recv().is_ok());

        // Allowance spent: back to the cadence.
        driver.set_template(template(3, 30), 4000);
        driver.on_timer(4000);
        assert!(rx.try_recv().is_err());
    }

    struct RecordingSolver {
        jobs: Vec<u64>,
    }

    impl ExternalSolver for RecordingSolver {
        fn new_job(&mut self, job_id: u64, _input: [u8; 32], _difficulty: Difficulty) {
            self.jobs.push(job_id);
        }
        fn stop(&mut self) {}
    }

    #[test]
    fn external_results_match_ring_and_drop_stale() {
        let (tx, _rx) = mpsc::channel();
        let mut driver = MinerDriver::new(
            MinerConfig {
                threads: 0,
                soft_restart_ms: 0,
                fake_pow_solve_time_ms: None,
            },
            Some(Box::new(RecordingSolver { jobs: Vec::new() })),
            tx,
        );

        driver.set_template(template(1, 0), 0);
        driver.set_template(template(2, 0), 1);
        // Late answer to the obsolete job 1 is still accepted (ring keeps it).
        let t = driver.on_external_result(1, 0).unwrap();
        assert_eq!(t.height, 1);
        // Unknown job id: dropped.
        assert!(driver.on_external_result(99, 0).is_none());
    }

    #[test]
    fn finalizer_handoff_and_fallback() {
        let (mut driver, _rx) = internal(1);
        let peer = NodeId([3; 32]);
        driver.on_finalizer_attached(peer);

        let action = driver.set_template(template(7, 255), 0);
        assert_eq!(
            action,
            MinerAction::SendToFinalizer {
                peer,
                height: 7,
                fees: 100
            }
        );
        assert!(driver.on_finalized().is_some());
        assert!(driver.on_finalized().is_none());

        // Disconnect falls back to local solving.
        driver.set_template(template(8, 255), 10);
        driver.on_finalizer_detached(5000);
        assert_eq!(driver.finalizer(), None);
        assert!(driver.current_job_id() > 0);
        driver.hard_abort_safe();
    }
}
