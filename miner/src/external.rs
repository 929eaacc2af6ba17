//! External proof-of-work solver support.
//!
//! A slow solver may answer a job long after the template moved on; the
//! driver keeps a ring of the last 64 outstanding jobs so a late result is
//! still matched to the template it was solved against. Results for jobs
//! that fell off the ring are stale and dropped silently.

use mist_types::Difficulty;

use crate::template::BlockTemplate;

/// Number of outstanding jobs remembered.
pub const JOB_RING_SIZE: usize = 64;

/// The pluggable solver. `new_job` replaces whatever the solver is working
/// on; solutions come back through the driver as `(job_id, nonce)`.
pub trait ExternalSolver: Send {
    fn new_job(&mut self, job_id: u64, input: [u8; 32], difficulty: Difficulty);
    fn stop(&mut self);
}

/// Fixed-size ring of outstanding job descriptors, slotted by `job_id % 64`.
pub struct JobRing {
    slots: Vec<Option<(u64, BlockTemplate)>>,
}

impl JobRing {
    pub fn new() -> Self {
        Self {
            slots: vec![None; JOB_RING_SIZE],
        }
    }

    pub fn put(&mut self, job_id: u64, template: BlockTemplate) {
        self.slots[(job_id as usize) % JOB_RING_SIZE] = Some((job_id, template));
    }

    /// Look up a job by id; `None` when the slot was reused since.
    pub fn get(&self, job_id: u64) -> Option<&BlockTemplate> {
        match &self.slots[(job_id as usize) % JOB_RING_SIZE] {
            Some((id, template)) if *id == job_id => Some(template),
            _ => None,
        }
    }

    /// Remove and return a job (the solution was accepted).
    pub fn take(&mut self, job_id: u64) -> Option<BlockTemplate> {
        let slot = &mut self.slots[(job_id as usize) % JOB_RING_SIZE];
        match slot {
            Some((id, _)) if *id == job_id => slot.take().map(|(_, t)| t),
            _ => None,
        }
    }
}

impl Default for JobRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_types::BlockHash;

    fn template(height: u64) -> BlockTemplate {
        BlockTemplate {
            height,
            prev: BlockHash::ZERO,
            fees: 0,
            input: [height as u8; 32],
            difficulty: Difficulty(0),
        }
    }

    #[test]
    fn late_jobs_survive_until_overwritten() {
        let mut ring = JobRing::new();
        ring.put(1, template(1));
        ring.put(2, template(2));
        assert_eq!(ring.get(1).unwrap().height, 1);
        assert_eq!(ring.get(2).unwrap().height, 2);
    }

    #[test]
    fn slot_reuse_invalidates_the_old_id() {
        let mut ring = JobRing::new();
        ring.put(1, template(1));
        ring.put(1 + JOB_RING_SIZE as u64, template(65));
        assert!(ring.get(1).is_none());
        assert_eq!(ring.get(65).unwrap().height, 65);
    }

    #[test]
    fn take_consumes_the_slot() {
        let mut ring = JobRing::new();
        ring.put(5, template(5));
        assert!(ring.take(5).is_some());
        assert!(ring.take(5).is_none());
    }
}
