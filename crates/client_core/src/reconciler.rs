use chrono::Utc;
use shared::{
    domain::JobRecord,
    protocol::{JobQueueData, JobUpdate},
};

pub const DEFAULT_COMPLETED_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Most-recent terminal jobs retained, newest first; the oldest entry is
    /// evicted past this.
    pub completed_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            completed_capacity: DEFAULT_COMPLETED_CAPACITY,
        }
    }
}

/// Where a job landed after an update was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    StaysRunning,
    /// Left the running list for the front of completed.
    Promoted,
    /// Back-edge: a terminal job went active again (restart after
    /// failure/cancellation) and moved to the front of running.
    Restarted,
    StaysCompleted,
    /// No record with this id in either list; collections untouched.
    Unknown,
}

/// Merges incremental job updates into the `{running, completed}` pair.
/// Membership is derived from status alone, so the two lists can never
/// disagree with the records they hold.
pub struct JobQueueReconciler {
    config: ReconcilerConfig,
    jobs: JobQueueData,
}

impl JobQueueReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            jobs: JobQueueData::default(),
        }
    }

    pub fn jobs(&self) -> &JobQueueData {
        &self.jobs
    }

    /// Wholesale assignment from an `initial_jobs` payload. Prior state is
    /// discarded, not merged.
    pub fn replace(&mut self, jobs: JobQueueData) {
        self.jobs = jobs;
        self.jobs.completed.truncate(self.config.completed_capacity);
    }

    /// Apply one delta. Unknown ids are reported, never fabricated.
    pub fn apply(&mut self, update: &JobUpdate) -> JobTransition {
        let id = update.job_id;
        if let Some(index) = self.jobs.running.iter().position(|job| job.id == id) {
            if update.status.is_active() {
                self.jobs.running[index] = merged(&self.jobs.running[index], update);
                JobTransition::StaysRunning
            } else {
                let existing = self.jobs.running.remove(index);
                self.jobs.completed.insert(0, merged(&existing, update));
                self.jobs.completed.truncate(self.config.completed_capacity);
                JobTransition::Promoted
            }
        } else if let Some(index) = self.jobs.completed.iter().position(|job| job.id == id) {
            if update.status.is_active() {
                let existing = self.jobs.completed.remove(index);
                self.jobs.running.insert(0, merged(&existing, update));
                JobTransition::Restarted
            } else {
                // In-place: progress ticks on a terminal job must not
                // re-promote it to the front.
                self.jobs.completed[index] = merged(&self.jobs.completed[index], update);
                JobTransition::StaysCompleted
            }
        } else {
            JobTransition::Unknown
        }
    }
}

/// Overlay the delta's fields onto the existing record. Absent fields keep
/// their current values.
fn merged(existing: &JobRecord, update: &JobUpdate) -> JobRecord {
    let mut record = existing.clone();
    record.status = update.status;
    if let Some(progress) = update.progress {
        record.progress = progress.min(100);
    }
    if let Some(result) = &update.result {
        record.result = Some(result.clone());
    }
    if let Some(error) = &update.error {
        record.error_message = Some(error.clone());
    }
    record.updated_at = Utc::now();
    record
}
