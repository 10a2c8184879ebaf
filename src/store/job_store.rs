//! The authoritative collection of jobs.
//!
//! Each job lives in its own slot behind its own mutex, so mutations of the
//! same job serialize while different jobs never contend. The transfer
//! tracker is only touched while the owning job's slot is locked, which makes
//! the "last completion drains the job" check-then-act atomic.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use super::tracker::{Registration, TransferTracker};
use crate::error::JobStoreError;
use crate::state_machine::{Job, JobErrorKind, JobEvent, JobState};

#[derive(Debug)]
struct JobSlot {
    job: Job,
    removed: bool,
}

type SharedSlot = Arc<Mutex<JobSlot>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, JobSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<String, SharedSlot>,
    tracker: TransferTracker,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action` with exclusive access to the job. Returns `None` for
    /// unknown (or concurrently deleted) jobs.
    fn modify<T>(&self, job_id: &str, action: impl FnOnce(&mut Job, &TransferTracker) -> T) -> Option<T> {
        let Some(slot) = self.slot(job_id) else {
            warn!(job_id, "job not found");
            return None;
        };
        let mut guard = lock(&slot);
        if guard.removed {
            warn!(job_id, "job was deleted");
            return None;
        }
        Some(action(&mut guard.job, &self.tracker))
    }

    fn slot(&self, job_id: &str) -> Option<SharedSlot> {
        self.jobs.get(job_id).map(|slot| Arc::clone(slot.value()))
    }

    fn slots(&self) -> Vec<SharedSlot> {
        self.jobs.iter().map(|slot| Arc::clone(slot.value())).collect()
    }

    fn collect(&self, filter: impl Fn(&Job) -> bool) -> Vec<Job> {
        self.slots()
            .iter()
            .filter_map(|slot| {
                let guard = lock(slot);
                (!guard.removed && filter(&guard.job)).then(|| guard.job.clone())
            })
            .collect()
    }

    /// Inserts a new job. The stored copy always starts in INITIAL.
    pub fn create(&self, mut job: Job) -> Result<Job, JobStoreError> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(JobStoreError::DuplicateJob(job.id)),
            Entry::Vacant(vacant) => {
                job.state = JobState::Unsaved;
                job.state_history.clear();
                job.started_on = None;
                job.completed_on = None;
                job.error = None;
                job.completed_transfers.clear();
                job.apply(JobEvent::Stored);

                info!(job_id = %job.id, key = %job.key.global_asset_id, "adding new job into job store");
                let stored = job.clone();
                vacant.insert(Arc::new(Mutex::new(JobSlot { job, removed: false })));
                Ok(stored)
            }
        }
    }

    pub fn find(&self, job_id: &str) -> Option<Job> {
        let slot = self.slot(job_id)?;
        let guard = lock(&slot);
        (!guard.removed).then(|| guard.job.clone())
    }

    /// Finds the job that still has `transfer_id` outstanding.
    pub fn find_by_process_id(&self, transfer_id: &str) -> Option<Job> {
        let job_id = self.tracker.owner_of(transfer_id)?;
        self.find(&job_id)
    }

    pub fn find_all(&self) -> Vec<Job> {
        self.collect(|_| true)
    }

    pub fn find_by_states(&self, states: &[JobState]) -> Vec<Job> {
        self.collect(|job| states.contains(&job.state))
    }

    /// Jobs in `state` whose completion timestamp is strictly before `cutoff`.
    pub fn find_by_state_and_completion_date_older_than(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
    ) -> Vec<Job> {
        self.collect(|job| job.state == state && job.completed_on.is_some_and(|done| done < cutoff))
    }

    pub fn outstanding_transfers(&self, job_id: &str) -> Vec<String> {
        self.tracker.outstanding(job_id)
    }

    /// Registers an outstanding transfer. The first registration moves the
    /// job from INITIAL to IN_PROGRESS.
    ///
    /// Returns the job's state afterwards, or `None` if the job is unknown.
    pub fn add_transfer_process(
        &self,
        job_id: &str,
        transfer_id: &str,
    ) -> Result<Option<JobState>, JobStoreError> {
        info!(job_id, transfer_id, "adding transfer process");
        self.modify(job_id, |job, tracker| {
            if !matches!(job.state, JobState::Initial | JobState::InProgress) {
                return Err(JobStoreError::IllegalJobState {
                    job_id: job.id.clone(),
                    state: job.state,
                    operation: "register transfers",
                });
            }
            match tracker.add(&job.id, transfer_id) {
                Registration::First if job.state == JobState::Initial => {
                    job.apply(JobEvent::TransferStarted);
                }
                Registration::Duplicate => {
                    debug!(job_id = %job.id, transfer_id, "transfer already registered");
                }
                _ => {}
            }
            Ok(job.state)
        })
        .transpose()
    }

    /// Removes an outstanding transfer. Draining the last one moves the job
    /// from IN_PROGRESS to TRANSFERS_FINISHED.
    pub fn complete_transfer_process(
        &self,
        job_id: &str,
        transfer_id: &str,
    ) -> Result<Option<JobState>, JobStoreError> {
        info!(job_id, transfer_id, "completing transfer process");
        self.modify(job_id, |job, tracker| {
            let Some(remaining) = tracker.complete(&job.id, transfer_id) else {
                return Err(JobStoreError::IllegalTransferState {
                    job_id: job.id.clone(),
                    transfer_id: transfer_id.to_string(),
                });
            };
            job.completed_transfers.push(transfer_id.to_string());

            if remaining > 0 {
                info!(job_id = %job.id, remaining, "job has remaining transfers");
            } else if job.state == JobState::InProgress {
                info!(job_id = %job.id, "job has no remaining transfers");
                job.apply(JobEvent::TransfersDrained);
            }
            Ok(job.state)
        })
        .transpose()
    }

    /// Drives the job to COMPLETED. Rejected while transfers are outstanding;
    /// a no-op for jobs that already reached a terminal state.
    pub fn complete_job(&self, job_id: &str) -> Result<Option<JobState>, JobStoreError> {
        info!(job_id, "completing job");
        self.modify(job_id, |job, _| match job.state {
            JobState::Initial | JobState::TransfersFinished => {
                job.apply(JobEvent::Complete);
                Ok(job.state)
            }
            state if state.is_terminal() => {
                info!(job_id = %job.id, %state, "job already finished, cannot complete it");
                Ok(state)
            }
            state => Err(JobStoreError::IllegalJobState {
                job_id: job.id.clone(),
                state,
                operation: "complete",
            }),
        })
        .transpose()
    }

    /// Drives the job to ERROR regardless of outstanding transfers. Jobs that
    /// are already terminal keep their first outcome.
    pub fn mark_job_in_error(
        &self,
        job_id: &str,
        kind: JobErrorKind,
        detail: impl Into<String>,
    ) -> Option<JobState> {
        let detail = detail.into();
        self.modify(job_id, |job, _| {
            if job.is_terminal() {
                info!(job_id = %job.id, state = %job.state, "ignoring error for finished job");
            } else {
                warn!(job_id = %job.id, %kind, detail = %detail, "marking job in error");
                job.fail(kind, detail);
            }
            job.state
        })
    }

    /// Cancels a job that has not finished its transfers yet.
    pub fn cancel_job(&self, job_id: &str) -> Option<JobState> {
        self.modify(job_id, |job, _| {
            if job.apply(JobEvent::Cancel).is_none() {
                info!(job_id = %job.id, state = %job.state, "job cannot be canceled");
            }
            job.state
        })
    }

    /// Removes the job and every transfer reference it still holds.
    ///
    /// The slot stays in the map until its references are forgotten, so a job
    /// re-created under the same id never loses transfers to this delete.
    pub fn delete_job(&self, job_id: &str) -> Option<Job> {
        let slot = self.slot(job_id)?;
        let mut guard = lock(&slot);
        if guard.removed {
            return None;
        }
        guard.removed = true;
        self.tracker.forget_job(job_id);
        self.jobs.remove_if(job_id, |_, current| Arc::ptr_eq(current, &slot));
        info!(job_id, "deleted job");
        Some(guard.job.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
