use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{
    BomLifecycle, Direction, JobParameter, JobState, PartChainIdentificationKey, ProcessingState,
};

/// How member-job failures escalate to batches and orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Batches complete once every job is terminal; failures stay at job level.
    #[default]
    CollectAll,
    /// Any failed job fails its batch, and any failed batch fails the order.
    FailFast,
}

/// Request parameters shared by every job of a batch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOrderParameter {
    pub bom_lifecycle: BomLifecycle,
    pub aspects: Vec<String>,
    pub depth: u32,
    pub direction: Direction,
    pub collect_aspects: bool,
    pub lookup_bpns: bool,
}

impl Default for BatchOrderParameter {
    fn default() -> Self {
        let job = JobParameter::default();
        Self {
            bom_lifecycle: job.bom_lifecycle,
            aspects: job.aspects,
            depth: job.depth,
            direction: job.direction,
            collect_aspects: job.collect_aspects,
            lookup_bpns: job.lookup_bpns,
        }
    }
}

/// Progress of one job inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub key: PartChainIdentificationKey,
    /// Set once the job has been created in the job store.
    pub job_id: Option<String>,
    pub job_state: JobState,
}

impl JobProgress {
    pub fn pending(key: PartChainIdentificationKey) -> Self {
        Self {
            key,
            job_id: None,
            job_state: JobState::Unsaved,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.job_state.is_terminal()
    }
}

/// A fixed partition of the jobs of one batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub batch_order_id: Uuid,
    /// 1-based position among the order's batches.
    pub batch_number: u32,
    pub batch_total: u32,
    pub batch_state: ProcessingState,
    pub job_progress: Vec<JobProgress>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub owner: String,
    pub batch_url: String,
}

impl Batch {
    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.job_progress.iter().filter_map(|p| p.job_id.as_deref())
    }

    pub fn is_terminal(&self) -> bool {
        self.batch_state.is_terminal()
    }

    /// Derives the batch state from its job progress entries alone.
    pub fn derive_state(&self, policy: FailurePolicy) -> ProcessingState {
        if self.batch_state == ProcessingState::Created && self.job_progress.iter().all(|p| p.job_id.is_none()) {
            return ProcessingState::Created;
        }
        if policy == FailurePolicy::FailFast && self.job_progress.iter().any(|p| p.job_state.is_failure()) {
            return ProcessingState::Error;
        }
        if self.job_progress.iter().any(|p| !p.is_terminal()) {
            ProcessingState::Processing
        } else {
            ProcessingState::Completed
        }
    }

    /// Moves the batch to `next` if legal; stamps `completed_on` on the
    /// first entry into a terminal state. Returns whether the state changed.
    pub fn transition(&mut self, next: ProcessingState) -> bool {
        if self.batch_state == next || !self.batch_state.can_transition_to(next) {
            return false;
        }
        tracing::info!(batch_id = %self.batch_id, from = %self.batch_state, to = %next, "batch transition");
        self.batch_state = next;
        if next == ProcessingState::Processing && self.started_on.is_none() {
            self.started_on = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_on = Some(Utc::now());
        }
        true
    }
}

/// A bulk submission spanning many batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOrder {
    pub batch_order_id: Uuid,
    pub batch_order_state: ProcessingState,
    pub parameter: BatchOrderParameter,
    /// Timeout for the whole order, in seconds.
    pub timeout: u64,
    /// Timeout for each job, in seconds.
    pub job_timeout: u64,
    pub callback_url: Option<String>,
    pub owner: String,
    pub failure_policy: FailurePolicy,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl BatchOrder {
    pub fn new(owner: impl Into<String>, parameter: BatchOrderParameter, timeout: u64, job_timeout: u64) -> Self {
        Self {
            batch_order_id: Uuid::new_v4(),
            batch_order_state: ProcessingState::Created,
            parameter,
            timeout,
            job_timeout,
            callback_url: None,
            owner: owner.into(),
            failure_policy: FailurePolicy::default(),
            created_on: Utc::now(),
            completed_on: None,
        }
    }

    pub fn with_callback_url(mut self, callback_url: impl Into<String>) -> Self {
        self.callback_url = Some(callback_url.into());
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.batch_order_state.is_terminal()
    }

    /// Parameters for a job created on behalf of this order.
    pub fn job_parameter(&self) -> JobParameter {
        JobParameter {
            bom_lifecycle: self.parameter.bom_lifecycle,
            aspects: self.parameter.aspects.clone(),
            depth: self.parameter.depth,
            direction: self.parameter.direction,
            collect_aspects: self.parameter.collect_aspects,
            lookup_bpns: self.parameter.lookup_bpns,
            callback_url: None,
        }
    }

    /// Derives the order state from the states of all of its batches.
    pub fn derive_state(&self, batch_states: &[ProcessingState]) -> ProcessingState {
        if batch_states.is_empty() || batch_states.iter().all(|s| *s == ProcessingState::Created) {
            return ProcessingState::Created;
        }
        if batch_states.iter().any(|s| !s.is_terminal()) {
            return ProcessingState::Processing;
        }
        if self.failure_policy == FailurePolicy::FailFast
            && batch_states.iter().any(|s| *s == ProcessingState::Error)
        {
            ProcessingState::Error
        } else {
            ProcessingState::Completed
        }
    }

    /// Same contract as [`Batch::transition`]; a terminal order never moves.
    pub fn transition(&mut self, next: ProcessingState) -> bool {
        if self.batch_order_state == next || !self.batch_order_state.can_transition_to(next) {
            return false;
        }
        tracing::info!(
            batch_order_id = %self.batch_order_id,
            from = %self.batch_order_state,
            to = %next,
            "batch order transition"
        );
        self.batch_order_state = next;
        if next.is_terminal() {
            self.completed_on = Some(Utc::now());
        }
        true
    }
}
