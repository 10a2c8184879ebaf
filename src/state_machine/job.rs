use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobEvent, JobState, StateMachine};

/// Distinguishes why a job ended in ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Resolving the item graph failed (handler or initiator error).
    ExecutionFailed,
    /// A sub-fetch reported failure.
    TransferFailed,
    /// A job or order timeout elapsed.
    Timeout,
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobErrorKind::ExecutionFailed => write!(f, "Execution failure"),
            JobErrorKind::TransferFailed => write!(f, "Transfer failure"),
            JobErrorKind::Timeout => write!(f, "Timeout"),
        }
    }
}

/// The terminal error recorded on a job in ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorDetails {
    pub kind: JobErrorKind,
    pub detail: String,
    pub occurred_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BomLifecycle {
    #[default]
    AsBuilt,
    AsPlanned,
    AsSpecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Downward,
    Upward,
}

/// Identifies the entry node of a part chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartChainIdentificationKey {
    pub global_asset_id: String,
    pub bpn: String,
}

impl PartChainIdentificationKey {
    pub fn new(global_asset_id: impl Into<String>, bpn: impl Into<String>) -> Self {
        Self {
            global_asset_id: global_asset_id.into(),
            bpn: bpn.into(),
        }
    }
}

/// Maximum traversal depth used when a request does not set one.
pub const MAX_TREE_DEPTH: u32 = 100;

/// The originating request parameters of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub bom_lifecycle: BomLifecycle,
    pub aspects: Vec<String>,
    pub depth: u32,
    pub direction: Direction,
    pub collect_aspects: bool,
    pub lookup_bpns: bool,
    pub callback_url: Option<String>,
}

impl Default for JobParameter {
    fn default() -> Self {
        Self {
            bom_lifecycle: BomLifecycle::default(),
            aspects: Vec::new(),
            depth: MAX_TREE_DEPTH,
            direction: Direction::default(),
            collect_aspects: false,
            lookup_bpns: false,
            callback_url: None,
        }
    }
}

/// One resolution request tracked through a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner: String,
    pub key: PartChainIdentificationKey,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    pub parameter: JobParameter,
    pub batch_id: Option<Uuid>,
    pub created_on: DateTime<Utc>,
    pub last_modified_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub error: Option<JobErrorDetails>,
    pub completed_transfers: Vec<String>,
}

impl Job {
    pub fn new(owner: impl Into<String>, key: PartChainIdentificationKey, parameter: JobParameter) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            key,
            state: JobState::Unsaved,
            state_history: Vec::new(),
            parameter,
            batch_id: None,
            created_on: now,
            last_modified_on: now,
            started_on: None,
            completed_on: None,
            error: None,
            completed_transfers: Vec::new(),
        }
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies `event` through the state machine, updating the history and
    /// timestamps. Returns the new state, or `None` if the transition is
    /// illegal (the job is left untouched).
    pub(crate) fn apply(&mut self, event: JobEvent) -> Option<JobState> {
        let next = StateMachine::next(self.state, event)?;
        let now = Utc::now();

        tracing::info!(job_id = %self.id, from = %self.state, to = %next, "job transition");
        self.state_history.push(self.state);
        self.state = next;
        self.last_modified_on = now;

        match next {
            JobState::Initial => self.started_on = Some(now),
            s if s.is_terminal() => self.completed_on = Some(now),
            _ => {}
        }
        Some(next)
    }

    /// Moves the job to ERROR and records the failure.
    pub(crate) fn fail(&mut self, kind: JobErrorKind, detail: String) -> Option<JobState> {
        let next = self.apply(JobEvent::Fail)?;
        self.error = Some(JobErrorDetails {
            kind,
            detail,
            occurred_on: self.last_modified_on,
        });
        Some(next)
    }

    /// Number of times the job entered `state`.
    pub fn times_entered(&self, state: JobState) -> usize {
        self.state_history
            .iter()
            .skip(1)
            .chain(std::iter::once(&self.state))
            .filter(|s| **s == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job() -> Job {
        Job::new(
            "tester",
            PartChainIdentificationKey::new("urn:uuid:1", "BPNL0000000001"),
            JobParameter::default(),
        )
    }

    #[test]
    fn job_creation_defaults() {
        let job = make_job();
        assert_eq!(job.state, JobState::Unsaved);
        assert!(job.state_history.is_empty());
        assert!(job.completed_on.is_none());
        assert!(job.error.is_none());
        assert_eq!(job.parameter.depth, MAX_TREE_DEPTH);
    }

    #[test]
    fn apply_records_history_and_timestamps() {
        let mut job = make_job();
        job.apply(JobEvent::Stored).unwrap();
        assert!(job.started_on.is_some());
        job.apply(JobEvent::Complete).unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.state_history, vec![JobState::Unsaved, JobState::Initial]);
        assert!(job.completed_on.is_some());
    }

    #[test]
    fn illegal_event_leaves_job_untouched() {
        let mut job = make_job();
        job.apply(JobEvent::Stored).unwrap();
        job.apply(JobEvent::TransferStarted).unwrap();
        let before = job.clone();

        assert_eq!(job.apply(JobEvent::Complete), None);
        assert_eq!(job, before);
    }

    #[test]
    fn fail_attaches_error_details() {
        let mut job = make_job();
        job.apply(JobEvent::Stored).unwrap();
        job.fail(JobErrorKind::Timeout, "job timed out".into()).unwrap();

        let error = job.error.as_ref().unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(error.kind, JobErrorKind::Timeout);
        assert_eq!(error.detail, "job timed out");
        assert_eq!(Some(error.occurred_on), job.completed_on);
    }

    #[test]
    fn times_entered_counts_visits() {
        let mut job = make_job();
        job.apply(JobEvent::Stored).unwrap();
        job.apply(JobEvent::TransferStarted).unwrap();
        job.apply(JobEvent::TransfersDrained).unwrap();
        assert_eq!(job.times_entered(JobState::TransfersFinished), 1);
        assert_eq!(job.times_entered(JobState::InProgress), 1);
        assert_eq!(job.times_entered(JobState::Completed), 0);
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(JobErrorKind::Timeout.to_string(), "Timeout");
        assert_eq!(JobErrorKind::TransferFailed.to_string(), "Transfer failure");
    }

    #[test]
    fn job_serialization_roundtrip() {
        let job = make_job();
        let json = serde_json::to_string(&job).unwrap();
        let deserialized: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, job);
    }
}
