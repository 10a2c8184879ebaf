use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of a resolution job.
///
/// A job flows through: INITIAL → IN_PROGRESS → TRANSFERS_FINISHED → COMPLETED,
/// with ERROR and CANCELED reachable from any non-terminal state.
/// `Unsaved` only exists before a job enters the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Unsaved,
    Initial,
    InProgress,
    TransfersFinished,
    Completed,
    Error,
    Canceled,
}

impl JobState {
    /// COMPLETED, ERROR and CANCELED: nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Error | JobState::Canceled)
    }

    /// Terminal states that count as a failed outcome.
    pub fn is_failure(self) -> bool {
        matches!(self, JobState::Error | JobState::Canceled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Unsaved => write!(f, "UNSAVED"),
            JobState::Initial => write!(f, "INITIAL"),
            JobState::InProgress => write!(f, "IN_PROGRESS"),
            JobState::TransfersFinished => write!(f, "TRANSFERS_FINISHED"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Error => write!(f, "ERROR"),
            JobState::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// The events that move a job between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// The job entered the store.
    Stored,
    /// The first outstanding transfer was registered.
    TransferStarted,
    /// The last outstanding transfer completed.
    TransfersDrained,
    /// The caller declared the job complete.
    Complete,
    /// The job failed.
    Fail,
    /// The job was canceled by its owner.
    Cancel,
}

/// The single place where legal job transitions are defined.
pub struct StateMachine;

impl StateMachine {
    /// Returns the state `event` leads to from `from`, or `None` if the
    /// transition is illegal.
    pub fn next(from: JobState, event: JobEvent) -> Option<JobState> {
        use JobEvent::*;
        use JobState::*;

        match (from, event) {
            (Unsaved, Stored) => Some(Initial),
            (Initial, TransferStarted) => Some(InProgress),
            (InProgress, TransfersDrained) => Some(TransfersFinished),
            (Initial | TransfersFinished, Complete) => Some(Completed),
            (Unsaved | Initial | InProgress | TransfersFinished, Fail) => Some(Error),
            (Unsaved | Initial | InProgress, Cancel) => Some(Canceled),
            _ => None,
        }
    }

    pub fn can_apply(from: JobState, event: JobEvent) -> bool {
        Self::next(from, event).is_some()
    }
}

/// Lifecycle shared by batches and batch orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Created,
    Processing,
    Completed,
    Error,
}

impl ProcessingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingState::Completed | ProcessingState::Error)
    }

    /// CREATED → PROCESSING → COMPLETED, with ERROR reachable from either
    /// non-terminal state. Staying in place is always allowed.
    pub fn can_transition_to(self, next: ProcessingState) -> bool {
        use ProcessingState::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Processing) | (Created | Processing, Completed) | (Created | Processing, Error)
        )
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingState::Created => write!(f, "CREATED"),
            ProcessingState::Processing => write!(f, "PROCESSING"),
            ProcessingState::Completed => write!(f, "COMPLETED"),
            ProcessingState::Error => write!(f, "ERROR"),
        }
    }
}
