mod job;
mod state;

pub use job::{
    BomLifecycle, Direction, Job, JobErrorDetails, JobErrorKind, JobParameter, MAX_TREE_DEPTH,
    PartChainIdentificationKey,
};
pub use state::{JobEvent, JobState, ProcessingState, StateMachine};
