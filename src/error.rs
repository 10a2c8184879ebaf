use std::time::Duration;

use thiserror::Error;

use crate::state_machine::JobState;

#[derive(Debug, Error)]
pub enum PartchainError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job store error: {0}")]
    JobStore(#[from] JobStoreError),

    #[error("Polling error: {0}")]
    Polling(#[from] PollingError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Batch order not found: {0}")]
    OrderNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Faults raised by Job Store operations on a single job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStoreError {
    #[error("job {0} already exists")]
    DuplicateJob(String),

    #[error("transfer {transfer_id} is not outstanding for job {job_id}")]
    IllegalTransferState { job_id: String, transfer_id: String },

    #[error("job {job_id} cannot {operation} in state {state}")]
    IllegalJobState {
        job_id: String,
        state: JobState,
        operation: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollingError {
    /// The time-to-live elapsed before the probe settled.
    #[error("{description}: no result within {ttl:?}")]
    Timeout { description: String, ttl: Duration },

    /// The probe reported a terminal failure.
    #[error("{0}")]
    Failed(String),

    #[error("polling cancelled")]
    Cancelled,
}

impl PollingError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollingError::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("blob store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored blob {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Failures reported by a sub-fetch initiator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("cannot start fetch: {0}")]
    Initiation(String),

    #[error("fetch failed: {0}")]
    Transfer(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback url is invalid: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("callback endpoint answered with status {0}")]
    Status(u16),
}
