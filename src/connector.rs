//! The sub-fetch initiator contract and a simulated connector.
//!
//! A [`SubFetchInitiator`] turns a job into fetch requests and starts each
//! one as an asynchronous transfer. Every started transfer yields exactly one
//! completion, carried by [`StartedTransfer::completion`].

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{FetchError, PollingError};
use crate::poller::{BoundedPoller, ProbeOutcome};
use crate::state_machine::Job;

/// One part of the item graph to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchRequest {
    pub global_asset_id: String,
    pub bpn: String,
    /// Distance from the job's root part.
    pub depth: u32,
}

impl FetchRequest {
    pub fn root(job: &Job) -> Self {
        Self {
            global_asset_id: job.key.global_asset_id.clone(),
            bpn: job.key.bpn.clone(),
            depth: 0,
        }
    }

    pub fn child(&self, global_asset_id: impl Into<String>, bpn: impl Into<String>) -> Self {
        Self {
            global_asset_id: global_asset_id.into(),
            bpn: bpn.into(),
            depth: self.depth + 1,
        }
    }
}

/// What a successful fetch delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchPayload {
    /// Related parts discovered by this fetch.
    pub children: Vec<FetchRequest>,
    pub data: serde_json::Value,
}

pub type Completion = Pin<Box<dyn Future<Output = Result<FetchPayload, FetchError>> + Send>>;

pub struct StartedTransfer {
    pub transfer_id: String,
    pub completion: Completion,
}

impl std::fmt::Debug for StartedTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedTransfer")
            .field("transfer_id", &self.transfer_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SubFetchInitiator: Send + Sync {
    /// The root fetches for a freshly stored job. Empty means the job has
    /// nothing to resolve.
    async fn initiate(&self, job: &Job) -> Result<Vec<FetchRequest>, FetchError>;

    async fn start(&self, job: &Job, request: FetchRequest) -> Result<StartedTransfer, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    Requested,
    Finalized,
    Terminated,
}

#[derive(Debug, Clone)]
struct Negotiation {
    ready_at: Instant,
    terminates: bool,
}

impl Negotiation {
    fn state(&self) -> NegotiationState {
        if Instant::now() < self.ready_at {
            NegotiationState::Requested
        } else if self.terminates {
            NegotiationState::Terminated
        } else {
            NegotiationState::Finalized
        }
    }
}

/// An in-process stand-in for a federated connector network.
///
/// Every part has `fanout` children down to `tree_depth`. Each fetch runs a
/// fake contract negotiation that settles after `latency`; the completion
/// waits for it with a [`BoundedPoller`].
pub struct SimulatedConnector {
    poller: BoundedPoller,
    fanout: usize,
    tree_depth: u32,
    latency: Duration,
    failing_parts: HashSet<String>,
    negotiations: Arc<DashMap<String, Negotiation>>,
}

impl SimulatedConnector {
    pub fn new(poller: BoundedPoller, fanout: usize, tree_depth: u32, latency: Duration) -> Self {
        Self {
            poller,
            fanout,
            tree_depth,
            latency,
            failing_parts: HashSet::new(),
            negotiations: Arc::new(DashMap::new()),
        }
    }

    /// Negotiations for `global_asset_id` end TERMINATED.
    pub fn with_failing_part(mut self, global_asset_id: impl Into<String>) -> Self {
        self.failing_parts.insert(global_asset_id.into());
        self
    }

    fn children_of(&self, request: &FetchRequest) -> Vec<FetchRequest> {
        if request.depth >= self.tree_depth {
            return Vec::new();
        }
        (0..self.fanout)
            .map(|i| request.child(format!("{}-{i}", request.global_asset_id), request.bpn.clone()))
            .collect()
    }
}

#[async_trait]
impl SubFetchInitiator for SimulatedConnector {
    async fn initiate(&self, job: &Job) -> Result<Vec<FetchRequest>, FetchError> {
        if job.key.global_asset_id.trim().is_empty() {
            return Err(FetchError::Initiation("job has no global asset id".into()));
        }
        Ok(vec![FetchRequest::root(job)])
    }

    async fn start(&self, _job: &Job, request: FetchRequest) -> Result<StartedTransfer, FetchError> {
        let transfer_id = Uuid::new_v4().to_string();
        self.negotiations.insert(
            transfer_id.clone(),
            Negotiation {
                ready_at: Instant::now() + self.latency,
                terminates: self.failing_parts.contains(&request.global_asset_id),
            },
        );

        let negotiations = Arc::clone(&self.negotiations);
        let probe_id = transfer_id.clone();
        let wait = self.poller.schedule_default("wait for negotiation confirmation", move || {
            let state = negotiations.get(&probe_id).map(|n| n.state());
            let id = probe_id.clone();
            async move {
                match state {
                    Some(NegotiationState::Finalized) => ProbeOutcome::Ready(()),
                    Some(NegotiationState::Terminated) => {
                        ProbeOutcome::Failed(format!("negotiation {id} is in state TERMINATED"))
                    }
                    Some(NegotiationState::Requested) => ProbeOutcome::Pending,
                    None => ProbeOutcome::Failed(format!("negotiation {id} is unknown")),
                }
            }
        });

        let negotiations = Arc::clone(&self.negotiations);
        let done_id = transfer_id.clone();
        let children = self.children_of(&request);
        let completion: Completion = Box::pin(async move {
            let outcome = wait.await;
            negotiations.remove(&done_id);
            match outcome {
                Ok(()) => Ok(FetchPayload {
                    data: serde_json::json!({
                        "globalAssetId": request.global_asset_id,
                        "childCount": children.len(),
                    }),
                    children,
                }),
                Err(PollingError::Failed(reason)) => Err(FetchError::Negotiation(reason)),
                Err(e) => Err(FetchError::Transfer(e.to_string())),
            }
        });

        Ok(StartedTransfer {
            transfer_id,
            completion,
        })
    }
}
