use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connector::{FetchPayload, FetchRequest, SubFetchInitiator};
use crate::error::{FetchError, JobStoreError};
use crate::poller::{BoundedPoller, ProbeOutcome};
use crate::state_machine::{Job, JobErrorKind, JobState};
use crate::store::JobStore;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Published whenever a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFinished {
    pub job_id: String,
    pub state: JobState,
    pub batch_id: Option<Uuid>,
}

/// How long terminal jobs are kept before the retention sweep deletes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub ttl_completed_jobs: Duration,
    pub ttl_failed_jobs: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl_completed_jobs: Duration::from_secs(3600),
            ttl_failed_jobs: Duration::from_secs(3600),
        }
    }
}

/// Identifier and state of a job right after it was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub state: JobState,
}

enum StartFailure {
    /// The job stopped accepting transfers (finished, failed or canceled).
    JobClosed,
    /// A transfer could not be started; the job is already in ERROR.
    Failed,
}

/// Drives jobs through resolution: starts sub-fetches, reacts to their
/// completions, and finishes jobs once no transfer is outstanding.
pub struct JobOrchestrator {
    store: Arc<JobStore>,
    initiator: Arc<dyn SubFetchInitiator>,
    poller: BoundedPoller,
    retention: RetentionPolicy,
    events: Option<mpsc::UnboundedSender<JobFinished>>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<JobStore>,
        initiator: Arc<dyn SubFetchInitiator>,
        poller: BoundedPoller,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            initiator,
            poller,
            retention,
            events: None,
        }
    }

    /// Publish [`JobFinished`] events on `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<JobFinished>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Stores `job`, starts its root fetches and, if given, a timeout watch.
    ///
    /// Resolution failures do not fail the call; they leave the job in ERROR.
    pub async fn start_job(
        self: &Arc<Self>,
        job: Job,
        job_timeout: Option<Duration>,
    ) -> Result<JobHandle, JobStoreError> {
        let job = self.store.create(job)?;
        let job_id = job.id.clone();

        if let Some(timeout) = job_timeout {
            self.watch_job_timeout(job_id.clone(), timeout);
        }

        let requests = match self.initiator.initiate(&job).await {
            Ok(requests) => requests,
            Err(e) => {
                self.fail_job(&job_id, JobErrorKind::ExecutionFailed, e.to_string());
                return Ok(self.handle(&job_id));
            }
        };

        match self.start_transfers(&job, requests).await {
            Ok(0) => {
                info!(job_id = %job_id, "job has nothing to resolve");
                self.complete_if_finished(&job_id);
            }
            Ok(started) => info!(job_id = %job_id, started, "started transfers"),
            Err(StartFailure::Failed | StartFailure::JobClosed) => {}
        }

        Ok(self.handle(&job_id))
    }

    fn handle(&self, job_id: &str) -> JobHandle {
        JobHandle {
            job_id: job_id.to_string(),
            state: self.store.find(job_id).map_or(JobState::Unsaved, |job| job.state),
        }
    }

    /// Starts and registers every request before any completion is awaited,
    /// so the outstanding set cannot drain while sibling transfers are still
    /// being started.
    async fn start_transfers(
        self: &Arc<Self>,
        job: &Job,
        requests: Vec<FetchRequest>,
    ) -> Result<usize, StartFailure> {
        let mut registered = Vec::with_capacity(requests.len());
        let mut failure = None;
        for request in requests {
            if request.depth > job.parameter.depth {
                debug!(job_id = %job.id, part = %request.global_asset_id, "depth limit reached");
                continue;
            }
            let transfer = match self.initiator.start(job, request).await {
                Ok(transfer) => transfer,
                Err(e) => {
                    // fail before spawning so a fast sibling cannot complete the job first
                    self.fail_job(&job.id, JobErrorKind::ExecutionFailed, format!("failed to start a transfer: {e}"));
                    failure = Some(StartFailure::Failed);
                    break;
                }
            };

            match self.store.add_transfer_process(&job.id, &transfer.transfer_id) {
                Ok(Some(_)) => registered.push(transfer),
                Ok(None) | Err(JobStoreError::IllegalJobState { .. }) => {
                    info!(job_id = %job.id, transfer_id = %transfer.transfer_id, "job no longer accepts transfers");
                    failure = Some(StartFailure::JobClosed);
                    break;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "cannot register transfer");
                    failure = Some(StartFailure::JobClosed);
                    break;
                }
            }
        }

        // registered transfers are awaited even after a failure so they drain
        let started = registered.len();
        for transfer in registered {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = transfer.completion.await;
                this.transfer_process_completed(&transfer.transfer_id, outcome).await;
            });
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(started),
        }
    }

    /// Handles the single completion signal of a transfer.
    pub fn transfer_process_completed<'a>(
        self: &'a Arc<Self>,
        transfer_id: &'a str,
        outcome: Result<FetchPayload, FetchError>,
    ) -> BoxFuture<'a, ()> {
        // boxed: completions start transfers whose completions land here again
        Box::pin(async move {
            let Some(job) = self.store.find_by_process_id(transfer_id) else {
                error!(transfer_id, "job not found for transfer");
                return;
            };

            if job.state != JobState::InProgress {
                info!(job_id = %job.id, state = %job.state, transfer_id, "ignoring transfer completion");
                self.drain(&job.id, transfer_id);
                return;
            }

            let payload = match outcome {
                Ok(payload) => payload,
                Err(e) => {
                    self.fail_job(&job.id, JobErrorKind::TransferFailed, e.to_string());
                    self.drain(&job.id, transfer_id);
                    return;
                }
            };

            match self.start_transfers(&job, payload.children).await {
                Ok(started) if started > 0 => info!(job_id = %job.id, started, "started child transfers"),
                Ok(_) => {}
                Err(StartFailure::Failed | StartFailure::JobClosed) => {
                    self.drain(&job.id, transfer_id);
                    return;
                }
            }

            match self.store.complete_transfer_process(&job.id, transfer_id) {
                Ok(Some(JobState::TransfersFinished)) => self.complete_if_finished(&job.id),
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "transfer completion rejected"),
            }
        })
    }

    fn drain(&self, job_id: &str, transfer_id: &str) {
        if let Err(e) = self.store.complete_transfer_process(job_id, transfer_id) {
            debug!(job_id, error = %e, "transfer already drained");
        }
    }

    fn complete_if_finished(&self, job_id: &str) {
        match self.store.complete_job(job_id) {
            Ok(Some(JobState::Completed)) => self.publish(job_id),
            Ok(_) => {}
            Err(e) => warn!(job_id, error = %e, "cannot complete job"),
        }
    }

    /// Marks the job ERROR and publishes its terminal state.
    pub fn fail_job(&self, job_id: &str, kind: JobErrorKind, detail: impl Into<String>) {
        if self.store.mark_job_in_error(job_id, kind, detail).is_some() {
            self.publish(job_id);
        }
    }

    pub fn cancel_job(&self, job_id: &str) -> Option<JobState> {
        let state = self.store.cancel_job(job_id)?;
        if state == JobState::Canceled {
            self.publish(job_id);
        }
        Some(state)
    }

    fn publish(&self, job_id: &str) {
        let Some(job) = self.store.find(job_id) else {
            warn!(job_id, "cannot publish finished event, job not present");
            return;
        };
        if !job.is_terminal() {
            warn!(job_id, state = %job.state, "cannot publish finished event, job not finished");
            return;
        }
        info!(job_id, state = %job.state, "job finished");
        if let Some(events) = &self.events {
            let event = JobFinished {
                job_id: job.id,
                state: job.state,
                batch_id: job.batch_id,
            };
            if events.send(event).is_err() {
                debug!(job_id, "no listener for job events");
            }
        }
    }

    fn watch_job_timeout(self: &Arc<Self>, job_id: String, timeout: Duration) {
        let store = Arc::clone(&self.store);
        let probe_id = job_id.clone();
        let watch = self.poller.schedule(
            format!("job {job_id} timeout"),
            move || {
                let finished = store.find(&probe_id).is_none_or(|job| job.is_terminal());
                async move {
                    if finished {
                        ProbeOutcome::Ready(())
                    } else {
                        ProbeOutcome::Pending
                    }
                }
            },
            self.poller.default_interval(),
            timeout,
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Err(e) = watch.await else {
                return;
            };
            if e.is_timeout() {
                this.fail_job(
                    &job_id,
                    JobErrorKind::Timeout,
                    format!("job did not finish within {}s", timeout.as_secs_f64()),
                );
            }
        });
    }

    pub fn find_and_cleanup_completed_jobs(&self) -> Vec<Job> {
        self.cleanup(JobState::Completed, self.retention.ttl_completed_jobs)
    }

    pub fn find_and_cleanup_failed_jobs(&self) -> Vec<Job> {
        self.cleanup(JobState::Error, self.retention.ttl_failed_jobs)
    }

    fn cleanup(&self, state: JobState, ttl: Duration) -> Vec<Job> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(ttl).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let deleted: Vec<Job> = self
            .store
            .find_by_state_and_completion_date_older_than(state, cutoff)
            .iter()
            .filter_map(|job| self.store.delete_job(&job.id))
            .collect();
        info!(%state, deleted = deleted.len(), remaining = self.store.len(), "retention sweep");
        deleted
    }

    /// Runs both retention sweeps every `interval` until `cancel` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.find_and_cleanup_completed_jobs();
                        this.find_and_cleanup_failed_jobs();
                    }
                }
            }
            debug!("retention sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Completion, SimulatedConnector, StartedTransfer};
    use crate::state_machine::{JobParameter, PartChainIdentificationKey};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn make_job(asset: &str, depth: u32) -> Job {
        Job::new(
            "tester",
            PartChainIdentificationKey::new(asset, "BPNL0000000001"),
            JobParameter {
                depth,
                ..Default::default()
            },
        )
    }

    fn poller() -> BoundedPoller {
        BoundedPoller::new(Duration::from_millis(5), Duration::from_secs(5))
    }

    fn orchestrator(
        initiator: Arc<dyn SubFetchInitiator>,
    ) -> (Arc<JobOrchestrator>, mpsc::UnboundedReceiver<JobFinished>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orch = JobOrchestrator::new(
            Arc::new(JobStore::new()),
            initiator,
            poller(),
            RetentionPolicy::default(),
        )
        .with_events(tx);
        (Arc::new(orch), rx)
    }

    /// Initiator whose transfers complete only when the test says so.
    #[derive(Default)]
    struct ManualInitiator {
        roots: usize,
        pending: Mutex<Vec<(String, oneshot::Sender<Result<FetchPayload, FetchError>>)>>,
    }

    impl ManualInitiator {
        fn with_roots(roots: usize) -> Self {
            Self {
                roots,
                ..Default::default()
            }
        }

        fn take(&self) -> Vec<(String, oneshot::Sender<Result<FetchPayload, FetchError>>)> {
            std::mem::take(&mut *self.pending.lock().unwrap())
        }
    }

    #[async_trait]
    impl SubFetchInitiator for ManualInitiator {
        async fn initiate(&self, job: &Job) -> Result<Vec<FetchRequest>, FetchError> {
            Ok((0..self.roots)
                .map(|i| FetchRequest::root(job).child(format!("part-{i}"), "BPNL0000000001"))
                .collect())
        }

        async fn start(&self, _job: &Job, _request: FetchRequest) -> Result<StartedTransfer, FetchError> {
            let (tx, rx) = oneshot::channel();
            let transfer_id = Uuid::new_v4().to_string();
            self.pending.lock().unwrap().push((transfer_id.clone(), tx));
            let completion: Completion = Box::pin(async move {
                rx.await.unwrap_or_else(|_| Err(FetchError::Transfer("dropped".into())))
            });
            Ok(StartedTransfer {
                transfer_id,
                completion,
            })
        }
    }

    /// Transfers complete as soon as they are awaited; every start after the
    /// first is slow.
    struct StaggeredInitiator {
        roots: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubFetchInitiator for StaggeredInitiator {
        async fn initiate(&self, job: &Job) -> Result<Vec<FetchRequest>, FetchError> {
            Ok((0..self.roots)
                .map(|i| FetchRequest::root(job).child(format!("part-{i}"), "BPNL0000000001"))
                .collect())
        }

        async fn start(&self, _job: &Job, _request: FetchRequest) -> Result<StartedTransfer, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(StartedTransfer {
                transfer_id: format!("t{call}"),
                completion: Box::pin(async { Ok(FetchPayload::default()) }),
            })
        }
    }

    /// Initiation never returns.
    struct HangingInitiator;

    #[async_trait]
    impl SubFetchInitiator for HangingInitiator {
        async fn initiate(&self, _job: &Job) -> Result<Vec<FetchRequest>, FetchError> {
            std::future::pending().await
        }

        async fn start(&self, _job: &Job, _request: FetchRequest) -> Result<StartedTransfer, FetchError> {
            unreachable!()
        }
    }

    struct FailingInitiator;

    #[async_trait]
    impl SubFetchInitiator for FailingInitiator {
        async fn initiate(&self, _job: &Job) -> Result<Vec<FetchRequest>, FetchError> {
            Err(FetchError::Initiation("registry unreachable".into()))
        }

        async fn start(&self, _job: &Job, _request: FetchRequest) -> Result<StartedTransfer, FetchError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn job_without_fetches_completes_immediately() {
        let (orch, mut events) = orchestrator(Arc::new(ManualInitiator::with_roots(0)));

        let handle = orch.start_job(make_job("urn:uuid:a", 5), None).await.unwrap();

        assert_eq!(handle.state, JobState::Completed);
        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, handle.job_id);
        assert_eq!(event.state, JobState::Completed);
    }

    #[tokio::test]
    async fn initiation_failure_marks_job_in_error() {
        let (orch, mut events) = orchestrator(Arc::new(FailingInitiator));

        let handle = orch.start_job(make_job("urn:uuid:a", 5), None).await.unwrap();

        assert_eq!(handle.state, JobState::Error);
        let job = orch.store().find(&handle.job_id).unwrap();
        assert_eq!(job.error.unwrap().kind, JobErrorKind::ExecutionFailed);
        assert_eq!(events.recv().await.unwrap().state, JobState::Error);
    }

    #[tokio::test]
    async fn duplicate_job_is_rejected() {
        let (orch, _events) = orchestrator(Arc::new(ManualInitiator::with_roots(0)));
        let job = make_job("urn:uuid:a", 5);
        orch.start_job(job.clone(), None).await.unwrap();

        assert!(matches!(
            orch.start_job(job, None).await,
            Err(JobStoreError::DuplicateJob(_))
        ));
    }

    #[tokio::test]
    async fn job_completes_after_last_transfer() {
        let initiator = Arc::new(ManualInitiator::with_roots(2));
        let (orch, mut events) = orchestrator(initiator.clone());

        let handle = orch.start_job(make_job("urn:uuid:a", 5), None).await.unwrap();
        assert_eq!(handle.state, JobState::InProgress);

        let mut pending = initiator.take();
        let (_, first) = pending.remove(0);
        first.send(Ok(FetchPayload::default())).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(orch.store().find(&handle.job_id).unwrap().state, JobState::InProgress);

        let (_, second) = pending.remove(0);
        second.send(Ok(FetchPayload::default())).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.state, JobState::Completed);
        let job = orch.store().find(&handle.job_id).unwrap();
        assert_eq!(job.completed_transfers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_root_completion_waits_for_slow_sibling_start() {
        let initiator = Arc::new(StaggeredInitiator {
            roots: 3,
            calls: AtomicUsize::new(0),
        });
        let (orch, mut events) = orchestrator(initiator.clone());

        let handle = orch.start_job(make_job("urn:uuid:a", 5), None).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, handle.job_id);
        assert_eq!(event.state, JobState::Completed);
        let job = orch.store().find(&handle.job_id).unwrap();
        assert_eq!(initiator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.completed_transfers.len(), 3);
        assert_eq!(job.times_entered(JobState::TransfersFinished), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_initiation_is_timed_out() {
        let (orch, mut events) = orchestrator(Arc::new(HangingInitiator));
        let job = make_job("urn:uuid:a", 5);
        let job_id = job.id.clone();

        let starter = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.start_job(job, Some(Duration::from_millis(100))).await })
        };

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.state, JobState::Error);
        let job = orch.store().find(&job_id).unwrap();
        assert_eq!(job.error.unwrap().kind, JobErrorKind::Timeout);
        starter.abort();
    }

    #[tokio::test]
    async fn failed_transfer_marks_job_in_error() {
        let initiator = Arc::new(ManualInitiator::with_roots(1));
        let (orch, mut events) = orchestrator(initiator.clone());
        let handle = orch.start_job(make_job("urn:uuid:a", 5), None).await.unwrap();

        let (_, tx) = initiator.take().remove(0);
        tx.send(Err(FetchError::Transfer("connector offline".into()))).unwrap();

        assert_eq!(events.recv().await.unwrap().state, JobState::Error);
        let job = orch.store().find(&handle.job_id).unwrap();
        assert_eq!(job.error.unwrap().kind, JobErrorKind::TransferFailed);
        assert!(orch.store().outstanding_transfers(&handle.job_id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recursive_resolution_respects_depth() {
        let connector = SimulatedConnector::new(poller(), 2, 3, Duration::from_millis(10));
        let (orch, mut events) = orchestrator(Arc::new(connector));

        let handle = orch.start_job(make_job("urn:uuid:root", 2), None).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, handle.job_id);
        assert_eq!(event.state, JobState::Completed);
        let job = orch.store().find(&handle.job_id).unwrap();
        // root + 2 children + 4 grandchildren
        assert_eq!(job.completed_transfers.len(), 7);
        assert_eq!(job.times_entered(JobState::TransfersFinished), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_failure_fails_job() {
        let connector = SimulatedConnector::new(poller(), 2, 2, Duration::from_millis(10))
            .with_failing_part("urn:uuid:root-1");
        let (orch, mut events) = orchestrator(Arc::new(connector));

        let handle = orch.start_job(make_job("urn:uuid:root", 5), None).await.unwrap();

        assert_eq!(events.recv().await.unwrap().state, JobState::Error);
        let job = orch.store().find(&handle.job_id).unwrap();
        assert!(job.error.unwrap().detail.contains("TERMINATED"));
    }

    #[tokio::test(start_paused = true)]
    async fn job_timeout_marks_job_in_error() {
        let initiator = Arc::new(ManualInitiator::with_roots(1));
        let (orch, mut events) = orchestrator(initiator.clone());

        let handle = orch
            .start_job(make_job("urn:uuid:a", 5), Some(Duration::from_millis(100)))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.state, JobState::Error);
        let job = orch.store().find(&handle.job_id).unwrap();
        assert_eq!(job.error.unwrap().kind, JobErrorKind::Timeout);

        // the late completion is drained without reviving the job
        let (_, tx) = initiator.take().remove(0);
        tx.send(Ok(FetchPayload::default())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orch.store().find(&handle.job_id).unwrap().state, JobState::Error);
        assert!(orch.store().outstanding_transfers(&handle.job_id).is_empty());
    }

    #[tokio::test]
    async fn cancel_publishes_event() {
        let initiator = Arc::new(ManualInitiator::with_roots(1));
        let (orch, mut events) = orchestrator(initiator);
        let handle = orch.start_job(make_job("urn:uuid:a", 5), None).await.unwrap();

        assert_eq!(orch.cancel_job(&handle.job_id), Some(JobState::Canceled));
        assert_eq!(events.recv().await.unwrap().state, JobState::Canceled);
    }

    #[tokio::test]
    async fn retention_sweep_deletes_old_terminal_jobs() {
        let store = Arc::new(JobStore::new());
        let orch = Arc::new(JobOrchestrator::new(
            Arc::clone(&store),
            Arc::new(ManualInitiator::with_roots(0)),
            poller(),
            RetentionPolicy {
                ttl_completed_jobs: Duration::ZERO,
                ttl_failed_jobs: Duration::from_secs(3600),
            },
        ));
        let done = orch.start_job(make_job("urn:uuid:a", 5), None).await.unwrap();
        let failed = store.create(make_job("urn:uuid:b", 5)).unwrap();
        store.mark_job_in_error(&failed.id, JobErrorKind::ExecutionFailed, "x");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let deleted = orch.find_and_cleanup_completed_jobs();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, done.job_id);

        assert!(orch.find_and_cleanup_failed_jobs().is_empty());
        assert!(store.find(&failed.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn background_cleanup_runs_until_cancelled() {
        let store = Arc::new(JobStore::new());
        let orch = Arc::new(JobOrchestrator::new(
            Arc::clone(&store),
            Arc::new(ManualInitiator::with_roots(0)),
            poller(),
            RetentionPolicy {
                ttl_completed_jobs: Duration::ZERO,
                ttl_failed_jobs: Duration::ZERO,
            },
        ));
        orch.start_job(make_job("urn:uuid:a", 5), None).await.unwrap();
        let cancel = CancellationToken::new();

        let sweeper = orch.spawn_cleanup(Duration::from_millis(50), cancel.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        sweeper.await.unwrap();

        assert!(store.is_empty());
    }
}
