use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use partchain::batch::{
    BatchOrchestrator, BatchOrder, BatchOrderParameter, BlobPersistence, DirectoryBlobStore, FailurePolicy,
    InMemoryBlobStore, plan_batches,
};
use partchain::callback::{CallbackNotifier, HttpCallbackNotifier, LogNotifier};
use partchain::connector::{Completion, FetchPayload, FetchRequest, SimulatedConnector, StartedTransfer, SubFetchInitiator};
use partchain::error::FetchError;
use partchain::orchestrator::{JobOrchestrator, RetentionPolicy};
use partchain::poller::BoundedPoller;
use partchain::state_machine::{Job, JobErrorKind, JobState, PartChainIdentificationKey, ProcessingState};
use partchain::store::JobStore;

struct Engine {
    store: Arc<JobStore>,
    batches: Arc<BatchOrchestrator>,
    cancel: CancellationToken,
}

impl Engine {
    fn start(
        initiator: Arc<dyn SubFetchInitiator>,
        blobs: Arc<dyn BlobPersistence>,
        notifier: Arc<dyn CallbackNotifier>,
    ) -> Self {
        let poller = BoundedPoller::new(Duration::from_millis(5), Duration::from_secs(10));
        let store = Arc::new(JobStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let jobs = Arc::new(
            JobOrchestrator::new(Arc::clone(&store), initiator, poller.clone(), RetentionPolicy::default())
                .with_events(tx),
        );
        let batches = Arc::new(BatchOrchestrator::new(jobs, blobs, notifier, poller));
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&batches).run(rx, cancel.clone()));
        Self { store, batches, cancel }
    }

    async fn wait_for_order(&self, order_id: Uuid, state: ProcessingState) -> BatchOrder {
        for _ in 0..1000 {
            let order = self.batches.find_order(order_id).await.unwrap().unwrap();
            if order.batch_order_state == state && self.batches.open_orders().await == 0 {
                return order;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("order {order_id} never reached {state}");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn keys(n: usize) -> Vec<PartChainIdentificationKey> {
    (0..n)
        .map(|i| PartChainIdentificationKey::new(format!("urn:uuid:part-{i}"), "BPNL0000000001"))
        .collect()
}

/// Root fetches of gated parts complete only once the gate opens.
struct GatedInitiator {
    gated: HashSet<String>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl SubFetchInitiator for GatedInitiator {
    async fn initiate(&self, job: &Job) -> Result<Vec<FetchRequest>, FetchError> {
        Ok(vec![FetchRequest::root(job)])
    }

    async fn start(&self, _job: &Job, request: FetchRequest) -> Result<StartedTransfer, FetchError> {
        let gated = self.gated.contains(&request.global_asset_id);
        let mut gate = self.gate.clone();
        let completion: Completion = Box::pin(async move {
            if gated {
                gate.wait_for(|open| *open)
                    .await
                    .map_err(|_| FetchError::Transfer("gate dropped".into()))?;
            }
            Ok(FetchPayload::default())
        });
        Ok(StartedTransfer {
            transfer_id: Uuid::new_v4().to_string(),
            completion,
        })
    }
}

#[tokio::test]
async fn simulated_order_resolves_every_part() {
    let poller = BoundedPoller::new(Duration::from_millis(2), Duration::from_secs(5));
    let connector = SimulatedConnector::new(poller, 2, 2, Duration::from_millis(10));
    let engine = Engine::start(Arc::new(connector), Arc::new(InMemoryBlobStore::new()), Arc::new(LogNotifier));

    let order = BatchOrder::new("tester", BatchOrderParameter { depth: 2, ..Default::default() }, 60, 30);
    let planned = plan_batches(&order, &keys(5), 2, "http://localhost:8080");
    let order_id = engine.batches.register_order(order, planned).await.unwrap();

    let order = engine.wait_for_order(order_id, ProcessingState::Completed).await;
    assert!(order.completed_on.is_some());

    let batches = engine.batches.find_batches(order_id).await.unwrap();
    assert_eq!(batches.iter().map(|b| b.job_progress.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
    for batch in &batches {
        assert_eq!(batch.batch_state, ProcessingState::Completed);
        for progress in &batch.job_progress {
            let job = engine.store.find(progress.job_id.as_deref().unwrap()).unwrap();
            assert_eq!(job.state, JobState::Completed);
            assert_eq!(job.batch_id, Some(batch.batch_id));
            // 1 root + 2 children + 4 grandchildren
            assert_eq!(job.completed_transfers.len(), 7);
        }
    }
}

#[tokio::test]
async fn order_stays_processing_until_last_batch_is_terminal() {
    let (open_gate, gate) = watch::channel(false);
    let all_keys = keys(3);
    let initiator = GatedInitiator {
        gated: HashSet::from([all_keys[2].global_asset_id.clone()]),
        gate,
    };
    let engine = Engine::start(Arc::new(initiator), Arc::new(InMemoryBlobStore::new()), Arc::new(LogNotifier));

    let order = BatchOrder::new("tester", BatchOrderParameter::default(), 0, 0);
    let planned = plan_batches(&order, &all_keys, 1, "http://localhost:8080");
    let order_id = engine.batches.register_order(order, planned).await.unwrap();

    let mut batches = Vec::new();
    for _ in 0..500 {
        batches = engine.batches.find_batches(order_id).await.unwrap();
        if batches[2].batch_state == ProcessingState::Processing && batches[2].job_progress[0].job_id.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let batches_now = engine.batches.find_batches(order_id).await.unwrap();
    assert_eq!(batches_now[0].batch_state, ProcessingState::Completed);
    assert_eq!(batches_now[1].batch_state, ProcessingState::Completed);
    assert_eq!(batches_now[2].batch_state, ProcessingState::Processing);
    assert!(!batches_now[2].job_progress[0].is_terminal());
    let order = engine.batches.find_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.batch_order_state, ProcessingState::Processing);

    open_gate.send(true).unwrap();
    engine.wait_for_order(order_id, ProcessingState::Completed).await;
}

#[tokio::test]
async fn fail_fast_order_reports_error() {
    let poller = BoundedPoller::new(Duration::from_millis(2), Duration::from_secs(5));
    let all_keys = keys(4);
    let connector = SimulatedConnector::new(poller, 1, 1, Duration::from_millis(5))
        .with_failing_part(all_keys[1].global_asset_id.clone());
    let engine = Engine::start(Arc::new(connector), Arc::new(InMemoryBlobStore::new()), Arc::new(LogNotifier));

    let order = BatchOrder::new("tester", BatchOrderParameter::default(), 60, 30)
        .with_failure_policy(FailurePolicy::FailFast);
    let planned = plan_batches(&order, &all_keys, 2, "http://localhost:8080");
    let order_id = engine.batches.register_order(order, planned).await.unwrap();

    engine.wait_for_order(order_id, ProcessingState::Error).await;
    let batches = engine.batches.find_batches(order_id).await.unwrap();
    assert_eq!(batches[0].batch_state, ProcessingState::Error);
    assert_eq!(batches[0].job_progress[1].job_state, JobState::Error);
    assert_eq!(batches[1].batch_state, ProcessingState::Error);
    assert!(batches[1].started_on.is_none());
}

#[tokio::test(start_paused = true)]
async fn order_timeout_fails_outstanding_jobs() {
    let (_gate_open, gate) = watch::channel(false);
    let all_keys = keys(2);
    let initiator = GatedInitiator {
        gated: all_keys.iter().map(|k| k.global_asset_id.clone()).collect(),
        gate,
    };
    let engine = Engine::start(Arc::new(initiator), Arc::new(InMemoryBlobStore::new()), Arc::new(LogNotifier));

    let order = BatchOrder::new("tester", BatchOrderParameter::default(), 1, 0);
    let planned = plan_batches(&order, &all_keys, 1, "http://localhost:8080");
    let order_id = engine.batches.register_order(order, planned).await.unwrap();

    engine.wait_for_order(order_id, ProcessingState::Completed).await;
    let batches = engine.batches.find_batches(order_id).await.unwrap();
    assert_eq!(batches[0].batch_state, ProcessingState::Completed);
    assert_eq!(batches[0].job_progress[0].job_state, JobState::Error);
    assert_eq!(batches[1].batch_state, ProcessingState::Error);

    let job = engine.store.find(batches[0].job_progress[0].job_id.as_deref().unwrap()).unwrap();
    assert_eq!(job.error.unwrap().kind, JobErrorKind::Timeout);
}

#[tokio::test]
async fn callbacks_reach_requestor_after_durable_save() {
    let server = MockServer::start().await;
    // batch 1 finishes while the order is still processing
    Mock::given(method("GET"))
        .and(path_regex(r"^/cb/[0-9a-f-]+/PROCESSING$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    // batch 2 and the order itself
    Mock::given(method("GET"))
        .and(path_regex(r"^/cb/[0-9a-f-]+/COMPLETED$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobPersistence> = Arc::new(DirectoryBlobStore::open(dir.path()).await.unwrap());
    let poller = BoundedPoller::new(Duration::from_millis(2), Duration::from_secs(5));
    let connector = SimulatedConnector::new(poller, 1, 1, Duration::from_millis(5));
    let notifier = Arc::new(HttpCallbackNotifier::new().unwrap());
    let engine = Engine::start(Arc::new(connector), Arc::clone(&blobs), notifier);

    let template = format!("{}/cb/{{orderId}}/{{orderState}}?batchId={{batchId}}", server.uri());
    let order = BatchOrder::new("tester", BatchOrderParameter::default(), 60, 30).with_callback_url(template);
    let planned = plan_batches(&order, &keys(2), 1, "http://localhost:8080");
    let order_id = engine.batches.register_order(order, planned).await.unwrap();
    engine.wait_for_order(order_id, ProcessingState::Completed).await;

    let mut received = Vec::new();
    for _ in 0..200 {
        received = server.received_requests().await.unwrap_or_default();
        if received.len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received.len(), 3);
    let order_ping = received
        .iter()
        .find(|r| r.url.query() == Some("batchId="))
        .expect("order callback");
    assert!(order_ping.url.path().ends_with(&format!("{order_id}/COMPLETED")));

    let stored = partchain::batch::BatchOrderStore::new(blobs)
        .find(order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.batch_order_state, ProcessingState::Completed);
    server.verify().await;
}
