//! Drives batches and batch orders as their member jobs finish.
//!
//! The orchestrator keeps a working copy of every open order. Batch state is
//! always re-derived by reading member job states from the [`JobStore`];
//! working copies are then saved, and callbacks go out only for states that
//! were saved successfully. Each open order has its own lock, held across
//! its snapshot writes and callbacks; the registry of open orders is only
//! locked for lookups. Snapshots are never written while a job lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{Batch, BatchOrder, FailurePolicy};
use super::store::{BatchOrderStore, BatchStore, BlobPersistence};
use crate::callback::{CallbackNotifier, FinishedNotice, log_delivery};
use crate::error::PersistenceError;
use crate::orchestrator::{JobFinished, JobOrchestrator};
use crate::poller::{BoundedPoller, ProbeOutcome};
use crate::state_machine::{Job, JobErrorKind, JobState, ProcessingState};
use crate::store::JobStore;

struct WorkingSet {
    order: BatchOrder,
    /// Sorted by batch number.
    batches: Vec<Batch>,
    /// The working copy differs from the last successful save.
    dirty: bool,
    /// The order timeout elapsed; unstarted batches will never run.
    expired: bool,
    /// The order callback has been queued.
    notified: bool,
    /// Notices waiting for the next successful save.
    pending: Vec<FinishedNotice>,
    timeout_watch: Option<CancellationToken>,
    /// Removed from the registry; late handles must leave it alone.
    closed: bool,
}

impl WorkingSet {
    fn new(order: BatchOrder, mut batches: Vec<Batch>) -> Self {
        batches.sort_by_key(|b| b.batch_number);
        Self {
            order,
            batches,
            dirty: false,
            expired: false,
            notified: false,
            pending: Vec::new(),
            timeout_watch: None,
            closed: false,
        }
    }

    fn batch_notice(&self, batch: &Batch) -> FinishedNotice {
        FinishedNotice::batch(
            self.order.batch_order_id,
            self.order.batch_order_state,
            batch.batch_id,
            batch.batch_state,
            self.order.callback_url.clone(),
        )
    }

    fn order_notice(&self) -> FinishedNotice {
        FinishedNotice::order(
            self.order.batch_order_id,
            self.order.batch_order_state,
            self.order.callback_url.clone(),
        )
    }
}

type OrderSlot = Arc<Mutex<WorkingSet>>;

/// Open orders, and the order each of their batches belongs to.
#[derive(Default)]
struct Registry {
    orders: HashMap<Uuid, OrderSlot>,
    batch_orders: HashMap<Uuid, Uuid>,
}

impl Registry {
    fn insert(&mut self, set: WorkingSet) -> OrderSlot {
        let order_id = set.order.batch_order_id;
        for batch in &set.batches {
            self.batch_orders.insert(batch.batch_id, order_id);
        }
        let slot = Arc::new(Mutex::new(set));
        self.orders.insert(order_id, Arc::clone(&slot));
        slot
    }

    fn remove(&mut self, order_id: Uuid) {
        self.orders.remove(&order_id);
        self.batch_orders.retain(|_, owner| *owner != order_id);
    }
}

enum Next {
    StartBatch,
    Idle,
}

pub struct BatchOrchestrator {
    jobs: Arc<JobOrchestrator>,
    batches: BatchStore,
    orders: BatchOrderStore,
    notifier: Arc<dyn CallbackNotifier>,
    poller: BoundedPoller,
    working: StdMutex<Registry>,
}

impl BatchOrchestrator {
    pub fn new(
        jobs: Arc<JobOrchestrator>,
        blobs: Arc<dyn BlobPersistence>,
        notifier: Arc<dyn CallbackNotifier>,
        poller: BoundedPoller,
    ) -> Self {
        Self {
            jobs,
            batches: BatchStore::new(Arc::clone(&blobs)),
            orders: BatchOrderStore::new(blobs),
            notifier,
            poller,
            working: StdMutex::new(Registry::default()),
        }
    }

    fn job_store(&self) -> &Arc<JobStore> {
        self.jobs.store()
    }

    // never held across an await
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.working.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, order_id: Uuid) -> Option<OrderSlot> {
        self.registry().orders.get(&order_id).cloned()
    }

    fn slots(&self) -> Vec<OrderSlot> {
        self.registry().orders.values().cloned().collect()
    }

    /// Saves a planned order with its batches and starts the first batch.
    ///
    /// Fails if the initial snapshots cannot be saved; nothing is started then.
    pub async fn register_order(
        self: &Arc<Self>,
        order: BatchOrder,
        batches: Vec<Batch>,
    ) -> Result<Uuid, PersistenceError> {
        let order_id = order.batch_order_id;
        if let Some(foreign) = batches.iter().find(|b| b.batch_order_id != order_id) {
            warn!(%order_id, batch_id = %foreign.batch_id, "batch belongs to another order, skipping");
        }
        let batches: Vec<Batch> = batches.into_iter().filter(|b| b.batch_order_id == order_id).collect();

        for batch in &batches {
            self.batches.save(batch.batch_id, batch).await?;
        }
        self.orders.save(order_id, &order).await?;
        info!(%order_id, batches = batches.len(), "registered batch order");

        let timeout = Duration::from_secs(order.timeout);
        let slot = self.registry().insert(WorkingSet::new(order, batches));
        if !timeout.is_zero() {
            let watch = self.watch_order_timeout(order_id, &slot, timeout);
            slot.lock().await.timeout_watch = Some(watch);
        }

        self.advance(order_id).await;
        Ok(order_id)
    }

    /// Reloads unfinished orders and their batches from persistence.
    ///
    /// Member jobs of a previous run are gone; their progress entries are
    /// closed as ERROR on the next refresh.
    pub async fn resume(self: &Arc<Self>) -> Result<usize, PersistenceError> {
        let orders = self.orders.find_all().await?;
        let mut batches_by_order: HashMap<Uuid, Vec<Batch>> = HashMap::new();
        for batch in self.batches.find_all().await? {
            batches_by_order.entry(batch.batch_order_id).or_default().push(batch);
        }

        let mut resumed = Vec::new();
        for order in orders.into_iter().filter(|o| !o.is_terminal()) {
            let order_id = order.batch_order_id;
            let has_timeout = order.timeout > 0;
            let deadline = order.created_on + chrono::Duration::seconds(order.timeout as i64);
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let batches = batches_by_order.remove(&order_id).unwrap_or_default();

            let slot = {
                let mut registry = self.registry();
                if registry.orders.contains_key(&order_id) {
                    continue;
                }
                registry.insert(WorkingSet::new(order, batches))
            };
            if has_timeout {
                let watch = self.watch_order_timeout(order_id, &slot, remaining);
                slot.lock().await.timeout_watch = Some(watch);
            }
            resumed.push(order_id);
        }

        info!(resumed = resumed.len(), "resumed batch orders");
        for order_id in &resumed {
            self.advance(*order_id).await;
        }
        Ok(resumed.len())
    }

    /// Consumes job events until the channel closes or `cancel` fires. Each
    /// event is handled on its own task so a slow order never holds up
    /// another.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<JobFinished>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.job_finished(event).await });
                    }
                    None => break,
                },
            }
        }
        debug!("batch orchestrator stopped");
    }

    pub async fn job_finished(&self, event: JobFinished) {
        let Some(batch_id) = event.batch_id else {
            return;
        };
        let order_id = self.registry().batch_orders.get(&batch_id).copied();
        match order_id {
            Some(order_id) => self.advance(order_id).await,
            None => debug!(job_id = %event.job_id, %batch_id, "job finished for a closed order"),
        }
    }

    /// Re-derives state and starts the next batch until nothing changes.
    async fn advance(&self, order_id: Uuid) {
        loop {
            match self.refresh_order(order_id).await {
                Next::StartBatch => {
                    if !self.start_next_batch(order_id).await {
                        break;
                    }
                }
                Next::Idle => break,
            }
        }
    }

    async fn refresh_order(&self, order_id: Uuid) -> Next {
        let Some(slot) = self.slot(order_id) else {
            return Next::Idle;
        };
        let mut set = slot.lock().await;
        if set.closed {
            return Next::Idle;
        }
        let set = &mut *set;

        let finished = self.refresh_batches(set);
        let next = self.roll_up(set);
        for batch_id in finished {
            if let Some(batch) = set.batches.iter().find(|b| b.batch_id == batch_id) {
                let notice = set.batch_notice(batch);
                set.pending.push(notice);
            }
        }

        if self.persist(set).await.is_ok() && set.order.is_terminal() && !set.notified {
            set.notified = true;
            let notice = set.order_notice();
            set.pending.push(notice);
        }

        if set.dirty {
            return next;
        }
        // delivered under the order lock so notices keep their order
        let notices = std::mem::take(&mut set.pending);
        self.deliver(notices).await;
        if set.notified {
            set.closed = true;
            if let Some(watch) = set.timeout_watch.take() {
                watch.cancel();
            }
            self.registry().remove(order_id);
            info!(%order_id, "batch order closed");
        }
        next
    }

    /// Copies member job states into the progress entries of started
    /// batches and moves each batch to its derived state. Returns the batches
    /// that became terminal.
    fn refresh_batches(&self, set: &mut WorkingSet) -> Vec<Uuid> {
        let policy = set.order.failure_policy;
        let mut finished = Vec::new();

        for batch in set.batches.iter_mut().filter(|b| b.batch_state == ProcessingState::Processing) {
            for progress in batch.job_progress.iter_mut().filter(|p| !p.is_terminal()) {
                let Some(job_id) = progress.job_id.as_deref() else {
                    continue;
                };
                let state = match self.job_store().find(job_id) {
                    Some(job) => job.state,
                    None => {
                        warn!(job_id, batch_id = %batch.batch_id, "member job is gone, recording it as failed");
                        JobState::Error
                    }
                };
                if state != progress.job_state {
                    progress.job_state = state;
                    set.dirty = true;
                }
            }

            if batch.transition(batch.derive_state(policy)) {
                set.dirty = true;
                if batch.batch_state == ProcessingState::Error {
                    self.cancel_running_jobs(batch);
                }
                if batch.is_terminal() {
                    finished.push(batch.batch_id);
                }
            }
        }

        let stop_unstarted = set.expired
            || (policy == FailurePolicy::FailFast
                && set.batches.iter().any(|b| b.batch_state == ProcessingState::Error));
        if stop_unstarted {
            for batch in set.batches.iter_mut().filter(|b| b.batch_state == ProcessingState::Created) {
                info!(batch_id = %batch.batch_id, "batch will not be started");
                batch.transition(ProcessingState::Error);
                set.dirty = true;
                finished.push(batch.batch_id);
            }
        }
        finished
    }

    /// Cancels member jobs a failed batch no longer waits for.
    fn cancel_running_jobs(&self, batch: &mut Batch) {
        for progress in batch.job_progress.iter_mut().filter(|p| !p.is_terminal()) {
            let Some(job_id) = progress.job_id.as_deref() else {
                continue;
            };
            if let Some(state) = self.jobs.cancel_job(job_id) {
                debug!(job_id, batch_id = %batch.batch_id, %state, "stopped job of failed batch");
                progress.job_state = state;
            }
        }
    }

    fn roll_up(&self, set: &mut WorkingSet) -> Next {
        let states: Vec<ProcessingState> = set.batches.iter().map(|b| b.batch_state).collect();
        let derived = if states.is_empty() {
            ProcessingState::Completed
        } else {
            set.order.derive_state(&states)
        };
        let derived = match derived {
            // batch 1 is about to start
            ProcessingState::Created => ProcessingState::Processing,
            other => other,
        };
        if set.order.transition(derived) {
            set.dirty = true;
        }

        let running = states.contains(&ProcessingState::Processing);
        let waiting = states.contains(&ProcessingState::Created);
        if !set.order.is_terminal() && !running && waiting {
            Next::StartBatch
        } else {
            Next::Idle
        }
    }

    async fn persist(&self, set: &mut WorkingSet) -> Result<(), PersistenceError> {
        if !set.dirty {
            return Ok(());
        }
        for batch in &set.batches {
            self.batches.save(batch.batch_id, batch).await?;
        }
        self.orders.save(set.order.batch_order_id, &set.order).await?;
        set.dirty = false;
        Ok(())
    }

    async fn deliver(&self, notices: Vec<FinishedNotice>) {
        for notice in notices {
            let result = if notice.batch.is_some() {
                self.notifier.batch_finished(&notice).await
            } else {
                self.notifier.order_finished(&notice).await
            };
            log_delivery(result, &notice);
        }
    }

    /// Creates the jobs of the lowest-numbered unstarted batch and starts
    /// them. Returns false if there was nothing to start.
    ///
    /// Job ids are recorded in the batch only once the jobs exist in the job
    /// store, so a refresh racing the start never mistakes them for lost jobs.
    async fn start_next_batch(&self, order_id: Uuid) -> bool {
        let Some(slot) = self.slot(order_id) else {
            return false;
        };
        let (batch_id, jobs, job_timeout) = {
            let mut set = slot.lock().await;
            let set = &mut *set;
            if set.closed || set.order.is_terminal() || set.expired {
                return false;
            }
            let parameter = set.order.job_parameter();
            let job_timeout = Some(Duration::from_secs(set.order.job_timeout)).filter(|t| !t.is_zero());
            let Some(batch) = set
                .batches
                .iter_mut()
                .find(|b| b.batch_state == ProcessingState::Created)
            else {
                return false;
            };

            let batch_id = batch.batch_id;
            let jobs: Vec<Job> = batch
                .job_progress
                .iter()
                .map(|progress| {
                    Job::new(batch.owner.clone(), progress.key.clone(), parameter.clone()).with_batch(batch_id)
                })
                .collect();
            batch.transition(ProcessingState::Processing);
            info!(%order_id, %batch_id, batch_number = batch.batch_number, jobs = jobs.len(), "starting batch");
            set.dirty = true;

            if let Err(e) = self.persist(set).await {
                warn!(%order_id, error = %e, "batch start not yet saved, continuing from working copy");
            }
            (batch_id, jobs, job_timeout)
        };

        let mut started = Vec::with_capacity(jobs.len());
        for job in jobs {
            let job_id = job.id.clone();
            match self.jobs.start_job(job, job_timeout).await {
                Ok(handle) => started.push(Some(handle.job_id)),
                Err(e) => {
                    error!(%order_id, job_id, error = %e, "cannot start job");
                    started.push(None);
                }
            }
        }

        let mut set = slot.lock().await;
        let set = &mut *set;
        let expired = set.expired;
        if let Some(batch) = set.batches.iter_mut().find(|b| b.batch_id == batch_id) {
            for (progress, job_id) in batch.job_progress.iter_mut().zip(started) {
                match job_id {
                    Some(job_id) => progress.job_id = Some(job_id),
                    None => progress.job_state = JobState::Error,
                }
            }
            // the order timed out while these jobs were starting
            if expired {
                for job_id in batch.job_ids() {
                    self.jobs
                        .fail_job(job_id, JobErrorKind::Timeout, "batch order timed out before the job started");
                }
            }
            set.dirty = true;
        }
        true
    }

    fn watch_order_timeout(self: &Arc<Self>, order_id: Uuid, slot: &OrderSlot, timeout: Duration) -> CancellationToken {
        let slot = Arc::downgrade(slot);
        let watch = self.poller.schedule(
            format!("batch order {order_id} timeout"),
            move || {
                let slot = slot.upgrade();
                async move {
                    let open = match slot {
                        Some(slot) => !slot.lock().await.order.is_terminal(),
                        None => false,
                    };
                    if open {
                        ProbeOutcome::Pending
                    } else {
                        ProbeOutcome::Ready(())
                    }
                }
            },
            self.poller.default_interval(),
            timeout,
        );
        let cancel = watch.cancellation_token();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match watch.await {
                Err(e) if e.is_timeout() => this.expire_order(order_id, timeout).await,
                Err(e) => debug!(%order_id, error = %e, "order timeout watch ended"),
                Ok(()) => {}
            }
        });
        cancel
    }

    async fn expire_order(&self, order_id: Uuid, timeout: Duration) {
        let Some(slot) = self.slot(order_id) else {
            return;
        };
        let job_ids: Vec<String> = {
            let mut set = slot.lock().await;
            if set.closed {
                return;
            }
            warn!(%order_id, "batch order timed out");
            set.expired = true;
            set.batches
                .iter()
                .filter(|b| b.batch_state == ProcessingState::Processing)
                .flat_map(|b| b.job_progress.iter())
                .filter(|p| !p.is_terminal())
                .filter_map(|p| p.job_id.clone())
                .collect()
        };

        for job_id in job_ids {
            self.jobs.fail_job(
                &job_id,
                JobErrorKind::Timeout,
                format!("batch order did not finish within {}s", timeout.as_secs()),
            );
        }
        self.advance(order_id).await;
    }

    /// Retries saving every open order whose last save failed, then delivers
    /// notices that were waiting for it. Returns the first save failure.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let order_ids: Vec<Uuid> = self.registry().orders.keys().copied().collect();
        let mut failure = None;
        for order_id in order_ids {
            let Some(slot) = self.slot(order_id) else {
                continue;
            };
            {
                let mut set = slot.lock().await;
                if set.closed {
                    continue;
                }
                if let Err(e) = self.persist(&mut set).await {
                    failure.get_or_insert(e);
                    continue;
                }
            }
            self.refresh_order(order_id).await;
        }
        failure.map_or(Ok(()), Err)
    }

    /// The current view of an order: its working copy while open, the stored
    /// snapshot afterwards.
    pub async fn find_order(&self, order_id: Uuid) -> Result<Option<BatchOrder>, PersistenceError> {
        if let Some(slot) = self.slot(order_id) {
            return Ok(Some(slot.lock().await.order.clone()));
        }
        self.orders.find(order_id).await
    }

    pub async fn find_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, PersistenceError> {
        let order_id = self.registry().batch_orders.get(&batch_id).copied();
        if let Some(slot) = order_id.and_then(|order_id| self.slot(order_id)) {
            let set = slot.lock().await;
            if let Some(batch) = set.batches.iter().find(|b| b.batch_id == batch_id) {
                return Ok(Some(batch.clone()));
            }
        }
        self.batches.find(batch_id).await
    }

    pub async fn find_orders(&self) -> Result<Vec<BatchOrder>, PersistenceError> {
        let mut orders = self.orders.find_all().await?;
        for slot in self.slots() {
            let set = slot.lock().await;
            if let Some(order) = orders.iter_mut().find(|o| o.batch_order_id == set.order.batch_order_id) {
                *order = set.order.clone();
            }
        }
        orders.sort_by_key(|o| o.created_on);
        Ok(orders)
    }

    /// Batches of one order, ordered by batch number.
    pub async fn find_batches(&self, order_id: Uuid) -> Result<Vec<Batch>, PersistenceError> {
        if let Some(slot) = self.slot(order_id) {
            return Ok(slot.lock().await.batches.clone());
        }
        let mut batches: Vec<Batch> = self
            .batches
            .find_all()
            .await?
            .into_iter()
            .filter(|b| b.batch_order_id == order_id)
            .collect();
        batches.sort_by_key(|b| b.batch_number);
        Ok(batches)
    }

    pub async fn open_orders(&self) -> usize {
        self.registry().orders.len()
    }
}
