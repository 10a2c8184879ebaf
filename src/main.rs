use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use partchain::PartchainError;
use partchain::batch::{
    BatchOrchestrator, BatchOrder, BatchOrderParameter, BatchOrderStore, BatchStore, BlobPersistence,
    DirectoryBlobStore, FailurePolicy, InMemoryBlobStore, plan_batches,
};
use partchain::callback::{CallbackNotifier, HttpCallbackNotifier, LogNotifier};
use partchain::cli::{Cli, Command};
use partchain::config::PartchainConfig;
use partchain::connector::SimulatedConnector;
use partchain::logging::init_logging;
use partchain::orchestrator::JobOrchestrator;
use partchain::poller::BoundedPoller;
use partchain::state_machine::PartChainIdentificationKey;
use partchain::store::JobStore;
use partchain::ui::{self, OrderProgress};

struct DemoOptions {
    parts: usize,
    batch_size: Option<usize>,
    depth: u32,
    fanout: usize,
    latency: Duration,
    fail: Vec<usize>,
    fail_fast: bool,
    callback_url: Option<String>,
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.verbose)?;
    let config = PartchainConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Demo {
            parts,
            batch_size,
            depth,
            fanout,
            latency_ms,
            fail,
            fail_fast,
            callback_url,
            in_memory,
        } => {
            let options = DemoOptions {
                parts,
                batch_size,
                depth,
                fanout,
                latency: Duration::from_millis(latency_ms),
                fail,
                fail_fast,
                callback_url,
                in_memory,
            };
            run_demo(&config, options).await
        }
        Command::Orders => {
            let blobs = open_store(&config).await?;
            let mut orders = BatchOrderStore::new(blobs).find_all().await?;
            orders.sort_by_key(|o| o.created_on);
            ui::print_orders(&orders);
            Ok(())
        }
        Command::Batches { order_id } => show_batches(&config, order_id).await,
    }
}

async fn open_store(config: &PartchainConfig) -> Result<Arc<dyn BlobPersistence>> {
    Ok(Arc::new(DirectoryBlobStore::open(&config.store_dir).await?))
}

async fn show_batches(config: &PartchainConfig, order_id: Uuid) -> Result<()> {
    let blobs = open_store(config).await?;
    if BatchOrderStore::new(Arc::clone(&blobs)).find(order_id).await?.is_none() {
        return Err(PartchainError::OrderNotFound(order_id.to_string()).into());
    }
    let mut batches: Vec<_> = BatchStore::new(blobs)
        .find_all()
        .await?
        .into_iter()
        .filter(|b| b.batch_order_id == order_id)
        .collect();
    batches.sort_by_key(|b| b.batch_number);
    ui::print_batches(&batches);
    Ok(())
}

async fn run_demo(config: &PartchainConfig, options: DemoOptions) -> Result<()> {
    let blobs: Arc<dyn BlobPersistence> = if options.in_memory {
        Arc::new(InMemoryBlobStore::new())
    } else {
        open_store(config).await?
    };
    let notifier: Arc<dyn CallbackNotifier> = match options.callback_url {
        Some(_) => Arc::new(HttpCallbackNotifier::new()?),
        None => Arc::new(LogNotifier),
    };

    let poller = config.poller();
    let negotiation_poller = BoundedPoller::new(
        (options.latency / 5).max(Duration::from_millis(5)),
        poller.default_ttl(),
    );
    let keys: Vec<PartChainIdentificationKey> = (0..options.parts)
        .map(|i| PartChainIdentificationKey::new(format!("urn:uuid:demo-part-{i}"), "BPNL00000000DEMO"))
        .collect();
    let connector = options.fail.iter().filter_map(|i| keys.get(*i)).fold(
        SimulatedConnector::new(negotiation_poller, options.fanout, options.depth, options.latency),
        |connector, key| connector.with_failing_part(key.global_asset_id.clone()),
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let jobs = Arc::new(
        JobOrchestrator::new(
            Arc::new(JobStore::new()),
            Arc::new(connector),
            poller.clone(),
            config.retention(),
        )
        .with_events(events_tx),
    );
    let batches = Arc::new(BatchOrchestrator::new(Arc::clone(&jobs), blobs, notifier, poller));

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(Arc::clone(&batches).run(events_rx, cancel.clone()));
    let sweeper = jobs.spawn_cleanup(config.cleanup_interval(), cancel.clone());

    let resumed = batches.resume().await?;
    if resumed > 0 {
        info!(resumed, "resumed unfinished orders from a previous run");
    }

    let policy = if options.fail_fast {
        FailurePolicy::FailFast
    } else {
        config.failure_policy
    };
    let parameter = BatchOrderParameter {
        depth: options.depth,
        ..Default::default()
    };
    let mut order = BatchOrder::new(
        "demo",
        parameter,
        config.default_timeout_secs,
        config.default_job_timeout_secs,
    )
    .with_failure_policy(policy);
    if let Some(url) = options.callback_url {
        order = order.with_callback_url(url);
    }
    let planned = plan_batches(
        &order,
        &keys,
        options.batch_size.unwrap_or(config.default_batch_size),
        &config.public_base_url,
    );

    let progress = OrderProgress::start(&order, keys.len());
    let order_id = batches.register_order(order, planned).await?;
    let finished = loop {
        let current = batches
            .find_order(order_id)
            .await?
            .ok_or_else(|| PartchainError::OrderNotFound(order_id.to_string()))?;
        progress.update(&batches.find_batches(order_id).await?);
        if current.is_terminal() {
            break current;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    batches.flush().await?;
    progress.finish(&finished);
    ui::print_batches(&batches.find_batches(order_id).await?);

    cancel.cancel();
    runner.await?;
    sweeper.await?;
    Ok(())
}
