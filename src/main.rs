//! Worker process entry point: parses arguments, loads configuration,
//! wires up the five components in dependency order, and runs until
//! terminated.

use clap::Parser;
use meshcron::config::WorkerConfig;
use meshcron::executor::Executor;
use meshcron::logsink::{LogSink, PgLogStore};
use meshcron::registrar::Registrar;
use meshcron::scheduler::Scheduler;
use meshcron::store::{CoordinationStore, EtcdStore};
use meshcron::watcher::JobWatcher;
use meshcron::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meshcron-worker", version, about = "Distributed cron worker")]
struct Cli {
    /// Path to the worker TOML config file. Defaults to ./worker.toml.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Force debug-level logging regardless of RUST_LOG.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    meshcron::telemetry::init(cli.debug);

    let config = WorkerConfig::load(cli.config.as_deref())?;
    info!(endpoints = ?config.etcd.endpoints, "loaded worker configuration");

    let store: Arc<dyn CoordinationStore> = Arc::new(
        EtcdStore::connect(&config.etcd.endpoints, config.dial_timeout())
            .await
            .map_err(meshcron::Error::from)?,
    );

    let worker_cidr = local_ipv4_cidr().unwrap_or_else(|| "127.0.0.1/32".to_string());

    let log_pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(std::time::Duration::from_millis(
            config.log_store.connect_timeout_ms,
        ))
        .connect(&config.log_store.uri)
        .await
        .map_err(|e| {
            meshcron::Error::Other(anyhow::anyhow!("failed to connect to log store: {e}"))
        })?;
    let log_store = Arc::new(PgLogStore::new(log_pool));
    let log_sink = LogSink::spawn(log_store, config.job_log.batch_size, config.commit_timeout());

    let registrar = Registrar::new(
        store.clone(),
        worker_cidr,
        config.lease.registrar_lease_ttl_secs,
    );
    let watcher = JobWatcher::new(store.clone());
    let executor = Arc::new(Executor::new(
        store.clone(),
        config.lease.worker_lock_ttl_secs,
    ));
    let scheduler = Scheduler::new();

    let shutdown = CancellationToken::new();

    let job_events = watcher.run().await.map_err(meshcron::Error::from)?;
    let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::channel(1000);
    let (result_tx, result_rx) = tokio::sync::mpsc::channel(1000);
    let (log_tx, mut log_rx) = tokio::sync::mpsc::channel(1000);

    let registrar_shutdown = shutdown.clone();
    let registrar_handle = tokio::spawn(async move { registrar.run(registrar_shutdown).await });

    let executor_handle = tokio::spawn(executor.run(dispatch_rx, result_tx));

    let log_forward_handle = tokio::spawn(async move {
        while let Some(result) = log_rx.recv().await {
            log_sink.append(&result);
        }
    });

    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler
            .run(job_events, result_rx, dispatch_tx, log_tx, scheduler_shutdown)
            .await
    });

    tokio::signal::ctrl_c().await.ok();
    info!("received ctrl-c, shutting down");

    shutdown.cancel();
    let _ = scheduler_handle.await;
    let _ = registrar_handle.await;
    drop(executor_handle);
    drop(log_forward_handle);

    Ok(())
}

/// The first non-loopback IPv4 address in the local interface list,
/// in CIDR form (`a.b.c.d/prefix`).
fn local_ipv4_cidr() -> Option<String> {
    let interfaces = get_if_addrs::get_if_addrs().ok()?;
    interfaces.into_iter().find_map(|iface| {
        if iface.is_loopback() {
            return None;
        }
        match iface.addr {
            get_if_addrs::IfAddr::V4(v4) => {
                let prefix_len = u32::from(v4.netmask).count_ones();
                Some(format!("{}/{}", v4.ip, prefix_len))
            }
            get_if_addrs::IfAddr::V6(_) => None,
        }
    })
}
