// gateway: Edge gateway between a fleet of TCP scales and the Cloud API.
//
// Startup wiring only — all behavior lives in the library modules.  The
// service graph is constructed here and passed around explicitly; the only
// process-wide state is the edge identity held inside the REST client.

use gateway::activity::{self, ActivityMonitor};
use gateway::batches::{self, BatchManager};
use gateway::cloud::identity::EdgeRegistrar;
use gateway::cloud::rest::{self, RestClient};
use gateway::cloud::sync::{self, CloudSyncService};
use gateway::events::EventProcessor;
use gateway::registry::DeviceRegistry;
use gateway::server::ScaleServer;
use gateway::session_cache::{self, SessionCache};
use gateway::storage::Store;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let cfg = match gateway::config::load_config() {
        Ok(cfg) => {
            info!(
                tcp = format!("{}:{}", cfg.tcp.host, cfg.tcp.port),
                cloud = %cfg.cloud.api_url,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // Durable store + crash recovery: no socket survives a restart, and
    // events caught mid-stream go back to pending.
    let store = match Store::open(Path::new(&cfg.storage.sqlite_path)) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(e) => {
            eprintln!("FATAL: failed to open store '{}': {e}", cfg.storage.sqlite_path);
            std::process::exit(1);
        }
    };
    {
        let mut store = store.lock().await;
        if let Err(e) = store.mark_all_devices_disconnected() {
            eprintln!("FATAL: store recovery failed: {e}");
            std::process::exit(1);
        }
        match store.demote_streaming_events() {
            Ok(0) => {}
            Ok(n) => info!(events = n, "recovered in-flight events to pending"),
            Err(e) => {
                eprintln!("FATAL: store recovery failed: {e}");
                std::process::exit(1);
            }
        }
    }

    // Cloud client: stored identity (valid or not) plus the registrar that
    // repairs it on demand.
    let client = match RestClient::new(cfg.cloud.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("FATAL: failed to build cloud client: {e}");
            std::process::exit(1);
        }
    };
    match store.lock().await.load_identity() {
        Ok(Some(identity)) => {
            info!(edge_id = %identity.edge_id, "stored edge identity loaded");
            client.install_identity(identity);
        }
        Ok(None) => info!("no stored edge identity, will register on first request"),
        Err(e) => warn!(error = %e, "failed to load stored identity"),
    }
    client.set_identity_ensurer(Arc::new(EdgeRegistrar::new(Arc::clone(&store))));

    // Service graph.
    let registry = match DeviceRegistry::load(Arc::clone(&store)).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("FATAL: failed to load device registry: {e}");
            std::process::exit(1);
        }
    };
    let batch_manager = Arc::new(BatchManager::new(
        Arc::clone(&store),
        cfg.offline.trigger_delay_ms,
        cfg.offline.max_events_per_batch,
        cfg.offline.retention_days,
    ));
    let event_processor = Arc::new(EventProcessor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&batch_manager),
    ));
    let monitor = Arc::new(ActivityMonitor::new(
        Arc::clone(&registry),
        cfg.heartbeat.clone(),
        cfg.activity.clone(),
    ));
    let sessions = Arc::new(SessionCache::new(
        Arc::clone(&registry),
        Arc::clone(&client),
        cfg.session_cache.clone(),
    ));
    let sync_service = Arc::new(CloudSyncService::new(
        Arc::clone(&event_processor),
        Arc::clone(&batch_manager),
        Arc::clone(&registry),
        Arc::clone(&client),
        cfg.sync.clone(),
    ));

    let scale_server = match ScaleServer::bind(
        &cfg.tcp.host,
        cfg.tcp.port,
        Arc::clone(&registry),
        Arc::clone(&event_processor),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}:{}: {e}", cfg.tcp.host, cfg.tcp.port);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        tokio::spawn(scale_server.run(shutdown_rx.clone())),
        activity::spawn_monitor_task(Arc::clone(&monitor), shutdown_rx.clone()),
        activity::spawn_status_reporter_task(
            monitor,
            Arc::clone(&registry),
            Arc::clone(&client),
            shutdown_rx.clone(),
        ),
        session_cache::spawn_poll_task(Arc::clone(&sessions), shutdown_rx.clone()),
        session_cache::spawn_cleanup_task(Arc::clone(&sessions), shutdown_rx.clone()),
        batches::spawn_transition_task(
            Arc::clone(&batch_manager),
            Arc::clone(&client),
            shutdown_rx.clone(),
        ),
        batches::spawn_retention_task(batch_manager, shutdown_rx.clone()),
        rest::spawn_queue_flush_task(Arc::clone(&client), shutdown_rx.clone()),
        sync::spawn_sync_task(sync_service, shutdown_rx.clone()),
    ];

    // Startup session poll; also the first probe that settles online vs
    // offline before events start arriving.
    tokio::spawn(async move { sessions.poll_once().await });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping tasks");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("task did not stop within grace period");
        }
    }
    info!("gateway stopped");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
