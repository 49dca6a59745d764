mod cleanup;
mod collaborators;
mod config;
mod container_runtime;
mod coordination;
mod db;
mod error;
mod events;
mod http;
mod leader;
mod models;
mod network;
mod pool;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cleanup::CleanupEngine;
use crate::collaborators::{
    AuditLogger, DatabaseLogArchiver, GitHubRunnerApi, MetricsRecorder, NullProxyRunnerManager,
    OctocrabRunnerApi, ProxyRunnerManager, TracingAuditLogger, TracingMetricsRecorder,
};
use crate::config::{AppConfig, LoggingConfig};
use crate::container_runtime::BollardRuntime;
use crate::coordination::RedisCoordinationStore;
use crate::db::{PostgresStore, RelationalStore, ensure_wildcard_pool};
use crate::events::BroadcastEvents;
use crate::leader::{LeaderElection, LeadershipEvent};
use crate::network::NetworkIsolationManager;
use crate::pool::RunnerPoolManager;

/// Shared composition-root state handed to every axum handler. Each field is
/// a capability handle into one of the four core subsystems: handlers
/// never reach past these into concrete infrastructure.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RelationalStore>,
    pub leader: Arc<LeaderElection>,
    pub network: Arc<NetworkIsolationManager>,
    pub cleanup: Arc<CleanupEngine>,
    pub pool: Arc<RunnerPoolManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging);

    tracing::info!("starting runnerhub control plane");

    let store: Arc<dyn RelationalStore> = {
        let pg = PostgresStore::connect(&config.database.url, config.database.max_connections).await?;
        pg.migrate().await?;
        Arc::new(pg)
    };
    ensure_wildcard_pool(store.as_ref(), &config.pools).await?;

    let coordination = Arc::new(RedisCoordinationStore::new(&config.coordination.url)?);

    let runtime = Arc::new(BollardRuntime::connect(config.container_runtime.socket_path.as_deref())?);
    runtime.ping().await?;

    let events = Arc::new(BroadcastEvents::new(256));

    let network = Arc::new(NetworkIsolationManager::new(
        runtime.clone(),
        store.clone(),
        events.clone(),
        config.network.prefix.clone(),
        config.network.subnet_base_octet,
        config.network.max_idle_secs,
    ));
    network.restore_from_runtime().await?;

    let github: Arc<dyn GitHubRunnerApi> = Arc::new(OctocrabRunnerApi::new(&config.github)?);
    let proxy: Arc<dyn ProxyRunnerManager> = Arc::new(NullProxyRunnerManager);
    let audit: Arc<dyn AuditLogger> = Arc::new(TracingAuditLogger);
    let metrics: Arc<dyn MetricsRecorder> = Arc::new(TracingMetricsRecorder);

    let pool = Arc::new(RunnerPoolManager::new(
        store.clone(),
        github,
        proxy,
        events.clone(),
        audit.clone(),
        metrics.clone(),
        config.pools.clone(),
    ));

    let log_archiver = Arc::new(DatabaseLogArchiver::new(store.clone()));
    let cleanup = Arc::new(CleanupEngine::new(
        runtime.clone(),
        store.clone(),
        network.clone(),
        pool.clone(),
        events.clone(),
        log_archiver,
        audit,
        metrics,
    ));

    let leader = Arc::new(LeaderElection::new(
        config.coordination.lock_key.clone(),
        config.leader.clone(),
        coordination.clone(),
    ));

    let state = AppState {
        store: store.clone(),
        leader: leader.clone(),
        network: network.clone(),
        cleanup: cleanup.clone(),
        pool: pool.clone(),
    };

    let app = Router::new()
        .route("/webhook", post(webhook::webhook))
        .route("/healthz", get(http::healthz))
        .route("/status", get(http::status))
        .route(
            "/pools/{repository}",
            get(http::get_pool).put(http::put_pool),
        )
        .route("/pools/{repository}/scale", post(http::scale_pool))
        .with_state(state);

    let election = {
        let leader = leader.clone();
        tokio::spawn(async move { leader.run().await })
    };

    let singleton_loops = tokio::spawn(run_singleton_loops_when_leader(
        leader.clone(),
        pool.clone(),
        cleanup.clone(),
        network.clone(),
        config.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.http.bind_addr).await?;
    tracing::info!(addr = %config.http.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, releasing leadership if held");
    leader.request_shutdown();
    leader.release().await;
    singleton_loops.abort();
    election.abort();

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received shutdown signal");
}

/// Spawns the leader-only singleton loops (pool monitoring, cleanup sweeps,
/// idle network reclaim) only while this replica holds the lock, aborting
/// them the instant leadership is lost rather than gating each loop body on
/// a flag it polls internally.
async fn run_singleton_loops_when_leader(
    leader: Arc<LeaderElection>,
    pool: Arc<RunnerPoolManager>,
    cleanup: Arc<CleanupEngine>,
    network: Arc<NetworkIsolationManager>,
    config: AppConfig,
) {
    let mut events = leader.subscribe();
    let mut handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // A replica that is already leader by the time this task starts
    // subscribing would otherwise miss the `Acquired` event entirely.
    if leader.is_current_leader() {
        spawn_loops(&mut handles, &pool, &cleanup, &network, &config);
    }

    loop {
        match events.recv().await {
            Ok(LeadershipEvent::Acquired) => {
                tracing::info!("leadership acquired, starting singleton loops");
                spawn_loops(&mut handles, &pool, &cleanup, &network, &config);
            }
            Ok(LeadershipEvent::Lost { reason }) => {
                tracing::info!(reason = %reason, "leadership lost, stopping singleton loops");
                for handle in handles.drain(..) {
                    handle.abort();
                }
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn spawn_loops(
    handles: &mut Vec<tokio::task::JoinHandle<()>>,
    pool: &Arc<RunnerPoolManager>,
    cleanup: &Arc<CleanupEngine>,
    network: &Arc<NetworkIsolationManager>,
    config: &AppConfig,
) {
    handles.push(tokio::spawn(pool.clone().run_monitoring_loop(Duration::from_secs(
        config.pools.monitor_interval_secs,
    ))));

    handles.push(tokio::spawn(cleanup::run_sweep_loop(
        cleanup.clone(),
        Duration::from_secs(config.cleanup.initial_delay_secs),
        Duration::from_secs(config.cleanup.sweep_interval_secs),
    )));

    let network = network.clone();
    let interval = Duration::from_secs(config.network.cleanup_interval_secs);
    handles.push(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = network.cleanup_unused_networks().await;
            if removed > 0 {
                tracing::info!(removed, "reclaimed idle repository networks");
            }
        }
    }));
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::from_default_env();

    match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "runnerhub.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            // Leaked intentionally: the guard must outlive `main` for buffered
            // writes to flush, and this process only ever runs one subscriber.
            Box::leak(Box::new(guard));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(true).with_level(true))
                .init();
        }
    }
}
