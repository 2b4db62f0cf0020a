//! Beacon consumer worker.
//!
//! Startup order:
//!
//! 1. Load [`WorkerConfig`] from the environment (and `.env`, if present) and
//!    install tracing
//! 2. Install the Prometheus recorder and serve probes on `PROBE_ADDR`
//! 3. Wait for Kafka and `PostgreSQL` (bounded retries), run migrations
//! 4. Join the consumer group and process until SIGTERM or Ctrl+C
//!
//! On a signal the worker stops taking new messages, finishes in-flight
//! work, commits and leaves the group. Work still running after
//! `SHUTDOWN_TIMEOUT_SECS` is abandoned and redelivered to the next owner.
//!
//! Exits non-zero when a dependency cannot be reached within the startup
//! budget.

mod config;
mod server;

use anyhow::Context;
use beacon_core::store::EventStore;
use beacon_postgres::PostgresStore;
use beacon_redpanda::{RedpandaConsumerGroup, RedpandaLog};
use beacon_runtime::metrics::MetricsServer;
use beacon_runtime::startup::{wait_for_log, wait_for_store};
use beacon_runtime::{MessageProcessor, PoisonPolicy, Readiness, Worker};
use config::{LogFormat, WorkerConfig};
use server::ProbeState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LOG_FILTER: &str = "info,beacon=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Local runs may keep settings in a .env file
    let _ = dotenvy::dotenv();
    let config = WorkerConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_format)?;

    info!(
        brokers = %config.brokers,
        consumer_group = %config.consumer_group,
        database = %config.redacted_database_url(),
        poison_policy = %config.poison_policy,
        "Starting beacon worker"
    );

    let mut metrics = MetricsServer::new(config.probe_addr);
    metrics.start().context("Failed to install metrics recorder")?;
    let readiness = Arc::new(Readiness::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let probes = spawn_probe_server(
        &config,
        ProbeState::new(readiness.clone(), Arc::new(metrics)),
        shutdown_rx.clone(),
    )
    .await?;

    let signals = {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutdown signal received, finishing in-flight work");
            shutdown_tx.send_replace(true);
        })
    };

    let result = run(&config, readiness, shutdown_rx).await;

    shutdown_tx.send_replace(true);
    signals.abort();
    match probes.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Probe server failed"),
        Err(e) => warn!(error = %e, "Probe server task failed"),
    }

    match &result {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => error!(error = %format!("{e:#}"), "Worker stopped with an error"),
    }
    result
}

/// Connect, wait for dependencies and run the worker until shutdown.
async fn run(
    config: &WorkerConfig,
    readiness: Arc<Readiness>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let store = Arc::new(
        PostgresStore::connect_lazy(&config.database_url, config.database_max_connections)
            .context("Failed to configure database pool")?,
    );
    let log = RedpandaLog::builder()
        .brokers(&config.brokers)
        .build()
        .context("Failed to create Kafka client")?;

    let policy = config.startup_policy();
    let mut startup_shutdown = shutdown.clone();
    tokio::select! {
        biased;
        _ = startup_shutdown.wait_for(|stop| *stop) => {
            info!("Shutdown requested during startup");
            return Ok(());
        }
        ready = async {
            wait_for_log(&log, &policy).await?;
            wait_for_store(store.as_ref(), &policy).await
        } => ready.context("Dependency unreachable at startup")?,
    }
    store.migrate().await.context("Database migration failed")?;
    readiness.set_store_connected(true);
    info!("Dependencies reachable, joining consumer group");

    let monitor = spawn_store_monitor(store.clone(), readiness.clone(), config);

    let mut processor = MessageProcessor::new(store.clone(), store.clone())
        .with_options(config.processor_options());
    if config.poison_policy == PoisonPolicy::DeadLetter {
        processor = processor.with_dead_letters(store.clone());
    }

    let group = RedpandaConsumerGroup::builder()
        .brokers(&config.brokers)
        .group_id(&config.consumer_group)
        .session_timeout(config.session_timeout)
        .heartbeat_interval(config.heartbeat_interval)
        .build()
        .context("Invalid consumer group settings")?;

    let worker = Worker::new(Arc::new(group), processor)
        .with_options(config.worker_options())
        .with_readiness(readiness);

    let worker_shutdown = shutdown.clone();
    let mut task = tokio::spawn(async move { worker.run(worker_shutdown).await });

    let mut stop = shutdown;
    let outcome = tokio::select! {
        finished = &mut task => Some(finished),
        _ = stop.wait_for(|stop| *stop) => None,
    };
    let finished = match outcome {
        Some(finished) => finished,
        None => match tokio::time::timeout(config.shutdown_timeout, &mut task).await {
            Ok(finished) => finished,
            Err(_) => {
                warn!(
                    timeout = ?config.shutdown_timeout,
                    "Shutdown timed out, abandoning in-flight work"
                );
                task.abort();
                monitor.abort();
                return Ok(());
            }
        },
    };
    monitor.abort();
    finished
        .context("Worker task panicked")?
        .context("Worker failed")
}

/// Bind the probe listener and serve until shutdown.
async fn spawn_probe_server(
    config: &WorkerConfig,
    state: ProbeState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<std::io::Result<()>>> {
    let listener = tokio::net::TcpListener::bind(config.probe_addr)
        .await
        .with_context(|| format!("Failed to bind probe server on {}", config.probe_addr))?;
    info!(addr = %config.probe_addr, "Serving /health/liveness, /health/readiness and /metrics");

    let app = server::router(state);
    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
    }))
}

/// Keep the store flag of [`Readiness`] current.
fn spawn_store_monitor(
    store: Arc<PostgresStore>,
    readiness: Arc<Readiness>,
    config: &WorkerConfig,
) -> JoinHandle<()> {
    let interval = config.heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut connected = true;
        loop {
            ticker.tick().await;
            let now_connected = store.ping().await.is_ok();
            if now_connected != connected {
                if now_connected {
                    info!("Database connection restored");
                } else {
                    warn!("Database unreachable");
                }
                connected = now_connected;
            }
            readiness.set_store_connected(now_connected);
        }
    })
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    installed.context("Failed to install tracing subscriber")
}

/// Wait for Ctrl+C, or SIGTERM on Unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}
