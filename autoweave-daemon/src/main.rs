//! # autoweaved
//!
//! The AutoWeave core daemon: wires the USB hot-plug pipeline (observer ->
//! debouncer -> publisher -> durable stream), the plugin discovery path
//! (watcher -> validator -> manager), and the sandboxed worker pool
//! together, then serves a minimal operational endpoint.

mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autoweave_config::{Config, ConfigLoader};
use autoweave_core::events::{ControlBus, ControlEvent};
use autoweave_core::perf::memory::MemoryMonitor;
use autoweave_core::perf::metrics::MetricsRegistry;
use autoweave_core::plugins::manager::{
    ManagerConfig, PluginManager, PluginManagerHandle,
};
use autoweave_core::plugins::validator::ManifestValidator;
use autoweave_core::plugins::watcher::{PluginWatcher, WatcherOptions};
use autoweave_core::usb::backend::RusbBackend;
use autoweave_core::usb::consumer::StreamConsumer;
use autoweave_core::usb::debouncer::{DebouncerConfig, EventDebouncer};
use autoweave_core::usb::observer::{DeviceObserver, ObserverConfig};
use autoweave_core::usb::publisher::{
    BatchPublisher, PublisherConfig, RedisStreamSink,
};
use autoweave_core::workers::host_modules::HostModuleRegistry;
use autoweave_core::workers::pool::{PoolConfig, WorkerPool};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Command line arguments for the AutoWeave daemon.
#[derive(Parser, Debug)]
#[command(name = "autoweaved")]
#[command(about = "AutoWeave core daemon - sandboxed plugin host with a USB hot-plug pipeline")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "AUTOWEAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for the operational endpoint (overrides config)
    #[arg(long, env = "AUTOWEAVE_BIND")]
    bind: Option<String>,

    /// Log filter, e.g. `info` or `autoweave_core=debug`
    #[arg(long, env = "AUTOWEAVE_LOG", default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, warnings) = ConfigLoader::load(args.config.as_deref())
        .context("configuration rejected")?;
    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }
    info!(
        plugin_directory = %config.plugin_directory.display(),
        stream = config.redis.stream,
        "autoweaved starting"
    );

    let metrics = MetricsRegistry::new();
    let bus = Arc::new(ControlBus::new(256));
    spawn_control_log(&bus);

    // Publisher: debouncer batches -> durable stream, with backpressure.
    let sink = RedisStreamSink::connect(&config.redis.url, &config.redis.stream)
        .await
        .context("stream backend unreachable")?;
    let (batch_tx, batch_rx) = mpsc::channel(8);
    let (publisher, publisher_handle, backpressure_rx) = BatchPublisher::new(
        Arc::new(sink),
        publisher_config(&config),
        batch_rx,
        &metrics,
        Arc::clone(&bus),
    );
    publisher.spawn();

    // Debouncer: raw observer events -> coalesced, rate-bounded batches.
    let mut debouncer = EventDebouncer::new(
        DebouncerConfig {
            debounce: config.performance.debounce(),
            max_events_per_second: config.performance.max_events_per_second,
            batch_size: config.performance.batch_size,
            buffer_size: config.performance.event_buffer_size,
        },
        batch_tx,
        &metrics,
    );
    debouncer.set_backpressure(backpressure_rx);
    let debouncer_handle = debouncer.handle();
    debouncer.spawn();

    // Worker pool + plugin manager. The pool and the validator must agree
    // on the importable host module table.
    let host_modules = Arc::new(HostModuleRegistry::builtin());
    let (pool, pool_handle, worker_events) = WorkerPool::new(
        pool_config(&config, Arc::clone(&host_modules)),
        &metrics,
        Arc::clone(&bus),
    )
    .context("worker pool init failed")?;
    pool.spawn();

    let validator = ManifestValidator::new(
        config.worker_pool.max_heap_ceiling_mb,
        &metrics,
    )
    .with_host_modules(host_modules.names());
    let validator_cache = validator.cache();
    let (manager, manager_handle) = PluginManager::new(
        manager_config(&config),
        pool_handle.clone(),
        worker_events,
        validator,
        Arc::clone(&metrics),
        Arc::clone(&bus),
    );
    manager.spawn();

    // Stream consumer: durable stream -> plugin dispatch.
    StreamConsumer::connect(
        &config.redis.url,
        &config.redis.stream,
        manager_handle.clone(),
    )
    .await
    .context("stream consumer init failed")?
    .spawn();

    // Plugin watcher: manifest changes -> manager operations.
    let (watch_tx, watch_rx) = mpsc::channel(64);
    let mut watcher = PluginWatcher::new(
        &config.plugin_directory,
        WatcherOptions {
            debounce: config.watcher.debounce(),
            max_depth: config.watcher.max_depth,
            manifest_only: config.watcher.manifest_only,
        },
        watch_tx,
        &metrics,
    );
    watcher
        .start()
        .await
        .context("plugin watcher init failed")?;
    spawn_watch_bridge(watch_rx, manager_handle.clone());

    // Device observer: kernel hotplug -> debouncer. A missing or
    // hotplug-less USB stack is a component alarm, not a fatal error.
    let mut observer = match RusbBackend::new() {
        Ok(backend) => {
            let mut observer = DeviceObserver::new(
                Arc::new(backend),
                ObserverConfig::default(),
                debouncer_handle.clone(),
                &metrics,
                Arc::clone(&bus),
            );
            observer.start().await.context("observer start failed")?;
            Some(observer)
        }
        Err(err) => {
            warn!(error = %err, "usb backend unavailable, running without observer");
            bus.emit(ControlEvent::ObserverAlarm {
                message: err.to_string(),
            });
            None
        }
    };

    // Memory monitor shrinks registered caches under pressure.
    let mut memory_monitor =
        MemoryMonitor::new(config.memory.clone(), Arc::clone(&bus));
    memory_monitor.register(Arc::new(validator_cache));
    if let Some(observer) = &observer {
        memory_monitor.register(Arc::new(observer.descriptor_cache()));
    }
    memory_monitor.spawn();

    // Operational endpoint.
    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let state = routes::AppState {
        manager: manager_handle.clone(),
        pool: pool_handle.clone(),
        metrics: Arc::clone(&metrics),
        started_at: chrono::Utc::now(),
    };
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!(%bind, "operational endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, routes::router(state)).await {
            error!(error = %err, "operational endpoint failed");
        }
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    // Ordered drain inside the global budget: stop ingestion first, flush
    // the stream, then drain plugins and workers.
    let budget = config.shutdown.timeout();
    let shutdown = async {
        watcher.stop().await;
        if let Some(observer) = observer.as_mut() {
            observer.stop().await;
        }
        drop(observer);
        drop(debouncer_handle);
        if !publisher_handle.force_flush().await {
            warn!("publisher did not drain inside the shutdown budget");
        }
        manager_handle.shutdown().await;
        pool_handle.shutdown().await;
    };
    if tokio::time::timeout(budget + Duration::from_secs(1), shutdown)
        .await
        .is_err()
    {
        warn!("shutdown budget exceeded, hard stop");
    }
    info!("autoweaved stopped");
    Ok(())
}

fn publisher_config(config: &Config) -> PublisherConfig {
    PublisherConfig {
        batch_size: config.performance.batch_size,
        max_retries: config.publisher.max_retries,
        high_water: config.publisher.high_water,
        pending_capacity: config.publisher.pending_capacity,
        drop_on_overflow: config.publisher.drop_on_overflow,
        shutdown_timeout: config.shutdown.timeout(),
        ..PublisherConfig::default()
    }
}

fn pool_config(
    config: &Config,
    host_modules: Arc<HostModuleRegistry>,
) -> PoolConfig {
    PoolConfig {
        min_workers: config.worker_pool.min_workers,
        max_workers: config.worker_pool.max_workers,
        idle_timeout: config.worker_pool.idle_timeout(),
        health_check_interval: config.worker_pool.health_check_interval(),
        host_modules,
        ..PoolConfig::default()
    }
}

fn manager_config(config: &Config) -> ManagerConfig {
    ManagerConfig {
        load_timeout: config.load.timeout(),
        max_concurrent_loads: config.load.max_concurrent,
        hook_timeout: config.worker_pool.hook_timeout(),
        unload_timeout: config.worker_pool.unload_timeout(),
        default_max_heap_mb: config.worker_pool.default_max_heap_mb,
        startup_replay_window: config.performance.startup_replay_window(),
        ..ManagerConfig::default()
    }
}

/// Forwards watcher notifications into manager operations.
fn spawn_watch_bridge(
    mut watch_rx: mpsc::Receiver<
        autoweave_core::plugins::watcher::WatchEvent,
    >,
    manager: PluginManagerHandle,
) {
    tokio::spawn(async move {
        while let Some(event) = watch_rx.recv().await {
            manager.on_watch_event(event).await;
        }
    });
}

/// Logs the control feed so every lifecycle transition is visible in the
/// daemon log.
fn spawn_control_log(bus: &Arc<ControlBus>) {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "autoweave::events", "{json}"),
                    Err(_) => info!(target: "autoweave::events", ?event),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "control feed lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
