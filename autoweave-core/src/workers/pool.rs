//! Bounded worker pool with lifecycle and health management.
//!
//! The pool actor owns every worker record; the manager reaches it through
//! a handle and hears back about health and terminations on a worker-event
//! channel keyed by plugin id, not through back-references. Capacity is
//! `[min_workers, max_workers]`: spawning beyond the cap fails with
//! `AtCapacity`, idle workers beyond the floor are reclaimed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use autoweave_model::{PluginId, WorkerId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{ControlBus, ControlEvent, TerminationReason};
use crate::perf::metrics::{Counter, Gauge, MetricsRegistry, counters};
use crate::workers::host_modules::HostModuleRegistry;
use crate::workers::worker::{
    self, PingReport, SandboxEnv, SpawnError, WorkerHandle, WorkerSpec,
};

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("worker pool at capacity")]
    AtCapacity,

    #[error("{0}")]
    Spawn(#[from] SpawnError),

    #[error("worker pool closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    /// How long one health ping may take before counting as missed.
    pub ping_timeout: Duration,
    /// Soft CPU share; sustained use above it for over 10 s terminates.
    pub cpu_share: f64,
    pub cpu_grace: Duration,
    pub ready_timeout: Duration,
    pub epoch_tick: Duration,
    /// Importable host modules beyond the base namespace.
    pub host_modules: Arc<HostModuleRegistry>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(5),
            cpu_share: 0.5,
            cpu_grace: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(15),
            epoch_tick: Duration::from_millis(10),
            host_modules: Arc::new(HostModuleRegistry::builtin()),
        }
    }
}

/// Health and lifecycle notifications flowing to the plugin manager.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    HealthOk {
        plugin: PluginId,
        worker: WorkerId,
    },
    HealthMissed {
        plugin: PluginId,
        worker: WorkerId,
        consecutive: u32,
    },
    Terminated {
        plugin: PluginId,
        worker: WorkerId,
        reason: TerminationReason,
    },
}

enum PoolCommand {
    Spawn {
        spec: WorkerSpec,
        reply: oneshot::Sender<Result<WorkerHandle, PoolError>>,
    },
    Terminate {
        worker: WorkerId,
        reason: TerminationReason,
        reply: Option<oneshot::Sender<()>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub capacity: usize,
}

#[derive(Clone)]
pub struct WorkerPoolHandle {
    tx: mpsc::Sender<PoolCommand>,
}

impl std::fmt::Debug for WorkerPoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerPoolHandle")
    }
}

impl WorkerPoolHandle {
    pub async fn spawn_worker(
        &self,
        spec: WorkerSpec,
    ) -> Result<WorkerHandle, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Spawn { spec, reply })
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)?
    }

    /// Tears a worker down and waits for the record to be gone.
    pub async fn terminate(&self, worker: WorkerId, reason: TerminationReason) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PoolCommand::Terminate {
                worker,
                reason,
                reply: Some(reply),
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Stats { reply }).await.is_err() {
            return PoolStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct WorkerRecord {
    handle: WorkerHandle,
    plugin: PluginId,
    thread: Option<std::thread::JoinHandle<()>>,
    spawned_at: Instant,
    last_activity: Instant,
    missed_pings: u32,
    last_busy: Duration,
    last_invocations: u64,
    over_cpu: Duration,
}

pub struct WorkerPool {
    config: PoolConfig,
    env: Arc<SandboxEnv>,
    rx: mpsc::Receiver<PoolCommand>,
    events: mpsc::Sender<WorkerEvent>,
    bus: Arc<ControlBus>,
    workers: HashMap<WorkerId, WorkerRecord>,
    created: Counter,
    terminated: Counter,
    crashes: Counter,
    resource_kills: Counter,
    health_failures: Counter,
    occupancy: Gauge,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerPool {
    /// Builds the pool actor plus its handle and the worker-event stream
    /// the manager consumes. Call from within the runtime.
    pub fn new(
        config: PoolConfig,
        metrics: &Arc<MetricsRegistry>,
        bus: Arc<ControlBus>,
    ) -> Result<
        (Self, WorkerPoolHandle, mpsc::Receiver<WorkerEvent>),
        PoolError,
    > {
        let env = SandboxEnv::new(
            config.epoch_tick,
            Arc::clone(&config.host_modules),
        )?;
        let (tx, rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(256);
        let pool = Self {
            config,
            env,
            rx,
            events: events_tx,
            bus,
            workers: HashMap::new(),
            created: metrics.counter(counters::WORKERS_CREATED),
            terminated: metrics.counter(counters::WORKERS_TERMINATED),
            crashes: metrics.counter(counters::WORKER_CRASHES),
            resource_kills: metrics.counter(counters::RESOURCE_KILLS),
            health_failures: metrics.counter(counters::HEALTH_FAILURES),
            occupancy: metrics.gauge("pool.workers"),
        };
        Ok((pool, WorkerPoolHandle { tx }, events_rx))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut health =
            tokio::time::interval(self.config.health_check_interval);
        health
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        health.tick().await; // immediate first tick is uninteresting

        info!(
            max_workers = self.config.max_workers,
            "worker pool started"
        );

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(PoolCommand::Spawn { spec, reply }) => {
                            let result = self.spawn_worker(spec).await;
                            let _ = reply.send(result);
                        }
                        Some(PoolCommand::Terminate { worker, reason, reply }) => {
                            self.terminate_worker(worker, reason).await;
                            if let Some(reply) = reply {
                                let _ = reply.send(());
                            }
                        }
                        Some(PoolCommand::Stats { reply }) => {
                            let _ = reply.send(PoolStats {
                                workers: self.workers.len(),
                                capacity: self.config.max_workers,
                            });
                        }
                        Some(PoolCommand::Shutdown { reply }) => {
                            self.shutdown_all().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            self.shutdown_all().await;
                            break;
                        }
                    }
                }
                _ = health.tick() => {
                    self.health_sweep().await;
                    self.reclaim_idle().await;
                }
            }
        }
        info!("worker pool stopped");
    }

    async fn spawn_worker(
        &mut self,
        spec: WorkerSpec,
    ) -> Result<WorkerHandle, PoolError> {
        if self.workers.len() >= self.config.max_workers {
            debug!(
                plugin = %spec.plugin_id,
                "spawn refused, pool at capacity"
            );
            return Err(PoolError::AtCapacity);
        }

        let plugin = spec.plugin_id;
        let (handle, thread) = worker::spawn(
            Arc::clone(&self.env),
            spec,
            self.config.ready_timeout,
        )
        .await?;

        self.created.incr();
        self.bus.emit(ControlEvent::WorkerCreated {
            worker: handle.id,
            plugin,
        });
        info!(worker = %handle.id, %plugin, "worker created");

        let now = Instant::now();
        self.workers.insert(
            handle.id,
            WorkerRecord {
                handle: handle.clone(),
                plugin,
                thread: Some(thread),
                spawned_at: now,
                last_activity: now,
                missed_pings: 0,
                last_busy: Duration::ZERO,
                last_invocations: 0,
                over_cpu: Duration::ZERO,
            },
        );
        self.occupancy.set(self.workers.len() as i64);
        Ok(handle)
    }

    async fn terminate_worker(
        &mut self,
        worker: WorkerId,
        reason: TerminationReason,
    ) {
        let Some(mut record) = self.workers.remove(&worker) else {
            return;
        };
        self.occupancy.set(self.workers.len() as i64);
        self.terminated.incr();
        match reason {
            TerminationReason::MemoryExceeded
            | TerminationReason::CpuExceeded
            | TerminationReason::HookDeadline => self.resource_kills.incr(),
            TerminationReason::Crashed => self.crashes.incr(),
            TerminationReason::Unresponsive => {
                self.health_failures.incr();
            }
            _ => {}
        }

        record.handle.shutdown().await;
        if let Some(thread) = record.thread.take() {
            // Join off the runtime; a stuck hook will be trapped by its
            // epoch deadline and release the thread.
            let _ = tokio::task::spawn_blocking(move || {
                let _ = thread.join();
            })
            .await;
        }

        info!(
            %worker,
            plugin = %record.plugin,
            %reason,
            uptime_s = record.spawned_at.elapsed().as_secs(),
            "worker terminated"
        );
        self.bus.emit(ControlEvent::WorkerTerminated {
            worker,
            plugin: record.plugin,
            reason,
        });
        let _ = self
            .events
            .send(WorkerEvent::Terminated {
                plugin: record.plugin,
                worker,
                reason,
            })
            .await;
    }

    /// Pings every worker; two consecutive misses terminate with
    /// `Unresponsive`. Ping replies also drive CPU-share and heap-denial
    /// enforcement and idle accounting.
    async fn health_sweep(&mut self) {
        let ping_timeout = self.config.ping_timeout;
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();

        let mut kill_list: Vec<(WorkerId, TerminationReason)> = Vec::new();
        for id in ids {
            let Some((handle, plugin)) = self
                .workers
                .get(&id)
                .map(|record| (record.handle.clone(), record.plugin))
            else {
                continue;
            };

            match handle.ping(ping_timeout).await {
                Some(report) => {
                    if let Some(record) = self.workers.get_mut(&id) {
                        record.missed_pings = 0;
                    }
                    self.apply_report(&id, report, &mut kill_list);
                    let _ = self
                        .events
                        .send(WorkerEvent::HealthOk { plugin, worker: id })
                        .await;
                }
                None => {
                    let missed = match self.workers.get_mut(&id) {
                        Some(record) => {
                            record.missed_pings += 1;
                            record.missed_pings
                        }
                        None => continue,
                    };
                    warn!(worker = %id, %plugin, missed, "health ping missed");
                    let _ = self
                        .events
                        .send(WorkerEvent::HealthMissed {
                            plugin,
                            worker: id,
                            consecutive: missed,
                        })
                        .await;
                    if missed >= 2 {
                        kill_list.push((id, TerminationReason::Unresponsive));
                    }
                }
            }
        }

        for (id, reason) in kill_list {
            self.terminate_worker(id, reason).await;
        }
    }

    fn apply_report(
        &mut self,
        id: &WorkerId,
        report: PingReport,
        kill_list: &mut Vec<(WorkerId, TerminationReason)>,
    ) {
        let interval = self.config.health_check_interval;
        let Some(record) = self.workers.get_mut(id) else {
            return;
        };

        if report.memory_denied {
            kill_list.push((*id, TerminationReason::MemoryExceeded));
            return;
        }

        if report.invocations > record.last_invocations {
            record.last_activity = Instant::now();
        }
        record.last_invocations = report.invocations;

        // Soft CPU share: sustained busy time above the share for longer
        // than the grace terminates the worker.
        let busy_delta = report.busy.saturating_sub(record.last_busy);
        record.last_busy = report.busy;
        let share = busy_delta.as_secs_f64() / interval.as_secs_f64();
        if share > self.config.cpu_share {
            record.over_cpu += interval;
            if record.over_cpu > self.config.cpu_grace {
                kill_list.push((*id, TerminationReason::CpuExceeded));
            }
        } else {
            record.over_cpu = Duration::ZERO;
        }
    }

    /// Reclaims idle workers above the warm floor.
    async fn reclaim_idle(&mut self) {
        if self.workers.len() <= self.config.min_workers {
            return;
        }
        let mut idle: Vec<(Instant, WorkerId)> = self
            .workers
            .values()
            .filter(|record| {
                record.last_activity.elapsed() > self.config.idle_timeout
            })
            .map(|record| (record.last_activity, record.handle.id))
            .collect();
        // Oldest-idle first.
        idle.sort_by_key(|(at, _)| *at);

        let reclaimable = self.workers.len() - self.config.min_workers;
        for (_, id) in idle.into_iter().take(reclaimable) {
            self.terminate_worker(id, TerminationReason::Idle).await;
        }
    }

    async fn shutdown_all(&mut self) {
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            self.terminate_worker(id, TerminationReason::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::host_api::HostService;
    use crate::workers::sandbox::CapabilityChecker;
    use autoweave_model::PluginManifest;
    use parking_lot::Mutex;
    use std::path::Path;

    const IDLE_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "init")))
"#;

    fn write_entry(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("entry.wat");
        std::fs::write(&path, IDLE_WAT).unwrap();
        path
    }

    fn spec_named(name: &str, entry: std::path::PathBuf) -> WorkerSpec {
        let manifest: PluginManifest = serde_json::from_str(&format!(
            r#"{{"name":"{name}","version":"1.0.0","entry":"entry.wat"}}"#
        ))
        .unwrap();
        let caps =
            Arc::new(CapabilityChecker::from_manifest(&manifest).unwrap());
        let metrics = MetricsRegistry::new();
        let service = Arc::new(HostService::new(
            Arc::clone(&caps),
            metrics,
            Arc::new(Mutex::new(None)),
        ));
        WorkerSpec {
            plugin_id: PluginId::from_name(name),
            entry_path: entry,
            max_heap_mb: 16,
            caps,
            service,
        }
    }

    fn pool_harness(
        config: PoolConfig,
    ) -> (
        WorkerPoolHandle,
        mpsc::Receiver<WorkerEvent>,
        Arc<MetricsRegistry>,
        Arc<ControlBus>,
    ) {
        let metrics = MetricsRegistry::new();
        let bus = Arc::new(ControlBus::new(64));
        let (pool, handle, events) =
            WorkerPool::new(config, &metrics, Arc::clone(&bus)).unwrap();
        pool.spawn();
        (handle, events, metrics, bus)
    }

    #[tokio::test]
    async fn spawns_up_to_capacity_then_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path());
        let (handle, _events, metrics, _bus) = pool_harness(PoolConfig {
            max_workers: 2,
            ..PoolConfig::default()
        });

        let a = handle
            .spawn_worker(spec_named("a", entry.clone()))
            .await
            .unwrap();
        let _b = handle
            .spawn_worker(spec_named("b", entry.clone()))
            .await
            .unwrap();
        let err = handle
            .spawn_worker(spec_named("c", entry.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity));
        assert_eq!(metrics.counter(counters::WORKERS_CREATED).get(), 2);

        // Freeing a slot admits the queued plugin.
        handle.terminate(a.id, TerminationReason::Draining).await;
        handle
            .spawn_worker(spec_named("c", entry))
            .await
            .unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn termination_reports_reason_on_the_event_stream() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path());
        let (handle, mut events, _metrics, _bus) =
            pool_harness(PoolConfig::default());

        let worker = handle
            .spawn_worker(spec_named("a", entry))
            .await
            .unwrap();
        handle
            .terminate(worker.id, TerminationReason::MemoryExceeded)
            .await;

        match tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            WorkerEvent::Terminated { worker: id, reason, .. } => {
                assert_eq!(id, worker.id);
                assert_eq!(reason, TerminationReason::MemoryExceeded);
            }
            other => panic!("unexpected event {other:?}"),
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn idle_workers_above_floor_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path());
        let (handle, mut events, _metrics, _bus) = pool_harness(PoolConfig {
            min_workers: 1,
            idle_timeout: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(100),
            ..PoolConfig::default()
        });

        handle
            .spawn_worker(spec_named("a", entry.clone()))
            .await
            .unwrap();
        handle
            .spawn_worker(spec_named("b", entry))
            .await
            .unwrap();

        // One of the two should be reclaimed as idle; the floor keeps one.
        let reclaimed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(WorkerEvent::Terminated { reason, .. }) =
                    events.recv().await
                {
                    if reason == TerminationReason::Idle {
                        break;
                    }
                }
            }
        })
        .await;
        assert!(reclaimed.is_ok(), "expected an idle reclaim");
        assert_eq!(handle.stats().await.workers, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_terminates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path());
        let (handle, _events, metrics, _bus) =
            pool_harness(PoolConfig::default());
        handle
            .spawn_worker(spec_named("a", entry.clone()))
            .await
            .unwrap();
        handle
            .spawn_worker(spec_named("b", entry))
            .await
            .unwrap();
        handle.shutdown().await;
        assert_eq!(
            metrics.counter(counters::WORKERS_TERMINATED).get(),
            2
        );
    }
}
