//! Plugin manager: the authoritative per-plugin state machine.
//!
//! One actor owns the plugin table exclusively; everything else talks to it
//! through [`PluginManagerHandle`]. Loads run as spawned tasks bounded by a
//! concurrency cap and report back over an internal channel, so the actor
//! never blocks on a worker. Worker health and terminations arrive on the
//! pool's event stream keyed by plugin id; the manager holds the only
//! owning references.
//!
//! Hot reload spins the replacement worker up first and swaps it into the
//! dispatch path in a single actor step, so the switchover is atomic with
//! respect to event delivery.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use autoweave_model::{
    DeviceAction, HookDevicePayload, HookKind, ManifestHash,
    PluginDescriptor, PluginId, PluginManifest, PluginMetrics,
    PluginPriority, PluginState, StreamEvent, WorkerId,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{ControlBus, ControlEvent, TerminationReason};
use crate::perf::metrics::{Counter, MetricsRegistry, counters};
use crate::plugins::validator::{ManifestValidator, resolve_entry};
use crate::plugins::watcher::WatchEvent;
use crate::workers::host_api::{HostService, StateStore};
use crate::workers::pool::{PoolError, WorkerEvent, WorkerPoolHandle};
use crate::workers::sandbox::CapabilityChecker;
use crate::workers::worker::{HookError, WorkerHandle, WorkerSpec};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub load_timeout: Duration,
    pub max_concurrent_loads: usize,
    pub hook_timeout: Duration,
    pub unload_timeout: Duration,
    pub default_max_heap_mb: u32,
    /// Rolling window for hook-error accounting.
    pub error_window: Duration,
    pub max_errors_in_window: u32,
    pub max_consecutive_crashes: u32,
    pub startup_replay_window: Duration,
    /// Delay before retrying a load refused with `AtCapacity`.
    pub capacity_retry_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            max_concurrent_loads: 3,
            hook_timeout: Duration::from_secs(5),
            unload_timeout: Duration::from_secs(2),
            default_max_heap_mb: 128,
            error_window: Duration::from_secs(600),
            max_errors_in_window: 3,
            max_consecutive_crashes: 3,
            startup_replay_window: Duration::from_secs(60),
            capacity_retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
enum LoadFailure {
    Pool(PoolError),
    Hook(HookError),
    Timeout,
}

impl std::fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadFailure::Pool(err) => write!(f, "pool: {err}"),
            LoadFailure::Hook(err) => write!(f, "onLoad: {err}"),
            LoadFailure::Timeout => f.write_str("load deadline exceeded"),
        }
    }
}

enum ManagerCommand {
    ManifestAdded {
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        bytes: Vec<u8>,
    },
    ManifestChanged {
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        bytes: Vec<u8>,
    },
    ManifestRemoved {
        manifest_path: PathBuf,
    },
    Get {
        id: PluginId,
        reply: oneshot::Sender<Option<PluginDescriptor>>,
    },
    List {
        reply: oneshot::Sender<Vec<PluginDescriptor>>,
    },
    SetPriority {
        id: PluginId,
        priority: PluginPriority,
        reply: oneshot::Sender<bool>,
    },
    Dispatch {
        event: StreamEvent,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    // Internal follow-ups from spawned tasks.
    LoadFinished {
        id: PluginId,
        generation: u64,
        result: Result<WorkerHandle, LoadFailure>,
    },
    RetryLoad {
        id: PluginId,
        generation: u64,
    },
    DrainFinished {
        id: PluginId,
    },
    HookFailed {
        id: PluginId,
        worker: WorkerId,
        hook: HookKind,
        error: HookError,
    },
}

/// Public face of the manager actor.
#[derive(Clone)]
pub struct PluginManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
}

impl std::fmt::Debug for PluginManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PluginManagerHandle")
    }
}

impl PluginManagerHandle {
    pub async fn on_manifest_added(
        &self,
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        bytes: Vec<u8>,
    ) {
        let _ = self
            .tx
            .send(ManagerCommand::ManifestAdded {
                manifest_path,
                bundle_dir,
                bytes,
            })
            .await;
    }

    pub async fn on_manifest_changed(
        &self,
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        bytes: Vec<u8>,
    ) {
        let _ = self
            .tx
            .send(ManagerCommand::ManifestChanged {
                manifest_path,
                bundle_dir,
                bytes,
            })
            .await;
    }

    pub async fn on_manifest_removed(&self, manifest_path: PathBuf) {
        let _ = self
            .tx
            .send(ManagerCommand::ManifestRemoved { manifest_path })
            .await;
    }

    /// Routes a watcher notification to the matching operation.
    pub async fn on_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added {
                manifest_path,
                bundle_dir,
                bytes,
                ..
            } => self.on_manifest_added(manifest_path, bundle_dir, bytes).await,
            WatchEvent::Changed {
                manifest_path,
                bundle_dir,
                bytes,
                ..
            } => {
                self.on_manifest_changed(manifest_path, bundle_dir, bytes)
                    .await
            }
            WatchEvent::Removed { manifest_path, .. } => {
                self.on_manifest_removed(manifest_path).await
            }
        }
    }

    pub async fn get(&self, id: PluginId) -> Option<PluginDescriptor> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ManagerCommand::Get { id, reply }).await.ok()?;
        rx.await.ok()?
    }

    pub async fn list(&self) -> Vec<PluginDescriptor> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::List { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn set_priority(
        &self,
        id: PluginId,
        priority: PluginPriority,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ManagerCommand::SetPriority { id, priority, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Fire-and-forget dispatch of one consumed stream event.
    pub async fn dispatch_stream_event(&self, event: StreamEvent) {
        let _ = self.tx.send(ManagerCommand::Dispatch { event }).await;
    }

    /// Drains every active plugin, then stops the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// One load waiting for a slot. Startup ordering is strict by priority,
/// then FIFO within a priority (stable via the sequence number).
struct QueuedLoad {
    priority: PluginPriority,
    sequence: u64,
    id: PluginId,
    generation: u64,
}

impl PartialEq for QueuedLoad {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedLoad {}

impl PartialOrd for QueuedLoad {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedLoad {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

struct PendingReload {
    manifest: PluginManifest,
    hash: ManifestHash,
    caps: Arc<CapabilityChecker>,
}

struct PluginEntry {
    id: PluginId,
    manifest: PluginManifest,
    manifest_path: PathBuf,
    bundle_dir: PathBuf,
    hash: ManifestHash,
    state: PluginState,
    priority: PluginPriority,
    caps: Arc<CapabilityChecker>,
    worker: Option<WorkerHandle>,
    generation: u64,
    pending_reload: Option<PendingReload>,
    removal_pending: bool,
    state_store: StateStore,
    errors: VecDeque<Instant>,
    consecutive_crashes: u32,
    metrics: PluginMetrics,
    last_error: Option<String>,
}

impl PluginEntry {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: self.id,
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            state: self.state,
            priority: self.priority,
            manifest_hash: self.hash,
            worker_id: self.worker.as_ref().map(|worker| worker.id),
            metrics: self.metrics.clone(),
            state_snapshot_len: self
                .state_store
                .lock()
                .as_ref()
                .map(Vec::len),
        }
    }
}

pub struct PluginManager {
    config: ManagerConfig,
    pool: WorkerPoolHandle,
    validator: ManifestValidator,
    metrics: Arc<MetricsRegistry>,
    bus: Arc<ControlBus>,
    rx: mpsc::Receiver<ManagerCommand>,
    internal_tx: mpsc::Sender<ManagerCommand>,
    internal_rx: mpsc::Receiver<ManagerCommand>,
    worker_events: mpsc::Receiver<WorkerEvent>,
    entries: HashMap<PluginId, PluginEntry>,
    by_path: HashMap<PathBuf, PluginId>,
    load_queue: BinaryHeap<QueuedLoad>,
    load_sequence: u64,
    active_loads: usize,
    boot: Instant,
    replay_buffer: Vec<(StreamEvent, HashSet<PluginId>)>,
    plugin_loads: Counter,
    plugin_errors: Counter,
    dispatched: Counter,
    hot_reloads: Counter,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.entries.len())
            .field("queued_loads", &self.load_queue.len())
            .finish()
    }
}

impl PluginManager {
    pub fn new(
        config: ManagerConfig,
        pool: WorkerPoolHandle,
        worker_events: mpsc::Receiver<WorkerEvent>,
        validator: ManifestValidator,
        metrics: Arc<MetricsRegistry>,
        bus: Arc<ControlBus>,
    ) -> (Self, PluginManagerHandle) {
        let (tx, rx) = mpsc::channel(128);
        let (internal_tx, internal_rx) = mpsc::channel(128);
        let manager = Self {
            config,
            pool,
            validator,
            plugin_loads: metrics.counter(counters::PLUGIN_LOADS),
            plugin_errors: metrics.counter(counters::PLUGIN_ERRORS),
            dispatched: metrics.counter(counters::DISPATCHED_EVENTS),
            hot_reloads: metrics.counter(counters::HOT_RELOADS),
            metrics,
            bus,
            rx,
            internal_tx,
            internal_rx,
            worker_events,
            entries: HashMap::new(),
            by_path: HashMap::new(),
            load_queue: BinaryHeap::new(),
            load_sequence: 0,
            active_loads: 0,
            boot: Instant::now(),
            replay_buffer: Vec::new(),
        };
        (manager, PluginManagerHandle { tx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("plugin manager started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(ManagerCommand::Shutdown { reply }) => {
                            self.shutdown_all().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Some(command) = self.internal_rx.recv() => {
                    self.handle_command(command).await;
                }
                Some(event) = self.worker_events.recv() => {
                    self.handle_worker_event(event);
                }
            }
            self.pump_loads();
        }
        info!("plugin manager stopped");
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::ManifestAdded {
                manifest_path,
                bundle_dir,
                bytes,
            } => self.manifest_added(manifest_path, bundle_dir, bytes),
            ManagerCommand::ManifestChanged {
                manifest_path,
                bundle_dir,
                bytes,
            } => self.manifest_changed(manifest_path, bundle_dir, bytes),
            ManagerCommand::ManifestRemoved { manifest_path } => {
                self.manifest_removed(&manifest_path);
            }
            ManagerCommand::Get { id, reply } => {
                let _ = reply
                    .send(self.entries.get(&id).map(PluginEntry::descriptor));
            }
            ManagerCommand::List { reply } => {
                let mut list: Vec<PluginDescriptor> = self
                    .entries
                    .values()
                    .map(PluginEntry::descriptor)
                    .collect();
                list.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(list);
            }
            ManagerCommand::SetPriority { id, priority, reply } => {
                let _ = reply.send(self.set_priority(id, priority));
            }
            ManagerCommand::Dispatch { event } => self.dispatch(event),
            ManagerCommand::LoadFinished {
                id,
                generation,
                result,
            } => self.load_finished(id, generation, result),
            ManagerCommand::RetryLoad { id, generation } => {
                self.retry_load(id, generation);
            }
            ManagerCommand::DrainFinished { id } => self.drain_finished(id),
            ManagerCommand::HookFailed {
                id,
                worker,
                hook,
                error,
            } => self.hook_failed(id, worker, hook, error),
            ManagerCommand::Shutdown { .. } => unreachable!("handled in run"),
        }
    }

    // --- manifest lifecycle -------------------------------------------------

    fn manifest_added(
        &mut self,
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        bytes: Vec<u8>,
    ) {
        let (hash, result) = self.validator.validate(&bundle_dir, &bytes);

        if let Some(existing_id) = self.by_path.get(&manifest_path).copied() {
            if let Some(entry) = self.entries.get(&existing_id) {
                if entry.hash == hash
                    && !matches!(entry.state, PluginState::Removed)
                {
                    // Idempotent: identical manifest re-observed.
                    debug!(plugin = %existing_id, "manifest re-added unchanged");
                    return;
                }
            }
            return self.manifest_changed(manifest_path, bundle_dir, bytes);
        }

        let manifest = match result {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(path = %manifest_path.display(), error = %err, "manifest rejected");
                // Identity is unknown for unparseable manifests; track by
                // path only once a name exists.
                if let Ok(partial) =
                    serde_json::from_slice::<serde_json::Value>(&bytes)
                {
                    if let Some(name) =
                        partial.get("name").and_then(|v| v.as_str())
                    {
                        let id = PluginId::from_name(name);
                        self.insert_failed_entry(
                            id,
                            name.to_string(),
                            manifest_path,
                            bundle_dir,
                            hash,
                            err.to_string(),
                        );
                    }
                }
                return;
            }
        };

        let id = PluginId::from_name(&manifest.name);
        if let Some(existing) = self.entries.get(&id) {
            if existing.manifest_path != manifest_path
                && !matches!(existing.state, PluginState::Removed)
            {
                warn!(
                    plugin = %id,
                    existing = %existing.manifest_path.display(),
                    duplicate = %manifest_path.display(),
                    "duplicate plugin name, ignoring second bundle"
                );
                return;
            }
        }

        let caps = match CapabilityChecker::from_manifest(&manifest) {
            Ok(caps) => Arc::new(caps),
            Err(err) => {
                warn!(plugin = %id, error = %err, "capability compilation failed");
                return;
            }
        };

        info!(plugin = %id, name = manifest.name, "plugin discovered");
        let entry = PluginEntry {
            id,
            priority: PluginPriority::default(),
            caps,
            worker: None,
            generation: 0,
            pending_reload: None,
            removal_pending: false,
            state_store: Arc::new(Mutex::new(None)),
            errors: VecDeque::new(),
            consecutive_crashes: 0,
            metrics: PluginMetrics::default(),
            last_error: None,
            state: PluginState::Discovered,
            manifest,
            manifest_path: manifest_path.clone(),
            bundle_dir,
            hash,
        };
        self.by_path.insert(manifest_path, id);
        self.entries.insert(id, entry);

        self.transition(id, PluginState::Validated);
        self.enqueue_load(id);
    }

    fn insert_failed_entry(
        &mut self,
        id: PluginId,
        name: String,
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        hash: ManifestHash,
        error: String,
    ) {
        let manifest = PluginManifest {
            name,
            version: String::new(),
            entry: String::new(),
            description: None,
            permissions: Default::default(),
            hooks: Default::default(),
            signature: None,
        };
        let caps = Arc::new(
            CapabilityChecker::from_manifest(&manifest)
                .expect("empty permissions always compile"),
        );
        let entry = PluginEntry {
            id,
            manifest,
            manifest_path: manifest_path.clone(),
            bundle_dir,
            hash,
            state: PluginState::Failed,
            priority: PluginPriority::default(),
            caps,
            worker: None,
            generation: 0,
            pending_reload: None,
            removal_pending: false,
            state_store: Arc::new(Mutex::new(None)),
            errors: VecDeque::new(),
            consecutive_crashes: 0,
            metrics: PluginMetrics::default(),
            last_error: Some(error.clone()),
        };
        self.by_path.insert(manifest_path, id);
        self.entries.insert(id, entry);
        self.plugin_errors.incr();
        self.bus.emit(ControlEvent::PluginError {
            plugin: id,
            message: error,
        });
    }

    fn manifest_changed(
        &mut self,
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        bytes: Vec<u8>,
    ) {
        let Some(id) = self.by_path.get(&manifest_path).copied() else {
            // Never seen this path; treat as an add.
            return self.manifest_added(manifest_path, bundle_dir, bytes);
        };
        let (hash, result) = self.validator.validate(&bundle_dir, &bytes);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.hash == hash && entry.pending_reload.is_none() {
            debug!(plugin = %id, "manifest rewrite without content change");
            return;
        }

        let manifest = match result {
            Ok(manifest) => manifest,
            Err(err) => {
                self.record_plugin_error(id, err.to_string());
                let entry =
                    self.entries.get_mut(&id).expect("entry just present");
                if !matches!(entry.state, PluginState::Active) {
                    entry.hash = hash;
                    self.transition(id, PluginState::Failed);
                }
                return;
            }
        };

        let caps = match CapabilityChecker::from_manifest(&manifest) {
            Ok(caps) => Arc::new(caps),
            Err(err) => {
                self.record_plugin_error(id, err.to_string());
                return;
            }
        };

        let entry = self.entries.get_mut(&id).expect("entry present");
        entry.bundle_dir = bundle_dir;
        match entry.state {
            PluginState::Active | PluginState::Loading => {
                info!(plugin = %id, "hot reload requested");
                entry.pending_reload = Some(PendingReload {
                    manifest,
                    hash,
                    caps,
                });
                entry.generation += 1;
                self.enqueue_load(id);
            }
            _ => {
                // Not live: adopt the new manifest and load fresh.
                entry.manifest = manifest;
                entry.hash = hash;
                entry.caps = caps;
                entry.removal_pending = false;
                entry.consecutive_crashes = 0;
                entry.errors.clear();
                entry.generation += 1;
                self.transition(id, PluginState::Validated);
                self.enqueue_load(id);
            }
        }
    }

    fn manifest_removed(&mut self, manifest_path: &PathBuf) {
        let Some(id) = self.by_path.get(manifest_path).copied() else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        info!(plugin = %id, "manifest removed");
        entry.removal_pending = true;
        entry.generation += 1; // invalidate in-flight loads
        entry.pending_reload = None;
        if entry.worker.is_some() {
            self.start_drain(id);
        } else {
            self.transition(id, PluginState::Removed);
            self.drop_entry(id);
        }
    }

    // --- loading ------------------------------------------------------------

    fn enqueue_load(&mut self, id: PluginId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        self.load_sequence += 1;
        self.load_queue.push(QueuedLoad {
            priority: entry.priority,
            sequence: self.load_sequence,
            id,
            generation: entry.generation,
        });
    }

    fn pump_loads(&mut self) {
        while self.active_loads < self.config.max_concurrent_loads {
            let Some(queued) = self.load_queue.pop() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&queued.id) else {
                continue;
            };
            if entry.generation != queued.generation {
                continue; // superseded attempt
            }
            if entry.removal_pending {
                continue;
            }

            let reload = entry.pending_reload.as_ref();
            let manifest =
                reload.map(|r| &r.manifest).unwrap_or(&entry.manifest);
            let caps = reload
                .map(|r| Arc::clone(&r.caps))
                .unwrap_or_else(|| Arc::clone(&entry.caps));

            let Some(entry_path) =
                resolve_entry(&entry.bundle_dir, &manifest.entry)
            else {
                let message =
                    format!("entry `{}` cannot be resolved", manifest.entry);
                self.record_plugin_error(queued.id, message);
                self.transition(queued.id, PluginState::Failed);
                continue;
            };

            let max_heap_mb = manifest
                .permissions
                .memory
                .as_ref()
                .and_then(|memory| memory.max_heap_mb)
                .unwrap_or(self.config.default_max_heap_mb);
            let on_load = manifest.hooks.on_load.clone();
            let on_unload_old = entry.manifest.hooks.on_unload.clone();

            let service = Arc::new(HostService::new(
                Arc::clone(&caps),
                Arc::clone(&self.metrics),
                Arc::clone(&entry.state_store),
            ));
            let spec = WorkerSpec {
                plugin_id: queued.id,
                entry_path,
                max_heap_mb,
                caps,
                service,
            };

            let is_reload = entry.pending_reload.is_some();
            let old_worker = entry.worker.clone();
            let state_store = Arc::clone(&entry.state_store);
            if !is_reload {
                self.transition(queued.id, PluginState::Loading);
            }

            self.active_loads += 1;
            let pool = self.pool.clone();
            let internal = self.internal_tx.clone();
            let id = queued.id;
            let generation = queued.generation;
            let load_timeout = self.config.load_timeout;
            let hook_timeout = self.config.hook_timeout;
            let unload_timeout = self.config.unload_timeout;

            tokio::spawn(async move {
                // Visible outside the timeout so an over-deadline attempt
                // can still clean up the worker it created.
                let created: Arc<Mutex<Option<WorkerId>>> =
                    Arc::new(Mutex::new(None));
                let created_inner = Arc::clone(&created);
                let attempt = async {
                    let worker = pool
                        .spawn_worker(spec)
                        .await
                        .map_err(LoadFailure::Pool)?;
                    *created_inner.lock() = Some(worker.id);

                    // Hot reload hands the outgoing incarnation's state to
                    // the incoming one: capture the snapshot before the
                    // replacement's onLoad runs. The old worker keeps
                    // serving dispatches until the atomic swap.
                    if is_reload {
                        if let (Some(old), Some(unload)) =
                            (&old_worker, &on_unload_old)
                        {
                            match old
                                .invoke(unload, Vec::new(), unload_timeout)
                                .await
                            {
                                Ok(snapshot) if !snapshot.is_empty() => {
                                    *state_store.lock() = Some(snapshot);
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    debug!(plugin = %id, error = %err,
                                        "outgoing onUnload failed during reload");
                                }
                            }
                        }
                    }

                    if let Some(export) = &on_load {
                        let payload = state_store
                            .lock()
                            .clone()
                            .unwrap_or_default();
                        if let Err(err) =
                            worker.invoke(export, payload, hook_timeout).await
                        {
                            pool.terminate(
                                worker.id,
                                TerminationReason::Crashed,
                            )
                            .await;
                            return Err(LoadFailure::Hook(err));
                        }
                    }
                    Ok(worker)
                };

                let result =
                    match tokio::time::timeout(load_timeout, attempt).await {
                        Ok(result) => result,
                        Err(_) => {
                            let created_id = *created.lock();
                            if let Some(worker_id) = created_id {
                                pool.terminate(
                                    worker_id,
                                    TerminationReason::HookDeadline,
                                )
                                .await;
                            }
                            Err(LoadFailure::Timeout)
                        }
                    };

                let _ = internal
                    .send(ManagerCommand::LoadFinished {
                        id,
                        generation,
                        result,
                    })
                    .await;
            });
        }
    }

    fn load_finished(
        &mut self,
        id: PluginId,
        generation: u64,
        result: Result<WorkerHandle, LoadFailure>,
    ) {
        self.active_loads = self.active_loads.saturating_sub(1);

        let stale = match self.entries.get(&id) {
            Some(entry) => entry.generation != generation,
            None => true,
        };
        if stale {
            if let Ok(worker) = result {
                // The attempt was superseded while in flight.
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    pool.terminate(worker.id, TerminationReason::Draining)
                        .await;
                });
            }
            return;
        }

        match result {
            Ok(worker) => {
                let entry = self.entries.get_mut(&id).expect("checked above");
                let old = entry.worker.replace(worker);
                if let Some(reload) = entry.pending_reload.take() {
                    entry.manifest = reload.manifest;
                    entry.hash = reload.hash;
                    entry.caps = reload.caps;
                    self.hot_reloads.incr();
                }
                entry.metrics.loaded_at = Some(chrono::Utc::now());
                let name = entry.manifest.name.clone();
                let version = entry.manifest.version.clone();

                // The swap above is the atomic dispatch switchover; the old
                // worker only finishes in-flight hook invocations.
                if let Some(old) = old {
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        pool.terminate(old.id, TerminationReason::Draining)
                            .await;
                    });
                }

                self.plugin_loads.incr();
                self.transition(id, PluginState::Active);
                self.bus.emit(ControlEvent::PluginLoaded {
                    plugin: id,
                    name,
                    version,
                });
                self.replay_startup_events(id);
            }
            Err(LoadFailure::Pool(PoolError::AtCapacity)) => {
                // The pool is full; keep the attempt queued.
                debug!(plugin = %id, "pool at capacity, delaying load");
                let internal = self.internal_tx.clone();
                let delay = self.config.capacity_retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = internal
                        .send(ManagerCommand::RetryLoad { id, generation })
                        .await;
                });
            }
            Err(failure) => {
                let message = failure.to_string();
                self.record_plugin_error(id, message);
                let entry = self.entries.get_mut(&id).expect("checked above");
                if entry.pending_reload.take().is_some() {
                    // Failed reload: the previous incarnation stays live.
                    warn!(plugin = %id, "hot reload failed, keeping old worker");
                } else {
                    self.transition(id, PluginState::Failed);
                }
            }
        }
    }

    fn retry_load(&mut self, id: PluginId, generation: u64) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if entry.generation == generation && !entry.removal_pending {
            self.load_sequence += 1;
            self.load_queue.push(QueuedLoad {
                priority: entry.priority,
                sequence: self.load_sequence,
                id,
                generation,
            });
        }
    }

    // --- draining and removal ----------------------------------------------

    fn start_drain(&mut self, id: PluginId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Some(worker) = entry.worker.take() else {
            self.transition(id, PluginState::Draining);
            self.drain_finished(id);
            return;
        };
        let on_unload = entry.manifest.hooks.on_unload.clone();
        let state_store = Arc::clone(&entry.state_store);
        self.transition(id, PluginState::Draining);

        let pool = self.pool.clone();
        let internal = self.internal_tx.clone();
        let unload_timeout = self.config.unload_timeout;
        tokio::spawn(async move {
            if let Some(export) = on_unload {
                match worker.invoke(&export, Vec::new(), unload_timeout).await
                {
                    Ok(snapshot) if !snapshot.is_empty() => {
                        *state_store.lock() = Some(snapshot);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(plugin = %id, error = %err, "onUnload failed");
                    }
                }
            }
            pool.terminate(worker.id, TerminationReason::Draining).await;
            let _ = internal.send(ManagerCommand::DrainFinished { id }).await;
        });
    }

    fn drain_finished(&mut self, id: PluginId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let removal = entry.removal_pending;
        self.transition(id, PluginState::Removed);
        if removal {
            self.drop_entry(id);
        }
    }

    fn drop_entry(&mut self, id: PluginId) {
        if let Some(entry) = self.entries.remove(&id) {
            self.by_path.remove(&entry.manifest_path);
        }
    }

    async fn shutdown_all(&mut self) {
        let mut drains = Vec::new();
        for entry in self.entries.values_mut() {
            let Some(worker) = entry.worker.take() else {
                continue;
            };
            let on_unload = entry.manifest.hooks.on_unload.clone();
            let state_store = Arc::clone(&entry.state_store);
            let pool = self.pool.clone();
            let unload_timeout = self.config.unload_timeout;
            drains.push(async move {
                if let Some(export) = on_unload {
                    if let Ok(snapshot) = worker
                        .invoke(&export, Vec::new(), unload_timeout)
                        .await
                    {
                        if !snapshot.is_empty() {
                            *state_store.lock() = Some(snapshot);
                        }
                    }
                }
                pool.terminate(worker.id, TerminationReason::Shutdown).await;
            });
        }
        futures::future::join_all(drains).await;
        info!("all plugins drained");
    }

    // --- dispatch -----------------------------------------------------------

    fn dispatch(&mut self, event: StreamEvent) {
        self.dispatched.incr();
        let hook = match event.action {
            DeviceAction::Attach => HookKind::UsbAttach,
            DeviceAction::Detach => HookKind::UsbDetach,
        };

        let mut delivered = HashSet::new();
        let mut dormant = Vec::new();
        let targets: Vec<(PluginId, WorkerHandle, String)> = self
            .entries
            .values_mut()
            .filter_map(|entry| {
                if !entry.state.can_dispatch() {
                    return None;
                }
                if !entry.caps.matches_usb(event.vendor_id, event.product_id)
                {
                    return None;
                }
                let export =
                    entry.manifest.hooks.export_for(hook)?.to_string();
                let Some(worker) = entry.worker.clone() else {
                    // Idle-reclaimed warm worker; respawn for the next
                    // event rather than delivering into the void.
                    dormant.push(entry.id);
                    return None;
                };
                entry.metrics.access_count += 1;
                Some((entry.id, worker, export))
            })
            .collect();

        for id in dormant {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.generation += 1;
            }
            self.transition(id, PluginState::Loading);
            self.enqueue_load(id);
        }

        for (id, worker, export) in targets {
            delivered.insert(id);
            self.fire_hook(id, worker, export, hook, &event);
        }

        // Early events are retained so plugins activating shortly after
        // boot still observe devices that were attached before them.
        if self.boot.elapsed() < self.config.startup_replay_window {
            self.replay_buffer.push((event, delivered));
        }
    }

    fn fire_hook(
        &self,
        id: PluginId,
        worker: WorkerHandle,
        export: String,
        hook: HookKind,
        event: &StreamEvent,
    ) {
        let payload = HookDevicePayload {
            action: event.action,
            vendor_id: format!("0x{:04x}", event.vendor_id),
            product_id: format!("0x{:04x}", event.product_id),
            signature: event.device_signature,
            manufacturer: event.manufacturer.clone(),
            product: event.product.clone(),
            serial_number: event.serial_number.clone(),
            timestamp_ms: event.timestamp_ms,
        };
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "hook payload serialization failed");
                return;
            }
        };

        let internal = self.internal_tx.clone();
        let deadline = self.config.hook_timeout;
        tokio::spawn(async move {
            let worker_id = worker.id;
            // Fire-and-forget from the manager's perspective; the reply is
            // only error accounting.
            if let Err(error) = worker.invoke(&export, bytes, deadline).await
            {
                let _ = internal
                    .send(ManagerCommand::HookFailed {
                        id,
                        worker: worker_id,
                        hook,
                        error,
                    })
                    .await;
            }
        });
    }

    fn replay_startup_events(&mut self, id: PluginId) {
        if self.boot.elapsed() >= self.config.startup_replay_window {
            return;
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Some(worker) = entry.worker.clone() else {
            return;
        };
        let caps = Arc::clone(&entry.caps);

        let mut to_fire = Vec::new();
        for (event, delivered) in self.replay_buffer.iter_mut() {
            if delivered.contains(&id) {
                continue;
            }
            if !caps.matches_usb(event.vendor_id, event.product_id) {
                continue;
            }
            let hook = match event.action {
                DeviceAction::Attach => HookKind::UsbAttach,
                DeviceAction::Detach => HookKind::UsbDetach,
            };
            let Some(export) = self
                .entries
                .get(&id)
                .and_then(|e| e.manifest.hooks.export_for(hook))
            else {
                continue;
            };
            delivered.insert(id);
            to_fire.push((event.clone(), hook, export.to_string()));
        }

        if !to_fire.is_empty() {
            debug!(plugin = %id, events = to_fire.len(), "replaying startup events");
        }
        for (event, hook, export) in to_fire {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.metrics.access_count += 1;
            }
            self.fire_hook(id, worker.clone(), export, hook, &event);
        }
    }

    // --- failure accounting -------------------------------------------------

    fn hook_failed(
        &mut self,
        id: PluginId,
        worker: WorkerId,
        hook: HookKind,
        error: HookError,
    ) {
        let current = self
            .entries
            .get(&id)
            .and_then(|entry| entry.worker.as_ref())
            .map(|w| w.id);
        if current != Some(worker) {
            return; // error from a superseded incarnation
        }

        warn!(plugin = %id, %hook, error = %error, "hook failed");
        match &error {
            HookError::Deadline
            | HookError::CpuBudget
            | HookError::MemoryExceeded => {
                // Resource kills terminate the worker; the termination
                // event carries the error accounting.
                let reason = match error {
                    HookError::Deadline => TerminationReason::HookDeadline,
                    HookError::CpuBudget => TerminationReason::CpuExceeded,
                    _ => TerminationReason::MemoryExceeded,
                };
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    pool.terminate(worker, reason).await;
                });
            }
            _ => {
                self.record_plugin_error(id, error.to_string());
                self.note_error_for_window(id);
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::HealthOk { plugin, .. } => {
                if let Some(entry) = self.entries.get_mut(&plugin) {
                    entry.metrics.last_health_ok_at =
                        Some(chrono::Utc::now());
                    entry.consecutive_crashes = 0;
                }
            }
            WorkerEvent::HealthMissed { .. } => {
                // The pool escalates to termination on its own; nothing to
                // arbitrate yet.
            }
            WorkerEvent::Terminated {
                plugin,
                worker,
                reason,
            } => self.worker_terminated(plugin, worker, reason),
        }
    }

    fn worker_terminated(
        &mut self,
        plugin: PluginId,
        worker: WorkerId,
        reason: TerminationReason,
    ) {
        let Some(entry) = self.entries.get_mut(&plugin) else {
            return;
        };
        let is_current =
            entry.worker.as_ref().is_some_and(|w| w.id == worker);
        if !is_current {
            return; // an old incarnation finished draining
        }

        match reason {
            TerminationReason::Draining | TerminationReason::Shutdown => {
                entry.worker = None;
            }
            TerminationReason::Idle => {
                // Reclaimed warm worker; the plugin stays Active and is
                // respawned on the next dispatch.
                entry.worker = None;
            }
            _ => {
                entry.worker = None;
                entry.consecutive_crashes += 1;
                let crashes = entry.consecutive_crashes;
                self.record_plugin_error(
                    plugin,
                    format!("worker terminated: {reason}"),
                );
                self.note_error_for_window(plugin);

                let Some(entry) = self.entries.get_mut(&plugin) else {
                    return;
                };
                if matches!(
                    entry.state,
                    PluginState::Draining | PluginState::Removed
                ) {
                    return;
                }
                if crashes >= self.config.max_consecutive_crashes {
                    // Crash-reload state is not trusted.
                    entry.state_store.lock().take();
                    warn!(plugin = %plugin, crashes, "crash limit reached, removing plugin");
                    self.transition(plugin, PluginState::Removed);
                    return;
                }
                // Crash-reload state is absent by policy.
                entry.state_store.lock().take();
                entry.generation += 1;
                self.transition(plugin, PluginState::Loading);
                self.enqueue_load(plugin);
            }
        }
    }

    /// Rolling-window error accounting; crossing the limit drains the
    /// plugin.
    fn note_error_for_window(&mut self, id: PluginId) {
        let window = self.config.error_window;
        let limit = self.config.max_errors_in_window;
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let now = Instant::now();
        entry.errors.push_back(now);
        while let Some(oldest) = entry.errors.front() {
            if now.duration_since(*oldest) > window {
                entry.errors.pop_front();
            } else {
                break;
            }
        }
        if entry.errors.len() >= limit as usize
            && matches!(entry.state, PluginState::Active | PluginState::Loading)
        {
            warn!(plugin = %id, errors = entry.errors.len(), "error window exceeded, draining");
            self.start_drain(id);
        }
    }

    fn record_plugin_error(&mut self, id: PluginId, message: String) {
        self.plugin_errors.incr();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.metrics.error_count += 1;
            entry.last_error = Some(message.clone());
        }
        self.bus.emit(ControlEvent::PluginError {
            plugin: id,
            message,
        });
    }

    // --- misc ---------------------------------------------------------------

    fn set_priority(
        &mut self,
        id: PluginId,
        priority: PluginPriority,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.priority = priority;
        // Re-key queued loads for this plugin.
        let queued: Vec<QueuedLoad> = self.load_queue.drain().collect();
        self.load_queue = queued
            .into_iter()
            .map(|mut load| {
                if load.id == id {
                    load.priority = priority;
                }
                load
            })
            .collect();
        true
    }

    fn transition(&mut self, id: PluginId, to: PluginState) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.state == to {
            return;
        }
        let from = entry.state;
        entry.state = to;
        debug!(plugin = %id, %from, %to, "plugin state changed");
        self.bus.emit(ControlEvent::PluginStateChanged {
            plugin: id,
            from,
            to,
        });
    }
}
