//! One sandboxed worker: a wasmtime isolate on a dedicated OS thread.
//!
//! The guest imports only the `autoweave` namespace (plus manifest-listed
//! modules). Hook payloads cross a small membrane - the host stages input
//! bytes in the store data, the guest pulls them with `input_read`, pushes
//! results with `output_write`, and makes capability-checked host calls
//! with `host_call`/`reply_read`. CPU and deadlines are enforced with fuel
//! and epoch interruption; the heap ceiling with a store resource limiter.
//!
//! Hook execution is serialized per worker by construction: the thread
//! processes one command at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use autoweave_model::{PluginId, WorkerId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use wasmtime::{
    Caller, Config, Engine, Instance, Linker, Memory, Module, Store, Trap,
};

use crate::workers::host_api::{HostCall, HostReply, HostService};
use crate::workers::host_modules::HostModuleRegistry;
use crate::workers::sandbox::{BASE_MODULE, CapabilityChecker};

/// Extra time a hook gets to cede after its deadline before the trap.
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Fuel armed per invocation. Deliberately generous: sustained CPU abuse is
/// policed by the pool's share tracking, not by fuel.
const FUEL_PER_INVOCATION: u64 = 2_000_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("hook deadline exceeded")]
    Deadline,

    #[error("cpu budget exhausted")]
    CpuBudget,

    #[error("memory ceiling exceeded")]
    MemoryExceeded,

    #[error("missing export `{0}`")]
    MissingExport(String),

    #[error("hook trapped: {0}")]
    Trapped(String),

    #[error("worker unavailable")]
    Crashed,
}

#[derive(Error, Debug, Clone)]
#[error("worker spawn failed: {0}")]
pub struct SpawnError(pub String);

/// Liveness response from the worker thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingReport {
    pub memory_bytes: usize,
    pub busy: Duration,
    pub invocations: u64,
    pub memory_denied: bool,
}

enum WorkerCommand {
    Invoke {
        export: String,
        payload: Vec<u8>,
        deadline: Duration,
        reply: oneshot::Sender<Result<Vec<u8>, HookError>>,
    },
    Ping {
        reply: oneshot::Sender<PingReport>,
    },
    Shutdown,
}

/// What the pool needs to build one worker.
#[derive(Clone)]
pub struct WorkerSpec {
    pub plugin_id: PluginId,
    pub entry_path: PathBuf,
    pub max_heap_mb: u32,
    pub caps: Arc<CapabilityChecker>,
    pub service: Arc<HostService>,
}

impl std::fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("plugin_id", &self.plugin_id)
            .field("entry_path", &self.entry_path)
            .field("max_heap_mb", &self.max_heap_mb)
            .finish()
    }
}

/// Request/response channel into one worker. Cloneable; hook execution
/// stays serialized on the worker thread regardless of caller count.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub plugin_id: PluginId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    tx: mpsc::Sender<WorkerCommand>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .finish()
    }
}

impl WorkerHandle {
    /// Runs one hook with its deadline. The wasm side is interrupted via
    /// epoch deadline; if the worker still does not cede within the grace,
    /// the caller gets `Deadline` back and is expected to terminate it.
    pub async fn invoke(
        &self,
        export: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>, HookError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Invoke {
                export: export.to_string(),
                payload,
                deadline,
                reply,
            })
            .await
            .map_err(|_| HookError::Crashed)?;
        match tokio::time::timeout(deadline + DEADLINE_GRACE * 2, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HookError::Crashed),
            Err(_) => Err(HookError::Deadline),
        }
    }

    pub async fn ping(&self, timeout: Duration) -> Option<PingReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Ping { reply })
            .await
            .ok()?;
        tokio::time::timeout(timeout, rx).await.ok()?.ok()
    }

    /// Asks the thread to exit its loop. Idempotent; a dead worker is fine.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WorkerCommand::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Shared sandbox environment: one engine, one epoch ticker, and the host
/// module table per pool.
pub struct SandboxEnv {
    engine: Engine,
    epoch_tick: Duration,
    ticker_stop: Arc<AtomicBool>,
    ticker: Option<std::thread::JoinHandle<()>>,
    runtime: tokio::runtime::Handle,
    modules: Arc<HostModuleRegistry>,
}

impl std::fmt::Debug for SandboxEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEnv")
            .field("epoch_tick", &self.epoch_tick)
            .finish()
    }
}

impl SandboxEnv {
    /// Must be called from within the tokio runtime that will service host
    /// calls.
    pub fn new(
        epoch_tick: Duration,
        modules: Arc<HostModuleRegistry>,
    ) -> Result<Arc<Self>, SpawnError> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        config.consume_fuel(true);
        let engine = Engine::new(&config)
            .map_err(|err| SpawnError(format!("engine: {err}")))?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&ticker_stop);
        let tick_engine = engine.clone();
        let ticker = std::thread::Builder::new()
            .name("sandbox-epoch-ticker".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(epoch_tick);
                    tick_engine.increment_epoch();
                }
            })
            .map_err(|err| SpawnError(format!("epoch ticker: {err}")))?;

        Ok(Arc::new(Self {
            engine,
            epoch_tick,
            ticker_stop,
            ticker: Some(ticker),
            runtime: tokio::runtime::Handle::current(),
            modules,
        }))
    }

    fn ticks_for(&self, duration: Duration) -> u64 {
        let tick_ms = self.epoch_tick.as_millis().max(1) as u64;
        (duration.as_millis() as u64 / tick_ms).max(1)
    }
}

impl Drop for SandboxEnv {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }
}

/// Store resource limiter pinning the heap ceiling. The denial flag is
/// sticky so a guest that swallows the failed `memory.grow` is still
/// reported by the next health ping.
struct HeapLimiter {
    max_bytes: usize,
    current: usize,
    denied: bool,
}

impl wasmtime::ResourceLimiter for HeapLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_bytes {
            self.denied = true;
            Ok(false)
        } else {
            self.current = desired;
            Ok(true)
        }
    }

    fn table_growing(
        &mut self,
        _current: u32,
        desired: u32,
        _maximum: Option<u32>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= 100_000)
    }
}

pub(crate) struct WorkerCell {
    input: Vec<u8>,
    output: Option<Vec<u8>>,
    reply: Vec<u8>,
    limiter: HeapLimiter,
    service: Arc<HostService>,
    runtime: tokio::runtime::Handle,
}

fn guest_memory(caller: &mut Caller<'_, WorkerCell>) -> Option<Memory> {
    caller.get_export("memory").and_then(|e| e.into_memory())
}

fn register_host_api(
    linker: &mut Linker<WorkerCell>,
) -> Result<(), wasmtime::Error> {
    linker.func_wrap(
        BASE_MODULE,
        "input_len",
        |caller: Caller<'_, WorkerCell>| -> i32 {
            caller.data().input.len() as i32
        },
    )?;

    linker.func_wrap(
        BASE_MODULE,
        "input_read",
        |mut caller: Caller<'_, WorkerCell>, out_ptr: i32| -> i32 {
            let Some(memory) = guest_memory(&mut caller) else {
                return -1;
            };
            let input = caller.data().input.clone();
            match memory.write(&mut caller, out_ptr as usize, &input) {
                Ok(()) => input.len() as i32,
                Err(_) => -1,
            }
        },
    )?;

    linker.func_wrap(
        BASE_MODULE,
        "output_write",
        |mut caller: Caller<'_, WorkerCell>, ptr: i32, len: i32| -> i32 {
            let Some(memory) = guest_memory(&mut caller) else {
                return -1;
            };
            let mut buffer = vec![0u8; len as usize];
            if memory.read(&caller, ptr as usize, &mut buffer).is_err() {
                return -1;
            }
            caller.data_mut().output = Some(buffer);
            0
        },
    )?;

    linker.func_wrap(
        BASE_MODULE,
        "host_call",
        |mut caller: Caller<'_, WorkerCell>, ptr: i32, len: i32| -> i32 {
            let Some(memory) = guest_memory(&mut caller) else {
                return -1;
            };
            let mut request = vec![0u8; len as usize];
            if memory.read(&caller, ptr as usize, &mut request).is_err() {
                return -1;
            }

            let reply = match serde_json::from_slice::<HostCall>(&request) {
                Ok(call) => {
                    let service = Arc::clone(&caller.data().service);
                    let runtime = caller.data().runtime.clone();
                    // The worker thread is not a runtime thread, so
                    // blocking here is sound; host-call latency counts
                    // against the hook's own deadline.
                    runtime.block_on(service.call(call))
                }
                Err(err) => HostReply::Error {
                    message: format!("malformed host call: {err}"),
                },
            };
            let encoded = serde_json::to_vec(&reply)
                .unwrap_or_else(|_| b"{\"status\":\"error\"}".to_vec());
            let reply_len = encoded.len() as i32;
            caller.data_mut().reply = encoded;
            reply_len
        },
    )?;

    linker.func_wrap(
        BASE_MODULE,
        "reply_read",
        |mut caller: Caller<'_, WorkerCell>, out_ptr: i32| -> i32 {
            let Some(memory) = guest_memory(&mut caller) else {
                return -1;
            };
            let reply = std::mem::take(&mut caller.data_mut().reply);
            match memory.write(&mut caller, out_ptr as usize, &reply) {
                Ok(()) => reply.len() as i32,
                Err(_) => -1,
            }
        },
    )?;

    Ok(())
}

/// Rejects imports outside the allowlist before instantiation. Fail
/// closed: an import must be allowlisted by the manifest AND present in
/// the host module table.
fn check_imports(
    module: &Module,
    caps: &CapabilityChecker,
    host_modules: &HostModuleRegistry,
) -> Result<(), String> {
    for import in module.imports() {
        let module_name = import.module();
        if module_name == BASE_MODULE {
            continue;
        }
        if !caps.module_allowed(module_name) {
            return Err(format!(
                "import of module `{module_name}` is not permitted"
            ));
        }
        if !host_modules.provides(module_name) {
            return Err(format!(
                "module `{module_name}` is allowlisted but not provided by this host"
            ));
        }
    }
    Ok(())
}

/// Builds the isolate and runs its command loop until shutdown.
pub(crate) async fn spawn(
    env: Arc<SandboxEnv>,
    spec: WorkerSpec,
    ready_timeout: Duration,
) -> Result<(WorkerHandle, std::thread::JoinHandle<()>), SpawnError> {
    let id = WorkerId::new();
    let (tx, rx) = mpsc::channel::<WorkerCommand>(16);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

    let thread_env = Arc::clone(&env);
    let thread_spec = spec.clone();
    let thread = std::thread::Builder::new()
        .name(format!("plugin-worker-{id}"))
        .spawn(move || {
            worker_thread(thread_env, thread_spec, rx, ready_tx);
        })
        .map_err(|err| SpawnError(format!("thread spawn: {err}")))?;

    match tokio::time::timeout(ready_timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => Ok((
            WorkerHandle {
                id,
                plugin_id: spec.plugin_id,
                created_at: chrono::Utc::now(),
                tx,
            },
            thread,
        )),
        Ok(Ok(Err(message))) => {
            let _ = thread.join();
            Err(SpawnError(message))
        }
        Ok(Err(_)) => Err(SpawnError(
            "worker thread exited before ready".to_string(),
        )),
        Err(_) => {
            // The worker never completed its ready handshake. Leave the
            // thread to die with its channel.
            drop(tx);
            Err(SpawnError("ready handshake timed out".to_string()))
        }
    }
}

fn worker_thread(
    env: Arc<SandboxEnv>,
    spec: WorkerSpec,
    mut rx: mpsc::Receiver<WorkerCommand>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let max_bytes = spec.max_heap_mb as usize * 1024 * 1024;
    let setup = || -> Result<(Store<WorkerCell>, Instance), String> {
        let bytes = std::fs::read(&spec.entry_path).map_err(|err| {
            format!("entry `{}`: {err}", spec.entry_path.display())
        })?;
        let module = Module::new(&env.engine, &bytes)
            .map_err(|err| format!("entry does not compile: {err}"))?;
        check_imports(&module, &spec.caps, &env.modules)?;

        let cell = WorkerCell {
            input: Vec::new(),
            output: None,
            reply: Vec::new(),
            limiter: HeapLimiter {
                max_bytes,
                current: 0,
                denied: false,
            },
            service: Arc::clone(&spec.service),
            runtime: env.runtime.clone(),
        };
        let mut store = Store::new(&env.engine, cell);
        store.limiter(|cell| &mut cell.limiter);
        // Instantiation runs guest start code; bound it like a hook.
        store.set_epoch_deadline(
            env.ticks_for(Duration::from_secs(10) + DEADLINE_GRACE),
        );
        store
            .set_fuel(FUEL_PER_INVOCATION)
            .map_err(|err| format!("fuel: {err}"))?;

        let mut linker = Linker::new(&env.engine);
        register_host_api(&mut linker)
            .map_err(|err| format!("host api: {err}"))?;
        // Imports already passed the allowlist and table checks; wire each
        // provided module in once.
        let mut installed = std::collections::HashSet::new();
        for import in module.imports() {
            let name = import.module();
            if name != BASE_MODULE && installed.insert(name.to_string()) {
                env.modules
                    .install(name, &mut linker)
                    .map_err(|err| format!("host module `{name}`: {err}"))?;
            }
        }
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|err| format!("instantiation: {err}"))?;
        Ok((store, instance))
    };

    let (mut store, instance) = match setup() {
        Ok(parts) => parts,
        Err(message) => {
            warn!(plugin = %spec.plugin_id, message, "worker setup failed");
            let _ = ready.send(Err(message));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    let mut busy = Duration::ZERO;
    let mut invocations: u64 = 0;
    while let Some(command) = rx.blocking_recv() {
        match command {
            WorkerCommand::Invoke {
                export,
                payload,
                deadline,
                reply,
            } => {
                let started = Instant::now();
                let result = invoke_hook(
                    &env,
                    &mut store,
                    &instance,
                    &export,
                    payload,
                    deadline,
                );
                busy += started.elapsed();
                invocations += 1;
                let _ = reply.send(result);
            }
            WorkerCommand::Ping { reply } => {
                let limiter = &store.data().limiter;
                let _ = reply.send(PingReport {
                    memory_bytes: limiter.current,
                    busy,
                    invocations,
                    memory_denied: limiter.denied,
                });
            }
            WorkerCommand::Shutdown => break,
        }
    }
    debug!(plugin = %spec.plugin_id, "worker thread exiting");
}

fn invoke_hook(
    env: &SandboxEnv,
    store: &mut Store<WorkerCell>,
    instance: &Instance,
    export: &str,
    payload: Vec<u8>,
    deadline: Duration,
) -> Result<Vec<u8>, HookError> {
    store.set_epoch_deadline(env.ticks_for(deadline + DEADLINE_GRACE));
    store
        .set_fuel(FUEL_PER_INVOCATION)
        .map_err(|err| HookError::Trapped(err.to_string()))?;
    {
        let cell = store.data_mut();
        cell.input = payload;
        cell.output = None;
    }

    let func = instance
        .get_typed_func::<(), ()>(&mut *store, export)
        .map_err(|_| HookError::MissingExport(export.to_string()))?;

    match func.call(&mut *store, ()) {
        Ok(()) => Ok(store.data_mut().output.take().unwrap_or_default()),
        Err(err) => Err(classify_error(&err, store.data().limiter.denied)),
    }
}

fn classify_error(err: &wasmtime::Error, memory_denied: bool) -> HookError {
    if memory_denied {
        return HookError::MemoryExceeded;
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => HookError::Deadline,
        Some(Trap::OutOfFuel) => HookError::CpuBudget,
        Some(trap) => HookError::Trapped(trap.to_string()),
        None => HookError::Trapped(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::metrics::MetricsRegistry;
    use autoweave_model::PluginManifest;
    use parking_lot::Mutex;
    use std::path::Path;

    const ECHO_WAT: &str = r#"
(module
  (import "autoweave" "input_len" (func $input_len (result i32)))
  (import "autoweave" "input_read" (func $input_read (param i32) (result i32)))
  (import "autoweave" "output_write" (func $output_write (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "init")
    (drop (call $input_read (i32.const 0)))
    (drop (call $output_write (i32.const 0) (call $input_len))))
  (func (export "save")
    (drop (call $output_write (i32.const 1024) (i32.const 4))))
  (data (i32.const 1024) "SNAP"))
"#;

    const SPIN_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "spin") (loop $l (br $l))))
"#;

    const GROW_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "grow")
    (loop $l
      (if (i32.eq (memory.grow (i32.const 16)) (i32.const -1))
        (then unreachable))
      (br $l))))
"#;

    const BAD_IMPORT_WAT: &str = r#"
(module
  (import "env" "mystery" (func $mystery))
  (memory (export "memory") 1)
  (func (export "init") (call $mystery)))
"#;

    // Hooks that cross the membrane with real host calls. The data
    // segments hold literal JSON requests; lengths are byte counts.
    const HOST_CALL_WAT: &str = r#"
(module
  (import "autoweave" "host_call" (func $host_call (param i32 i32) (result i32)))
  (import "autoweave" "reply_read" (func $reply_read (param i32) (result i32)))
  (import "autoweave" "output_write" (func $output_write (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{\"op\":\"metric\",\"name\":\"ticks\",\"value\":7}")
  (data (i32.const 128) "{\"op\":\"write_file\",\"path\":\"/etc/x\",\"data_b64\":\"\"}")
  (func $relay (param $ptr i32) (param $len i32)
    (local $reply_len i32)
    (drop (call $host_call (local.get $ptr) (local.get $len)))
    (local.set $reply_len (call $reply_read (i32.const 4096)))
    (drop (call $output_write (i32.const 4096) (local.get $reply_len))))
  (func (export "tick")
    (call $relay (i32.const 0) (i32.const 40)))
  (func (export "touch")
    (call $relay (i32.const 128) (i32.const 49))))
"#;

    fn write_entry(dir: &Path, wat: &str) -> PathBuf {
        let path = dir.join("entry.wat");
        std::fs::write(&path, wat).unwrap();
        path
    }

    fn bare_spec(entry_path: PathBuf, max_heap_mb: u32) -> WorkerSpec {
        let manifest: PluginManifest = serde_json::from_str(
            r#"{"name":"test-plugin","version":"1.0.0","entry":"entry.wat"}"#,
        )
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
            plugin_id: PluginId::from_name("test-plugin"),
            entry_path,
            max_heap_mb,
            caps,
            service,
        }
    }

    async fn spawn_from(
        wat: &str,
        max_heap_mb: u32,
    ) -> Result<
        (WorkerHandle, std::thread::JoinHandle<()>, tempfile::TempDir),
        SpawnError,
    > {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path(), wat);
        let env = SandboxEnv::new(
            Duration::from_millis(10),
            Arc::new(HostModuleRegistry::builtin()),
        )
        .unwrap();
        let (handle, thread) = spawn(
            env,
            bare_spec(entry, max_heap_mb),
            Duration::from_secs(10),
        )
        .await?;
        Ok((handle, thread, dir))
    }

    #[tokio::test]
    async fn hook_echoes_payload_through_the_membrane() {
        let (handle, thread, _dir) = spawn_from(ECHO_WAT, 16).await.unwrap();
        let out = handle
            .invoke("init", b"{\"counter\":1}".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, b"{\"counter\":1}");
        handle.shutdown().await;
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn unload_style_hook_returns_snapshot_bytes() {
        let (handle, thread, _dir) = spawn_from(ECHO_WAT, 16).await.unwrap();
        let snapshot = handle
            .invoke("save", Vec::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(snapshot, b"SNAP");
        handle.shutdown().await;
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn state_round_trip_is_byte_preserving_across_incarnations() {
        let (v1, t1, _d1) = spawn_from(ECHO_WAT, 16).await.unwrap();
        let snapshot = v1
            .invoke("save", Vec::new(), Duration::from_secs(5))
            .await
            .unwrap();
        v1.shutdown().await;
        t1.join().unwrap();

        let (v2, t2, _d2) = spawn_from(ECHO_WAT, 16).await.unwrap();
        let echoed = v2
            .invoke("init", snapshot.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(echoed, snapshot);
        v2.shutdown().await;
        t2.join().unwrap();
    }

    #[tokio::test]
    async fn missing_export_is_reported() {
        let (handle, thread, _dir) = spawn_from(ECHO_WAT, 16).await.unwrap();
        let err = handle
            .invoke("does_not_exist", Vec::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HookError::MissingExport("does_not_exist".to_string())
        );
        handle.shutdown().await;
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn runaway_hook_hits_its_deadline() {
        let (handle, thread, _dir) = spawn_from(SPIN_WAT, 16).await.unwrap();
        let err = handle
            .invoke("spin", Vec::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(
            matches!(err, HookError::Deadline | HookError::CpuBudget),
            "expected interruption, got {err:?}"
        );
        handle.shutdown().await;
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn heap_ceiling_terminates_greedy_guest() {
        let (handle, thread, _dir) = spawn_from(GROW_WAT, 1).await.unwrap();
        let err = handle
            .invoke("grow", Vec::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, HookError::MemoryExceeded);
        let report = handle.ping(Duration::from_secs(1)).await.unwrap();
        assert!(report.memory_denied);
        handle.shutdown().await;
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn host_call_metric_crosses_the_membrane() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path(), HOST_CALL_WAT);
        let env = SandboxEnv::new(
            Duration::from_millis(10),
            Arc::new(HostModuleRegistry::builtin()),
        )
        .unwrap();

        let manifest: PluginManifest = serde_json::from_str(
            r#"{"name":"test-plugin","version":"1.0.0","entry":"entry.wat"}"#,
        )
        .unwrap();
        let caps =
            Arc::new(CapabilityChecker::from_manifest(&manifest).unwrap());
        let metrics = MetricsRegistry::new();
        let service = Arc::new(HostService::new(
            Arc::clone(&caps),
            Arc::clone(&metrics),
            Arc::new(Mutex::new(None)),
        ));
        let spec = WorkerSpec {
            plugin_id: PluginId::from_name("test-plugin"),
            entry_path: entry,
            max_heap_mb: 16,
            caps,
            service,
        };
        let (handle, thread) =
            spawn(env, spec, Duration::from_secs(10)).await.unwrap();

        let reply_bytes = handle
            .invoke("tick", Vec::new(), Duration::from_secs(5))
            .await
            .unwrap();
        let reply: HostReply =
            serde_json::from_slice(&reply_bytes).unwrap();
        assert_eq!(reply, HostReply::Ok);
        assert_eq!(
            metrics.snapshot().get("plugin.test-plugin.ticks"),
            Some(&7)
        );

        // The same plugin has no filesystem grant: the write comes back
        // denied and nothing touches the disk.
        let reply_bytes = handle
            .invoke("touch", Vec::new(), Duration::from_secs(5))
            .await
            .unwrap();
        let reply: HostReply =
            serde_json::from_slice(&reply_bytes).unwrap();
        assert!(
            matches!(reply, HostReply::Denied { .. }),
            "expected denial, got {reply:?}"
        );

        handle.shutdown().await;
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn undeclared_import_module_fails_spawn() {
        let err = spawn_from(BAD_IMPORT_WAT, 16).await.err().unwrap();
        assert!(err.0.contains("not permitted"), "{err}");
    }

    const CLOCK_WAT: &str = r#"
(module
  (import "clock" "now_ms" (func $now_ms (result i64)))
  (import "autoweave" "output_write" (func $output_write (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "tick")
    (i64.store (i32.const 0) (call $now_ms))
    (drop (call $output_write (i32.const 0) (i32.const 8)))))
"#;

    const UNPROVIDED_WAT: &str = r#"
(module
  (import "mystery" "poke" (func $poke))
  (memory (export "memory") 1)
  (func (export "init") (call $poke)))
"#;

    fn spec_with_modules(
        entry_path: PathBuf,
        modules: &str,
    ) -> WorkerSpec {
        let manifest: PluginManifest = serde_json::from_str(&format!(
            r#"{{"name":"test-plugin","version":"1.0.0","entry":"entry.wat",
                "permissions":{{"modules":[{modules}]}}}}"#
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
            plugin_id: PluginId::from_name("test-plugin"),
            entry_path,
            max_heap_mb: 16,
            caps,
            service,
        }
    }

    #[tokio::test]
    async fn allowlisted_host_module_is_wired_in() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path(), CLOCK_WAT);
        let env = SandboxEnv::new(
            Duration::from_millis(10),
            Arc::new(HostModuleRegistry::builtin()),
        )
        .unwrap();
        let (handle, thread) = spawn(
            env,
            spec_with_modules(entry, r#""clock""#),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        let out = handle
            .invoke("tick", Vec::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.len(), 8);
        let now_ms = i64::from_le_bytes(out.try_into().unwrap());
        assert!(now_ms > 0, "clock module must return a real timestamp");

        handle.shutdown().await;
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn allowlisted_but_unprovided_module_fails_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path(), UNPROVIDED_WAT);
        let env = SandboxEnv::new(
            Duration::from_millis(10),
            Arc::new(HostModuleRegistry::builtin()),
        )
        .unwrap();
        let err = spawn(
            env,
            spec_with_modules(entry, r#""mystery""#),
            Duration::from_secs(10),
        )
        .await
        .err()
        .unwrap();
        assert!(err.0.contains("not provided"), "{err}");
    }

    #[tokio::test]
    async fn ping_reports_activity() {
        let (handle, thread, _dir) = spawn_from(ECHO_WAT, 16).await.unwrap();
        handle
            .invoke("init", b"x".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        let report = handle.ping(Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.invocations, 1);
        assert!(!report.memory_denied);
        handle.shutdown().await;
        thread.join().unwrap();
    }
}
