//! Filesystem watch pipeline for plugin bundles.
//!
//! A thin wrapper around `notify` that debounces raw filesystem
//! notifications per path and forwards manifest-level changes. In the
//! default manifest-only mode, only `autoweave.plugin.json` files are
//! considered, which cuts event volume by orders of magnitude on busy
//! bundle trees. Content hashes suppress no-op rewrites: an event only
//! surfaces when the manifest bytes actually changed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use autoweave_model::{ManifestHash, MANIFEST_FILE_NAME};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::perf::metrics::{Counter, MetricsRegistry, counters};

/// Directory names that never contain plugin manifests worth watching.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".svn",
    ".hg",
    ".cache",
    "__pycache__",
    "target",
];

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Per-path debounce for raw filesystem events.
    pub debounce: Duration,
    /// Depth below the plugin root that is scanned and watched.
    pub max_depth: usize,
    /// Only consider `autoweave.plugin.json` files.
    pub manifest_only: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_depth: 2,
            manifest_only: true,
        }
    }
}

/// Manifest-level change notifications handed to the plugin manager. Every
/// variant carries the manifest path and its bundle directory.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added {
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        bytes: Vec<u8>,
        hash: ManifestHash,
    },
    Changed {
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
        bytes: Vec<u8>,
        hash: ManifestHash,
    },
    Removed {
        manifest_path: PathBuf,
        bundle_dir: PathBuf,
    },
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

/// Watches one plugin directory tree and emits [`WatchEvent`]s.
pub struct PluginWatcher {
    root: PathBuf,
    options: WatcherOptions,
    out: mpsc::Sender<WatchEvent>,
    events: Counter,
    suppressed: Counter,
    running: Option<RunningWatch>,
}

struct RunningWatch {
    watcher: Option<RecommendedWatcher>,
    flush_task: JoinHandle<()>,
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher")
            .field("root", &self.root)
            .field("options", &self.options)
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl PluginWatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        options: WatcherOptions,
        out: mpsc::Sender<WatchEvent>,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            root: root.into(),
            options,
            out,
            events: metrics.counter(counters::WATCHER_EVENTS),
            suppressed: metrics.counter(counters::WATCHER_SUPPRESSED),
            running: None,
        }
    }

    /// Scans the tree for existing manifests, emits `Added` for each, then
    /// attaches the notify watcher and starts the debounced flush loop.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let mut seen: HashMap<PathBuf, ManifestHash> = HashMap::new();
        for manifest_path in
            scan_manifests(&self.root, self.options.max_depth)
        {
            match tokio::fs::read(&manifest_path).await {
                Ok(bytes) => {
                    let hash = ManifestHash::of(&bytes);
                    seen.insert(manifest_path.clone(), hash);
                    self.events.incr();
                    let event = WatchEvent::Added {
                        bundle_dir: bundle_dir_of(&manifest_path),
                        manifest_path,
                        bytes,
                        hash,
                    };
                    if self.out.send(event).await.is_err() {
                        return Err(CoreError::Shutdown);
                    }
                }
                Err(err) => {
                    warn!(
                        path = %manifest_path.display(),
                        error = %err,
                        "failed to read manifest during startup scan"
                    );
                }
            }
        }

        let capacity = 1024;
        let (raw_tx, raw_rx) = mpsc::channel::<WatchMessage>(capacity);

        let watch_root = self.root.clone();
        let watcher = spawn_blocking(move || init_watcher(&watch_root, raw_tx))
            .await
            .map_err(|err| {
                CoreError::Internal(format!("watcher init panicked: {err}"))
            })??;

        let flush_task = spawn_flush_loop(
            self.root.clone(),
            self.options.clone(),
            raw_rx,
            self.out.clone(),
            seen,
            self.events.clone(),
            self.suppressed.clone(),
        );

        self.running = Some(RunningWatch {
            watcher: Some(watcher),
            flush_task,
        });
        info!(root = %self.root.display(), "plugin watcher started");
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(mut running) = self.running.take() {
            // Dropping the watcher stops the notify stream; the flush loop
            // then drains and exits on channel close.
            running.watcher.take();
            if let Err(err) = running.flush_task.await {
                warn!(error = %err, "watcher flush loop ended abnormally");
            }
            info!("plugin watcher stopped");
        }
    }
}

fn bundle_dir_of(manifest_path: &Path) -> PathBuf {
    manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
    })
}

fn within_depth(root: &Path, path: &Path, max_depth: usize) -> bool {
    match path.strip_prefix(root) {
        Ok(rel) => rel.components().count() <= max_depth + 1,
        Err(_) => false,
    }
}

fn is_manifest(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == MANIFEST_FILE_NAME)
}

/// Walks the tree to a bounded depth, collecting manifest files.
fn scan_manifests(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];
    while let Some((dir, depth)) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if is_ignored(&path) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if depth + 1 <= max_depth {
                    stack.push((path, depth + 1));
                }
            } else if is_manifest(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

fn init_watcher(
    root: &Path,
    tx: mpsc::Sender<WatchMessage>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if tx.blocking_send(WatchMessage::Event(event)).is_err() {
                    debug!("watcher channel closed");
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| {
        CoreError::Internal(format!(
            "failed to create watcher for {}: {}",
            root.display(),
            err
        ))
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|err| {
            CoreError::Internal(format!(
                "failed to watch {}: {}",
                root.display(),
                err
            ))
        })?;

    Ok(watcher)
}

struct PendingPath {
    deadline: Instant,
}

#[allow(clippy::too_many_arguments)]
fn spawn_flush_loop(
    root: PathBuf,
    options: WatcherOptions,
    mut raw_rx: mpsc::Receiver<WatchMessage>,
    out: mpsc::Sender<WatchEvent>,
    mut seen: HashMap<PathBuf, ManifestHash>,
    events: Counter,
    suppressed: Counter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, PendingPath> = HashMap::new();

        loop {
            let msg = if pending.is_empty() {
                raw_rx.recv().await
            } else {
                match timeout(options.debounce, raw_rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        flush_due(
                            &mut pending,
                            &mut seen,
                            &out,
                            &events,
                            &suppressed,
                        )
                        .await;
                        continue;
                    }
                }
            };

            let Some(msg) = msg else {
                flush_due(&mut pending, &mut seen, &out, &events, &suppressed)
                    .await;
                break;
            };

            match msg {
                WatchMessage::Event(event) => {
                    note_paths(&root, &options, &mut pending, event);
                }
                WatchMessage::Error(error) => {
                    warn!(error, "filesystem watcher error");
                }
            }
        }
    })
}

/// Queues every interesting path from one raw event, (re)arming its
/// debounce deadline. The event kind is deliberately ignored: whether the
/// path still reads at flush time is what decides added/changed/removed.
fn note_paths(
    root: &Path,
    options: &WatcherOptions,
    pending: &mut HashMap<PathBuf, PendingPath>,
    event: Event,
) {
    for path in event.paths {
        if is_ignored(&path) {
            continue;
        }
        if !within_depth(root, &path, options.max_depth) {
            continue;
        }
        if options.manifest_only && !is_manifest(&path) {
            continue;
        }
        let deadline = Instant::now() + options.debounce;
        pending
            .entry(path)
            .and_modify(|slot| slot.deadline = deadline)
            .or_insert(PendingPath { deadline });
    }
}

/// Settled paths get read, hashed, compared, and emitted.
async fn flush_due(
    pending: &mut HashMap<PathBuf, PendingPath>,
    seen: &mut HashMap<PathBuf, ManifestHash>,
    out: &mpsc::Sender<WatchEvent>,
    events: &Counter,
    suppressed: &Counter,
) {
    let now = Instant::now();
    let due: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, slot)| slot.deadline <= now)
        .map(|(path, _)| path.clone())
        .collect();

    for path in due {
        pending.remove(&path);
        let event = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let hash = ManifestHash::of(&bytes);
                match seen.get(&path) {
                    Some(previous) if *previous == hash => {
                        suppressed.incr();
                        continue;
                    }
                    Some(_) => {
                        seen.insert(path.clone(), hash);
                        WatchEvent::Changed {
                            bundle_dir: bundle_dir_of(&path),
                            manifest_path: path,
                            bytes,
                            hash,
                        }
                    }
                    None => {
                        seen.insert(path.clone(), hash);
                        WatchEvent::Added {
                            bundle_dir: bundle_dir_of(&path),
                            manifest_path: path,
                            bytes,
                            hash,
                        }
                    }
                }
            }
            Err(_) => {
                // Unreadable now: removed if we knew it, noise otherwise.
                if seen.remove(&path).is_none() {
                    continue;
                }
                WatchEvent::Removed {
                    bundle_dir: bundle_dir_of(&path),
                    manifest_path: path,
                }
            }
        };
        events.incr();
        if out.send(event).await.is_err() {
            return;
        }
    }
}
