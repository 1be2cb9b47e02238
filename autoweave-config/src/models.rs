//! Configuration models with the documented defaults.
//!
//! Every option except `plugin_directory` has a default, so a minimal config
//! file (or environment) only names the plugin root.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory watched for plugin bundles. Required.
    pub plugin_directory: PathBuf,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Per-path debounce for raw filesystem events.
    pub debounce_ms: u64,
    /// Recursion depth below the plugin directory.
    pub max_depth: usize,
    /// Restrict watching to `autoweave.plugin.json` files.
    pub manifest_only: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            max_depth: 2,
            manifest_only: true,
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    /// Heap ceiling applied when a manifest declares no `max_heap_mb`.
    pub default_max_heap_mb: u32,
    /// Hard host ceiling a manifest may not exceed.
    pub max_heap_ceiling_mb: u32,
    pub hook_timeout_ms: u64,
    pub unload_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            idle_timeout_ms: 300_000,
            health_check_interval_ms: 60_000,
            default_max_heap_mb: 128,
            max_heap_ceiling_mb: 1024,
            hook_timeout_ms: 5_000,
            unload_timeout_ms: 2_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// USB event debounce window.
    pub debounce_ms: u64,
    pub max_events_per_second: u32,
    pub batch_size: usize,
    pub event_buffer_size: usize,
    /// Window after boot during which startup-scan events are replayed to
    /// newly activated plugins.
    pub startup_replay_window_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            max_events_per_second: 100,
            batch_size: 10,
            event_buffer_size: 1000,
            startup_replay_window_ms: 60_000,
        }
    }
}

impl PerformanceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn startup_replay_window(&self) -> Duration {
        Duration::from_millis(self.startup_replay_window_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub timeout_ms: u64,
    pub max_concurrent: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_concurrent: 3,
        }
    }
}

impl LoadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub max_retries: u32,
    /// Pending-queue depth that raises the backpressure signal.
    pub high_water: usize,
    /// Capacity of the pending ring buffer.
    pub pending_capacity: usize,
    /// Drop the oldest pending events instead of failing when the ring is
    /// full. Off by default; overflow is surfaced, never silent.
    pub drop_on_overflow: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            high_water: 500,
            pending_capacity: 2000,
            drop_on_overflow: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub stream: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stream: "aw:hotplug".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the operational endpoint.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9600".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub check_interval_ms: u64,
    pub warn_rss_mb: u64,
    pub critical_rss_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            warn_rss_mb: 768,
            critical_rss_mb: 1024,
        }
    }
}

impl MemoryConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}
