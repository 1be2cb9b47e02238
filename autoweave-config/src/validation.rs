//! Guard-rail validation for loaded configuration.
//!
//! Hard errors cover combinations the runtime cannot operate under;
//! warnings cover legal but suspicious values the operator should see in
//! the startup log.

use thiserror::Error;

use crate::models::Config;

#[derive(Error, Debug)]
pub enum ConfigGuardRailError {
    #[error("worker_pool.min_workers ({min}) exceeds max_workers ({max})")]
    WorkerBounds { min: usize, max: usize },

    #[error("performance.batch_size ({batch}) exceeds event_buffer_size ({buffer})")]
    BatchExceedsBuffer { batch: usize, buffer: usize },

    #[error(
        "worker_pool.default_max_heap_mb ({default}) exceeds max_heap_ceiling_mb ({ceiling})"
    )]
    HeapDefaultAboveCeiling { default: u32, ceiling: u32 },

    #[error("{option} must be greater than zero")]
    ZeroValue { option: &'static str },

    #[error("watcher.max_depth must be at least 1")]
    WatcherDepth,

    #[error("memory.warn_rss_mb ({warn}) must not exceed critical_rss_mb ({critical})")]
    MemoryWatermarks { warn: u64, critical: u64 },
}

/// A legal but questionable setting, surfaced in the startup log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub option: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.option, self.message)
    }
}

pub fn validate(
    config: &Config,
) -> Result<Vec<ConfigWarning>, ConfigGuardRailError> {
    let pool = &config.worker_pool;
    if pool.min_workers > pool.max_workers {
        return Err(ConfigGuardRailError::WorkerBounds {
            min: pool.min_workers,
            max: pool.max_workers,
        });
    }
    if pool.max_workers == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            option: "worker_pool.max_workers",
        });
    }
    if pool.default_max_heap_mb > pool.max_heap_ceiling_mb {
        return Err(ConfigGuardRailError::HeapDefaultAboveCeiling {
            default: pool.default_max_heap_mb,
            ceiling: pool.max_heap_ceiling_mb,
        });
    }

    let perf = &config.performance;
    if perf.batch_size > perf.event_buffer_size {
        return Err(ConfigGuardRailError::BatchExceedsBuffer {
            batch: perf.batch_size,
            buffer: perf.event_buffer_size,
        });
    }
    for (option, value) in [
        ("performance.debounce_ms", perf.debounce_ms),
        ("load.timeout_ms", config.load.timeout_ms),
        ("shutdown.timeout_ms", config.shutdown.timeout_ms),
        ("watcher.debounce_ms", config.watcher.debounce_ms),
        (
            "worker_pool.hook_timeout_ms",
            config.worker_pool.hook_timeout_ms,
        ),
    ] {
        if value == 0 {
            return Err(ConfigGuardRailError::ZeroValue { option });
        }
    }
    if perf.batch_size == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            option: "performance.batch_size",
        });
    }
    if config.load.max_concurrent == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            option: "load.max_concurrent",
        });
    }

    if config.watcher.max_depth == 0 {
        return Err(ConfigGuardRailError::WatcherDepth);
    }

    let memory = &config.memory;
    if memory.warn_rss_mb > memory.critical_rss_mb {
        return Err(ConfigGuardRailError::MemoryWatermarks {
            warn: memory.warn_rss_mb,
            critical: memory.critical_rss_mb,
        });
    }

    let mut warnings = Vec::new();
    if perf.debounce_ms > 1_000 {
        warnings.push(ConfigWarning {
            option: "performance.debounce_ms",
            message: format!(
                "{} ms debounce will visibly delay hot-plug delivery",
                perf.debounce_ms
            ),
        });
    }
    if perf.max_events_per_second > 10_000 {
        warnings.push(ConfigWarning {
            option: "performance.max_events_per_second",
            message: "rate ceiling is effectively unlimited".to_string(),
        });
    }
    if pool.max_workers > 64 {
        warnings.push(ConfigWarning {
            option: "worker_pool.max_workers",
            message: format!(
                "{} sandbox threads will oversubscribe most hosts",
                pool.max_workers
            ),
        });
    }
    if config.publisher.high_water >= config.publisher.pending_capacity {
        warnings.push(ConfigWarning {
            option: "publisher.high_water",
            message: "high-water mark at or above pending capacity leaves no headroom"
                .to_string(),
        });
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Config;

    fn base_config() -> Config {
        let raw = config::Config::builder()
            .set_override("plugin_directory", "/opt/plugins")
            .unwrap()
            .build()
            .unwrap();
        raw.try_deserialize().unwrap()
    }

    #[test]
    fn default_config_passes_clean() {
        let warnings = validate(&base_config()).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn min_above_max_workers_rejected() {
        let mut config = base_config();
        config.worker_pool.min_workers = 11;
        assert!(matches!(
            validate(&config),
            Err(ConfigGuardRailError::WorkerBounds { .. })
        ));
    }

    #[test]
    fn batch_above_buffer_rejected() {
        let mut config = base_config();
        config.performance.batch_size = 2000;
        assert!(matches!(
            validate(&config),
            Err(ConfigGuardRailError::BatchExceedsBuffer { .. })
        ));
    }

    #[test]
    fn heap_default_above_ceiling_rejected() {
        let mut config = base_config();
        config.worker_pool.default_max_heap_mb = 2048;
        assert!(matches!(
            validate(&config),
            Err(ConfigGuardRailError::HeapDefaultAboveCeiling { .. })
        ));
    }

    #[test]
    fn slow_debounce_warns() {
        let mut config = base_config();
        config.performance.debounce_ms = 5_000;
        let warnings = validate(&config).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].option, "performance.debounce_ms");
    }
}
