//! Process-wide metrics registry.
//!
//! Counters and gauges are cheap atomics handed out once at component
//! construction; the registry itself is only touched at registration and
//! snapshot time. Every error kind in the runtime increments a distinct
//! counter, so "nothing is silent" is checkable from `/stats`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

/// Well-known counter names, kept together so the operational surface can
/// document them in one place.
pub mod counters {
    pub const OBSERVER_EVENTS: &str = "observer.events";
    pub const OBSERVER_DESCRIPTOR_FAILURES: &str =
        "observer.descriptor_failures";
    pub const OBSERVER_CACHE_HITS: &str = "observer.cache_hits";
    pub const OBSERVER_ERRORS: &str = "observer.errors";

    pub const DEBOUNCED_EVENTS: &str = "debouncer.debounced_events";
    pub const RATE_LIMITED_EVENTS: &str = "debouncer.rate_limited_events";
    pub const DEBOUNCER_BATCHES: &str = "debouncer.batches_emitted";
    pub const DEBOUNCER_OVERFLOWS: &str = "debouncer.overflows";

    pub const PUBLISHED_EVENTS: &str = "publisher.published_events";
    pub const PUBLISH_RETRIES: &str = "publisher.retries";
    pub const BATCH_ERRORS: &str = "publisher.batch_errors";
    pub const PUBLISHER_OVERFLOWS: &str = "publisher.overflows";
    pub const DROPPED_EVENTS: &str = "publisher.dropped_events";

    pub const WATCHER_EVENTS: &str = "watcher.events";
    pub const WATCHER_SUPPRESSED: &str = "watcher.suppressed_unchanged";

    pub const VALIDATIONS: &str = "validator.validations";
    pub const VALIDATION_CACHE_HITS: &str = "validator.cache_hits";
    pub const VALIDATION_FAILURES: &str = "validator.failures";

    pub const PLUGIN_LOADS: &str = "manager.plugin_loads";
    pub const PLUGIN_ERRORS: &str = "manager.plugin_errors";
    pub const DISPATCHED_EVENTS: &str = "manager.dispatched_events";
    pub const HOT_RELOADS: &str = "manager.hot_reloads";

    pub const WORKERS_CREATED: &str = "pool.workers_created";
    pub const WORKERS_TERMINATED: &str = "pool.workers_terminated";
    pub const WORKER_CRASHES: &str = "pool.worker_crashes";
    pub const PERMISSION_DENIALS: &str = "sandbox.permission_denials";
    pub const RESOURCE_KILLS: &str = "pool.resource_kills";
    pub const HEALTH_FAILURES: &str = "pool.health_failures";
}

/// Monotonically increasing counter.
#[derive(Debug, Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Point-in-time value (queue depths, worker counts).
#[derive(Debug, Clone)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Arc<AtomicI64>>>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter(&self, name: &str) -> Counter {
        if let Some(existing) = self.counters.read().get(name) {
            return Counter(Arc::clone(existing));
        }
        let mut counters = self.counters.write();
        let cell = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        Counter(Arc::clone(cell))
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        if let Some(existing) = self.gauges.read().get(name) {
            return Gauge(Arc::clone(existing));
        }
        let mut gauges = self.gauges.write();
        let cell = gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)));
        Gauge(Arc::clone(cell))
    }

    /// Stable-ordered snapshot for the operational endpoint.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        for (name, cell) in self.counters.read().iter() {
            out.insert(
                name.clone(),
                i64::try_from(cell.load(Ordering::Relaxed)).unwrap_or(i64::MAX),
            );
        }
        for (name, cell) in self.gauges.read().iter() {
            out.insert(name.clone(), cell.load(Ordering::Relaxed));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_handles_share_storage() {
        let registry = MetricsRegistry::new();
        let a = registry.counter(counters::DEBOUNCED_EVENTS);
        let b = registry.counter(counters::DEBOUNCED_EVENTS);
        a.incr();
        b.add(2);
        assert_eq!(a.get(), 3);
    }

    #[test]
    fn snapshot_includes_counters_and_gauges() {
        let registry = MetricsRegistry::new();
        registry.counter("x.count").add(7);
        registry.gauge("x.depth").set(-3);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.get("x.count"), Some(&7));
        assert_eq!(snapshot.get("x.depth"), Some(&-3));
    }
}
