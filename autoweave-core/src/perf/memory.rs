//! Process-wide memory monitor.
//!
//! Samples resident set size on an interval and compares it against the
//! warn/critical watermarks. Registered caches shrink to half capacity on
//! `Warn` and flush on `Critical`; worker heaps are enforced separately by
//! their own store limits.

use std::sync::Arc;

use autoweave_config::MemoryConfig;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{ControlBus, ControlEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Normal,
    Warn,
    Critical,
}

/// Caches that respond to memory pressure implement this and register with
/// the monitor at startup.
pub trait PressureSubscriber: Send + Sync {
    fn on_pressure(&self, pressure: MemoryPressure);
}

#[derive(Debug)]
pub struct MemoryMonitor {
    config: MemoryConfig,
    bus: Arc<ControlBus>,
    subscribers: Vec<Arc<dyn PressureSubscriber>>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryConfig, bus: Arc<ControlBus>) -> Self {
        Self {
            config,
            bus,
            subscribers: Vec::new(),
        }
    }

    pub fn register(&mut self, subscriber: Arc<dyn PressureSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Classifies an RSS sample against the watermarks.
    fn classify(&self, rss_mb: u64) -> MemoryPressure {
        if rss_mb >= self.config.critical_rss_mb {
            MemoryPressure::Critical
        } else if rss_mb >= self.config.warn_rss_mb {
            MemoryPressure::Warn
        } else {
            MemoryPressure::Normal
        }
    }

    fn notify(&self, pressure: MemoryPressure, rss_mb: u64) {
        match pressure {
            MemoryPressure::Normal => {}
            MemoryPressure::Warn => {
                warn!(rss_mb, "memory above warning watermark, shrinking caches");
                self.bus.emit(ControlEvent::MemoryWarning { rss_mb });
            }
            MemoryPressure::Critical => {
                warn!(rss_mb, "memory above critical watermark, flushing caches");
                self.bus.emit(ControlEvent::MemoryCritical { rss_mb });
            }
        }
        if pressure > MemoryPressure::Normal {
            for subscriber in &self.subscribers {
                subscriber.on_pressure(pressure);
            }
        }
    }

    /// Spawns the sampling loop. Pressure is re-announced only on level
    /// changes so a host sitting at the watermark does not spam the bus.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(self.config.check_interval());
            interval.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Skip,
            );
            let mut last = MemoryPressure::Normal;
            loop {
                interval.tick().await;
                let Some(rss_mb) = sample_rss_mb() else {
                    debug!("rss sampling unavailable on this platform");
                    continue;
                };
                let pressure = self.classify(rss_mb);
                if pressure != last {
                    self.notify(pressure, rss_mb);
                    last = pressure;
                }
            }
        })
    }
}

impl std::fmt::Debug for dyn PressureSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PressureSubscriber")
    }
}

/// Resident set size in MiB, from `/proc/self/status` on Linux.
#[cfg(target_os = "linux")]
pub fn sample_rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn sample_rss_mb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<MemoryPressure>>);

    impl PressureSubscriber for Recorder {
        fn on_pressure(&self, pressure: MemoryPressure) {
            self.0.lock().push(pressure);
        }
    }

    fn monitor_with(warn: u64, critical: u64) -> MemoryMonitor {
        let config = MemoryConfig {
            check_interval_ms: 1000,
            warn_rss_mb: warn,
            critical_rss_mb: critical,
        };
        MemoryMonitor::new(config, Arc::new(ControlBus::new(8)))
    }

    #[test]
    fn classification_respects_watermarks() {
        let monitor = monitor_with(700, 1000);
        assert_eq!(monitor.classify(100), MemoryPressure::Normal);
        assert_eq!(monitor.classify(700), MemoryPressure::Warn);
        assert_eq!(monitor.classify(1200), MemoryPressure::Critical);
    }

    #[tokio::test]
    async fn notify_reaches_subscribers_and_bus() {
        let mut monitor = monitor_with(700, 1000);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        monitor.register(recorder.clone());
        let mut rx = monitor.bus.subscribe();

        monitor.notify(MemoryPressure::Critical, 1100);
        assert_eq!(
            recorder.0.lock().as_slice(),
            &[MemoryPressure::Critical]
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            ControlEvent::MemoryCritical { rss_mb: 1100 }
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_sampling_reads_proc() {
        assert!(sample_rss_mb().is_some());
    }
}
