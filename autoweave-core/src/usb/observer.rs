//! Device observer: turns raw hotplug notifications into device snapshots.
//!
//! Descriptor extraction can block on string-descriptor I/O, so it runs on
//! the blocking pool and is memoized per device location. Detach events are
//! answered from the memo so they carry the same metadata as the preceding
//! attach. Extraction failure degrades to a bare snapshot; events are never
//! dropped on that path, otherwise detach accounting would drift.

use std::sync::Arc;
use std::time::{Duration, Instant};

use autoweave_model::{DeviceAction, UsbDeviceInfo};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{ControlBus, ControlEvent};
use crate::perf::lru::SharedTtlLru;
use crate::perf::metrics::{Counter, MetricsRegistry, counters};
use crate::usb::backend::{
    BackendTask, DeviceDescriptors, DeviceLocation, ObserverError,
    RawHotplugEvent, UsbBackend,
};
use crate::usb::debouncer::{DebouncerError, DebouncerHandle};

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Capacity of the raw backend -> observer channel.
    pub channel_capacity: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// Jittered retries against a full debouncer before alarming.
    pub enqueue_retries: u32,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            cache_capacity: 256,
            cache_ttl: Duration::from_secs(60),
            enqueue_retries: 5,
        }
    }
}

type DescriptorKey = (u16, u16, u8, u8);

struct Running {
    backend_task: BackendTask,
    loop_handle: JoinHandle<()>,
}

pub struct DeviceObserver {
    backend: Arc<dyn UsbBackend>,
    config: ObserverConfig,
    debouncer: DebouncerHandle,
    bus: Arc<ControlBus>,
    cache: SharedTtlLru<DescriptorKey, DeviceDescriptors>,
    events: Counter,
    cache_hits: Counter,
    descriptor_failures: Counter,
    errors: Counter,
    epoch: Instant,
    running: Option<Running>,
}

impl std::fmt::Debug for DeviceObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceObserver")
            .field("config", &self.config)
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl DeviceObserver {
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        config: ObserverConfig,
        debouncer: DebouncerHandle,
        metrics: &MetricsRegistry,
        bus: Arc<ControlBus>,
    ) -> Self {
        let cache = SharedTtlLru::new(
            config.cache_capacity,
            Some(config.cache_ttl),
        );
        Self {
            backend,
            config,
            debouncer,
            bus,
            cache,
            events: metrics.counter(counters::OBSERVER_EVENTS),
            cache_hits: metrics.counter(counters::OBSERVER_CACHE_HITS),
            descriptor_failures: metrics
                .counter(counters::OBSERVER_DESCRIPTOR_FAILURES),
            errors: metrics.counter(counters::OBSERVER_ERRORS),
            epoch: Instant::now(),
            running: None,
        }
    }

    /// The extraction memo, exposed for memory-pressure registration.
    pub fn descriptor_cache(
        &self,
    ) -> SharedTtlLru<DescriptorKey, DeviceDescriptors> {
        self.cache.clone()
    }

    /// Subscribes to the backend and starts the translation loop. Devices
    /// already attached are re-emitted as synthetic attach events.
    pub async fn start(&mut self) -> Result<(), ObserverError> {
        if self.running.is_some() {
            return Ok(());
        }

        let (raw_tx, raw_rx) =
            mpsc::channel::<RawHotplugEvent>(self.config.channel_capacity);
        let backend = Arc::clone(&self.backend);
        let backend_task =
            tokio::task::spawn_blocking(move || backend.start(raw_tx))
                .await
                .map_err(|err| {
                    ObserverError::new(
                        crate::usb::backend::ObserverErrorKind::BackendUnavailable,
                        format!("backend start panicked: {err}"),
                    )
                })??;

        let loop_handle = self.spawn_loop(raw_rx);
        self.running = Some(Running {
            backend_task,
            loop_handle,
        });
        info!("device observer started");
        Ok(())
    }

    /// Unsubscribes and drains. No events reach the debouncer after this
    /// returns.
    pub async fn stop(&mut self) {
        let Some(Running {
            backend_task,
            loop_handle,
        }) = self.running.take()
        else {
            return;
        };
        let _ = tokio::task::spawn_blocking(move || {
            backend_task.stop();
        })
        .await;
        // The backend held the only senders; the loop ends once the
        // channel drains.
        if let Err(err) = loop_handle.await {
            warn!(error = %err, "observer loop ended abnormally");
        }
        info!("device observer stopped");
    }

    fn spawn_loop(
        &self,
        mut raw_rx: mpsc::Receiver<RawHotplugEvent>,
    ) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let debouncer = self.debouncer.clone();
        let bus = Arc::clone(&self.bus);
        let cache = self.cache.clone();
        let events = self.events.clone();
        let cache_hits = self.cache_hits.clone();
        let descriptor_failures = self.descriptor_failures.clone();
        let errors = self.errors.clone();
        let epoch = self.epoch;
        let retries = self.config.enqueue_retries;

        tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                events.incr();
                let info = extract_snapshot(
                    &backend,
                    &cache,
                    &cache_hits,
                    &descriptor_failures,
                    epoch,
                    &raw,
                )
                .await;

                if !enqueue_with_jitter(&debouncer, raw.action, info, retries)
                    .await
                {
                    errors.incr();
                    bus.emit(ControlEvent::ObserverAlarm {
                        message: format!(
                            "debouncer overflow persisted for {} {}",
                            raw.action, raw.location.port_path
                        ),
                    });
                }
            }
            debug!("observer loop drained");
        })
    }
}

async fn extract_snapshot(
    backend: &Arc<dyn UsbBackend>,
    cache: &SharedTtlLru<DescriptorKey, DeviceDescriptors>,
    cache_hits: &Counter,
    descriptor_failures: &Counter,
    epoch: Instant,
    raw: &RawHotplugEvent,
) -> UsbDeviceInfo {
    let location = &raw.location;
    let key = (
        location.vendor_id,
        location.product_id,
        location.bus_number,
        location.device_address,
    );

    let cached = cache.lock().get(&key).cloned();
    let descriptors = match cached {
        Some(descriptors) => {
            cache_hits.incr();
            Some(descriptors)
        }
        // The device is gone on detach; only the memo can answer.
        None if raw.action == DeviceAction::Detach => None,
        None => {
            let backend = Arc::clone(backend);
            let read_location = location.clone();
            match tokio::task::spawn_blocking(move || {
                backend.read_descriptors(&read_location)
            })
            .await
            {
                Ok(Ok(descriptors)) => {
                    cache.lock().insert(key, descriptors.clone());
                    Some(descriptors)
                }
                Ok(Err(err)) => {
                    descriptor_failures.incr();
                    warn!(
                        port = %location.port_path,
                        error = %err,
                        "descriptor extraction failed, emitting bare snapshot"
                    );
                    None
                }
                Err(join_err) => {
                    descriptor_failures.incr();
                    error!(error = %join_err, "descriptor extraction panicked");
                    None
                }
            }
        }
    };

    let timestamp_ms = epoch.elapsed().as_millis() as u64;
    let mut info = UsbDeviceInfo::bare(
        location.vendor_id,
        location.product_id,
        location.bus_number,
        location.device_address,
        location.port_path.clone(),
        timestamp_ms,
    );
    if let Some(descriptors) = descriptors {
        info.manufacturer = descriptors.manufacturer;
        info.product = descriptors.product;
        info.serial_number = descriptors.serial_number;
        info.device_class = descriptors.device_class;
        info.device_subclass = descriptors.device_subclass;
        info.device_protocol = descriptors.device_protocol;
    }
    info
}

/// Retries a full debouncer with growing jittered backoff. Returns false if
/// the event had to be abandoned (which is alarmed, never silent).
async fn enqueue_with_jitter(
    debouncer: &DebouncerHandle,
    action: DeviceAction,
    info: UsbDeviceInfo,
    retries: u32,
) -> bool {
    let mut attempt = 0u32;
    loop {
        match debouncer.debounce(action, info.clone()) {
            Ok(()) => return true,
            Err(DebouncerError::Closed) => return false,
            Err(DebouncerError::Overflow) => {
                attempt += 1;
                if attempt > retries {
                    return false;
                }
                let jitter_ms = rand::rng().random_range(1..=20);
                let delay = Duration::from_millis(
                    u64::from(attempt) * 10 + jitter_ms,
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
