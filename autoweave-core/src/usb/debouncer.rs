//! Event debouncer: collapses bursts and bounds the event rate without
//! losing action semantics.
//!
//! One cooperative loop over two structures: an arrival-ordered pending set
//! keyed by `(action, signature)` for coalescing, and a ready queue feeding
//! batched emission through a token bucket. Repeated equal events inside
//! the window collapse to one carrying the last snapshot; opposing actions
//! for the same signature are never collapsed. Timer advancement uses the
//! monotonic clock only.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use autoweave_model::{
    DeviceAction, DeviceSignature, EventSource, StreamEvent, UsbDeviceInfo,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::perf::metrics::{Counter, MetricsRegistry, counters};
use crate::perf::token_bucket::TokenBucket;

#[derive(Debug, Clone)]
pub struct DebouncerConfig {
    pub debounce: Duration,
    pub max_events_per_second: u32,
    pub batch_size: usize,
    /// Bound on queued events; enqueues beyond it fail with `Overflow`.
    pub buffer_size: usize,
}

impl Default for DebouncerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            max_events_per_second: 100,
            batch_size: 10,
            buffer_size: 1000,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebouncerError {
    #[error("debouncer queue overflow")]
    Overflow,
    #[error("debouncer closed")]
    Closed,
}

/// Publisher backpressure signal: `Some(len)` while the pending queue is
/// above the high-water mark.
pub type BackpressureSignal = Option<usize>;

/// Cheap cloneable ingress used by the observer.
#[derive(Debug, Clone)]
pub struct DebouncerHandle {
    tx: mpsc::Sender<(DeviceAction, UsbDeviceInfo)>,
}

impl DebouncerHandle {
    /// Enqueues one event. Fails fast with `Overflow` when the buffer is
    /// full; the caller may retry with jitter but must not silently drop.
    pub fn debounce(
        &self,
        action: DeviceAction,
        info: UsbDeviceInfo,
    ) -> Result<(), DebouncerError> {
        self.tx.try_send((action, info)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DebouncerError::Overflow,
            mpsc::error::TrySendError::Closed(_) => DebouncerError::Closed,
        })
    }
}

#[derive(Debug)]
struct Pending {
    action: DeviceAction,
    signature: DeviceSignature,
    info: UsbDeviceInfo,
    enqueued_at: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct Ready {
    event: StreamEvent,
    /// First-enqueue time; drives the oldest-event batch flush rule.
    queued_at: Instant,
}

pub struct EventDebouncer {
    config: DebouncerConfig,
    rx: mpsc::Receiver<(DeviceAction, UsbDeviceInfo)>,
    tx: mpsc::Sender<(DeviceAction, UsbDeviceInfo)>,
    out: mpsc::Sender<Vec<StreamEvent>>,
    backpressure: Option<watch::Receiver<BackpressureSignal>>,
    debounced: Counter,
    rate_limited: Counter,
    batches: Counter,
}

impl std::fmt::Debug for EventDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDebouncer")
            .field("config", &self.config)
            .finish()
    }
}

/// Window stretch applied under publisher backpressure: doubles per
/// activation, capped at 4x the configured window.
fn effective_debounce(base: Duration, multiplier: u32) -> Duration {
    base * multiplier.min(4)
}

fn next_multiplier(current: u32) -> u32 {
    (current * 2).min(4)
}

impl EventDebouncer {
    pub fn new(
        config: DebouncerConfig,
        out: mpsc::Sender<Vec<StreamEvent>>,
        metrics: &MetricsRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        Self {
            config,
            rx,
            tx,
            out,
            backpressure: None,
            debounced: metrics.counter(counters::DEBOUNCED_EVENTS),
            rate_limited: metrics.counter(counters::RATE_LIMITED_EVENTS),
            batches: metrics.counter(counters::DEBOUNCER_BATCHES),
        }
    }

    pub fn handle(&self) -> DebouncerHandle {
        DebouncerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Wires the publisher's backpressure signal in before spawning.
    pub fn set_backpressure(
        &mut self,
        rx: watch::Receiver<BackpressureSignal>,
    ) {
        self.backpressure = Some(rx);
    }

    /// Consumes the debouncer into its event loop. The loop ends when every
    /// handle is dropped and the queue has drained.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let Self {
            config,
            mut rx,
            tx,
            out,
            mut backpressure,
            debounced,
            rate_limited,
            batches,
        } = self;
        // Dropping our own ingress clone lets channel closure propagate
        // from the handles.
        drop(tx);

        let mut pending: Vec<Pending> = Vec::new();
        let mut ready: VecDeque<Ready> = VecDeque::new();
        let mut bucket = TokenBucket::new(config.max_events_per_second);
        let mut multiplier: u32 = 1;
        let mut backpressure_active = false;
        let mut open = true;

        info!(
            debounce_ms = config.debounce.as_millis() as u64,
            batch_size = config.batch_size,
            "event debouncer started"
        );

        while open || !pending.is_empty() || !ready.is_empty() {
            let now = Instant::now();
            let wake = next_wake(&pending, &ready, &mut bucket, &config, now);

            tokio::select! {
                received = rx.recv(), if open => {
                    match received {
                        Some((action, info)) => {
                            let window =
                                effective_debounce(config.debounce, multiplier);
                            coalesce(
                                &mut pending,
                                action,
                                info,
                                Instant::now() + window,
                                &debounced,
                            );
                        }
                        None => open = false,
                    }
                }
                changed = watch_changed(backpressure.as_mut()) => {
                    if changed {
                        let active = backpressure
                            .as_ref()
                            .is_some_and(|rx| rx.borrow().is_some());
                        if active && !backpressure_active {
                            multiplier = next_multiplier(multiplier);
                            debug!(multiplier, "backpressure active, stretching window");
                        } else if !active && backpressure_active {
                            multiplier = 1;
                            debug!("backpressure cleared, window restored");
                        }
                        backpressure_active = active;
                    } else {
                        // Signal source gone; stop listening.
                        backpressure = None;
                    }
                }
                _ = sleep_until(wake), if wake.is_some() => {}
            }

            let now = Instant::now();
            promote_expired(&mut pending, &mut ready, now);
            emit_ready(
                &config,
                &out,
                &batches,
                &rate_limited,
                &mut ready,
                &mut bucket,
                now,
                !open,
            )
            .await;
        }

        info!("event debouncer drained");
    }
}

#[allow(clippy::too_many_arguments)]
async fn emit_ready(
    config: &DebouncerConfig,
    out: &mpsc::Sender<Vec<StreamEvent>>,
    batches: &Counter,
    rate_limited: &Counter,
    ready: &mut VecDeque<Ready>,
    bucket: &mut TokenBucket,
    now: Instant,
    draining: bool,
) {
    loop {
        if ready.is_empty() {
            return;
        }

        // A partial batch only goes out once its head has aged a full
        // window; a full batch goes out immediately.
        let head_aged = ready.front().is_some_and(|item| {
            now.duration_since(item.queued_at) >= config.debounce
        });
        let flush_partial = draining || head_aged;
        if !flush_partial && ready.len() < config.batch_size {
            // Nothing can go out yet; avoid burning rate tokens.
            return;
        }

        let mut batch: Vec<Ready> = Vec::new();
        while batch.len() < config.batch_size && !ready.is_empty() {
            // Shutdown drains regardless of the rate ceiling.
            if !draining && !bucket.try_acquire_at(now) {
                rate_limited.incr();
                break;
            }
            batch.push(ready.pop_front().expect("non-empty"));
        }

        let full = batch.len() >= config.batch_size;
        if batch.is_empty() || (!full && !flush_partial) {
            // Put items back intact, ages preserved, and wait.
            for item in batch.into_iter().rev() {
                ready.push_front(item);
            }
            return;
        }

        batches.incr();
        let events: Vec<StreamEvent> =
            batch.into_iter().map(|item| item.event).collect();
        if out.send(events).await.is_err() {
            debug!("publisher channel closed, discarding readied events");
            ready.clear();
            return;
        }

        if !full {
            return;
        }
    }
}

async fn watch_changed(
    rx: Option<&mut watch::Receiver<BackpressureSignal>>,
) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await
        }
        None => std::future::pending().await,
    }
}

fn coalesce(
    pending: &mut Vec<Pending>,
    action: DeviceAction,
    info: UsbDeviceInfo,
    deadline: Instant,
    debounced: &Counter,
) {
    let signature = info.signature;
    // Same (action, signature) collapses to the latest snapshot, keeping
    // its place in arrival order. Opposing actions stay separate entries.
    if let Some(slot) = pending
        .iter_mut()
        .find(|p| p.action == action && p.signature == signature)
    {
        slot.info = info;
        debounced.incr();
        return;
    }
    pending.push(Pending {
        action,
        signature,
        info,
        enqueued_at: Instant::now(),
        deadline,
    });
}

fn promote_expired(
    pending: &mut Vec<Pending>,
    ready: &mut VecDeque<Ready>,
    now: Instant,
) {
    let mut index = 0;
    while index < pending.len() {
        if pending[index].deadline <= now {
            let slot = pending.remove(index);
            let timestamp_ms =
                chrono::Utc::now().timestamp_millis().max(0) as u64;
            ready.push_back(Ready {
                event: StreamEvent::from_device(
                    EventSource::Observer,
                    slot.action,
                    &slot.info,
                    timestamp_ms,
                ),
                queued_at: slot.enqueued_at,
            });
        } else {
            index += 1;
        }
    }
}

fn next_wake(
    pending: &[Pending],
    ready: &VecDeque<Ready>,
    bucket: &mut TokenBucket,
    config: &DebouncerConfig,
    now: Instant,
) -> Option<Instant> {
    let mut wake: Option<Instant> = pending.iter().map(|p| p.deadline).min();
    if let Some(front) = ready.front() {
        let age_deadline = front.queued_at + config.debounce;
        let token_at = now + bucket.time_until_available(now);
        let emit_at = age_deadline.max(token_at);
        wake = Some(wake.map_or(emit_at, |w| w.min(emit_at)));
    }
    wake
}
