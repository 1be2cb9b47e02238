//! Batch publisher: at-least-once delivery into the durable stream.
//!
//! Batches from the debouncer land in a bounded pending ring and are
//! submitted head-first, one pipelined transaction per chunk. Transient
//! failures retry with exponential backoff; terminal failures emit a
//! `batch-error` signal but keep the events queued, so every event is
//! either persisted at least once or named by a batch error - never
//! neither. A high-water mark on the ring raises the backpressure signal
//! the debouncer listens to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use autoweave_model::StreamEvent;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{ControlBus, ControlEvent};
use crate::perf::metrics::{Counter, Gauge, MetricsRegistry, counters};
use crate::perf::object_pool::{ObjectPool, Reset};
use crate::perf::ring::RingBuffer;
use crate::usb::debouncer::BackpressureSignal;

/// Recycled staging buffer for one pipelined submission.
#[derive(Debug, Default)]
struct ChunkBuffer(Vec<StreamEvent>);

impl Reset for ChunkBuffer {
    fn reset(&mut self) {
        self.0.clear();
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("stream connection error: {0}")]
    Connection(String),

    #[error("stream operation timed out")]
    Timeout,

    #[error("permanent stream error: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Permanent(_))
    }
}

/// Durable append-only stream seam; production is Redis, tests mock it.
#[async_trait]
pub trait StreamSink: Send + Sync + 'static {
    async fn append_batch(
        &self,
        events: &[StreamEvent],
    ) -> Result<(), TransportError>;
}

/// Redis Streams sink: one `XADD <stream> *` per event, pipelined so a
/// batch costs a single round trip.
#[derive(Clone)]
pub struct RedisStreamSink {
    conn: ConnectionManager,
    stream: String,
}

impl std::fmt::Debug for RedisStreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamSink")
            .field("stream", &self.stream)
            .finish()
    }
}

fn map_redis_error(err: redis::RedisError) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_io_error() || err.is_connection_refusal() {
        TransportError::Connection(err.to_string())
    } else {
        TransportError::Permanent(err.to_string())
    }
}

impl RedisStreamSink {
    pub async fn connect(
        url: &str,
        stream: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let stream = stream.into();
        info!(url, stream, "connecting to stream backend");
        let client = redis::Client::open(url)
            .map_err(|err| TransportError::Permanent(err.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        Ok(Self { conn, stream })
    }
}

#[async_trait]
impl StreamSink for RedisStreamSink {
    async fn append_batch(
        &self,
        events: &[StreamEvent],
    ) -> Result<(), TransportError> {
        let mut pipe = redis::pipe();
        for event in events {
            let mut cmd = redis::cmd("XADD");
            cmd.arg(&self.stream).arg("*");
            for (field, value) in event.to_fields() {
                cmd.arg(field).arg(value);
            }
            pipe.add_command(cmd);
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Events submitted per pipelined transaction.
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub high_water: usize,
    pub pending_capacity: usize,
    pub drop_on_overflow: bool,
    pub shutdown_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            high_water: 500,
            pending_capacity: 2000,
            drop_on_overflow: false,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

enum PublisherCommand {
    Flush { reply: oneshot::Sender<bool> },
}

/// Control handle; the data path stays on the debouncer's batch channel.
#[derive(Clone)]
pub struct PublisherHandle {
    cmd_tx: mpsc::Sender<PublisherCommand>,
}

impl std::fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PublisherHandle")
    }
}

impl PublisherHandle {
    /// Drains the pending queue, bounded by the publisher's shutdown
    /// budget. Returns whether the queue emptied.
    pub async fn force_flush(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PublisherCommand::Flush { reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

pub struct BatchPublisher {
    sink: Arc<dyn StreamSink>,
    config: PublisherConfig,
    in_rx: mpsc::Receiver<Vec<StreamEvent>>,
    cmd_rx: mpsc::Receiver<PublisherCommand>,
    backpressure_tx: watch::Sender<BackpressureSignal>,
    bus: Arc<ControlBus>,
    chunks: ObjectPool<ChunkBuffer>,
    published: Counter,
    retries: Counter,
    batch_errors: Counter,
    overflows: Counter,
    dropped: Counter,
    depth: Gauge,
}

impl std::fmt::Debug for BatchPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPublisher")
            .field("config", &self.config)
            .finish()
    }
}

impl BatchPublisher {
    pub fn new(
        sink: Arc<dyn StreamSink>,
        config: PublisherConfig,
        in_rx: mpsc::Receiver<Vec<StreamEvent>>,
        metrics: &MetricsRegistry,
        bus: Arc<ControlBus>,
    ) -> (Self, PublisherHandle, watch::Receiver<BackpressureSignal>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (backpressure_tx, backpressure_rx) = watch::channel(None);
        let publisher = Self {
            sink,
            config,
            in_rx,
            cmd_rx,
            backpressure_tx,
            bus,
            chunks: ObjectPool::new(4),
            published: metrics.counter(counters::PUBLISHED_EVENTS),
            retries: metrics.counter(counters::PUBLISH_RETRIES),
            batch_errors: metrics.counter(counters::BATCH_ERRORS),
            overflows: metrics.counter(counters::PUBLISHER_OVERFLOWS),
            dropped: metrics.counter(counters::DROPPED_EVENTS),
            depth: metrics.gauge("publisher.pending_depth"),
        };
        (publisher, PublisherHandle { cmd_tx }, backpressure_rx)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut pending: RingBuffer<StreamEvent> =
            RingBuffer::new(self.config.pending_capacity.max(1));
        let mut backpressure_active = false;
        let mut failures: u32 = 0;
        let mut backoff_until: Option<Instant> = None;
        let mut open = true;

        info!(
            batch_size = self.config.batch_size,
            high_water = self.config.high_water,
            "batch publisher started"
        );

        loop {
            let now = Instant::now();
            let in_backoff =
                backoff_until.is_some_and(|until| until > now);

            if !pending.is_empty() && !in_backoff {
                self.submit_head(&mut pending, &mut failures, &mut backoff_until)
                    .await;
                self.update_backpressure(
                    pending.len(),
                    &mut backpressure_active,
                );
                if !open && pending.is_empty() {
                    break;
                }
                continue;
            }

            if !open && pending.is_empty() {
                break;
            }

            // Only accept input when a full debouncer batch fits.
            let room = pending.len() + self.config.batch_size
                <= pending.capacity();

            tokio::select! {
                received = self.in_rx.recv(), if open && room => {
                    match received {
                        Some(batch) => {
                            self.enqueue(batch, &mut pending);
                            self.update_backpressure(
                                pending.len(),
                                &mut backpressure_active,
                            );
                        }
                        None => open = false,
                    }
                }
                command = self.cmd_rx.recv() => {
                    if let Some(PublisherCommand::Flush { reply }) = command {
                        let drained = self
                            .drain(&mut pending, self.config.shutdown_timeout)
                            .await;
                        self.update_backpressure(
                            pending.len(),
                            &mut backpressure_active,
                        );
                        let _ = reply.send(drained);
                    }
                }
                _ = sleep_until(backoff_until), if in_backoff => {
                    backoff_until = None;
                }
            }
        }

        if !pending.is_empty() {
            // Final drain attempt inside the shutdown budget; whatever is
            // left is surfaced as a batch error, never silently lost.
            if !self.drain(&mut pending, self.config.shutdown_timeout).await {
                self.emit_batch_error(
                    pending.len(),
                    "shutdown with events still pending",
                );
            }
        }
        info!("batch publisher stopped");
    }

    fn enqueue(
        &self,
        batch: Vec<StreamEvent>,
        pending: &mut RingBuffer<StreamEvent>,
    ) {
        for event in batch {
            if pending.push(event).is_err() {
                self.overflows.incr();
                if self.config.drop_on_overflow {
                    // Explicitly configured lossy mode: shed the oldest.
                    let last = pending.pop();
                    self.dropped.incr();
                    drop(last);
                } else {
                    warn!("publisher pending queue overflow");
                }
            }
        }
        self.depth.set(pending.len() as i64);
    }

    /// One submission attempt for the head chunk. Order within the ring is
    /// preserved: nothing is consumed until the sink accepts the chunk.
    async fn submit_head(
        &self,
        pending: &mut RingBuffer<StreamEvent>,
        failures: &mut u32,
        backoff_until: &mut Option<Instant>,
    ) {
        let mut chunk = self.chunks.acquire();
        chunk
            .0
            .extend(pending.peek_front(self.config.batch_size).cloned());
        if chunk.0.is_empty() {
            return;
        }

        match self.sink.append_batch(&chunk.0).await {
            Ok(()) => {
                pending.consume(chunk.0.len());
                self.published.add(chunk.0.len() as u64);
                self.depth.set(pending.len() as i64);
                *failures = 0;
                *backoff_until = None;
            }
            Err(err) if err.is_retryable() && *failures < self.config.max_retries => {
                *failures += 1;
                self.retries.incr();
                let backoff = retry_backoff(
                    self.config.base_backoff,
                    self.config.max_backoff,
                    *failures,
                );
                debug!(
                    attempt = *failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "stream submit failed, backing off"
                );
                *backoff_until = Some(Instant::now() + backoff);
            }
            Err(err) => {
                // Terminal for this cycle: announce, keep events queued,
                // and retry at the slow cadence.
                self.emit_batch_error(chunk.0.len(), &err.to_string());
                *failures = 0;
                *backoff_until =
                    Some(Instant::now() + self.config.max_backoff);
            }
        }
    }

    async fn drain(
        &self,
        pending: &mut RingBuffer<StreamEvent>,
        budget: Duration,
    ) -> bool {
        let deadline = Instant::now() + budget;
        let mut failures = 0u32;
        while !pending.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            let mut backoff_until = None;
            self.submit_head(pending, &mut failures, &mut backoff_until)
                .await;
            if let Some(until) = backoff_until {
                let wait = until
                    .min(deadline)
                    .saturating_duration_since(Instant::now());
                tokio::time::sleep(wait).await;
            }
        }
        true
    }

    fn update_backpressure(&self, len: usize, active: &mut bool) {
        self.depth.set(len as i64);
        if len > self.config.high_water && !*active {
            *active = true;
            let _ = self.backpressure_tx.send(Some(len));
            self.bus.emit(ControlEvent::Backpressure { length: len, active: true });
            warn!(len, "publisher backpressure raised");
        } else if *active && len <= self.config.high_water / 2 {
            *active = false;
            let _ = self.backpressure_tx.send(None);
            self.bus.emit(ControlEvent::Backpressure { length: len, active: false });
            info!(len, "publisher backpressure cleared");
        }
    }

    fn emit_batch_error(&self, batch_len: usize, message: &str) {
        self.batch_errors.incr();
        warn!(batch_len, message, "batch error");
        self.bus.emit(ControlEvent::BatchError {
            batch_len,
            message: message.to_string(),
        });
    }
}

fn retry_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16));
    exp.min(cap)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoweave_model::{DeviceAction, EventSource, UsbDeviceInfo};
    use parking_lot::Mutex;

    fn event(address: u8) -> StreamEvent {
        let info =
            UsbDeviceInfo::bare(0x1234, 0x5678, 1, address, "1-4".into(), 0);
        StreamEvent::from_device(
            EventSource::Observer,
            DeviceAction::Attach,
            &info,
            1_700_000_000_000,
        )
    }

    /// Sink that fails the first `fail_first` calls, then accepts.
    struct FlakySink {
        fail_first: Mutex<u32>,
        accepted: Mutex<Vec<StreamEvent>>,
    }

    impl FlakySink {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first: Mutex::new(fail_first),
                accepted: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamSink for FlakySink {
        async fn append_batch(
            &self,
            events: &[StreamEvent],
        ) -> Result<(), TransportError> {
            let mut remaining = self.fail_first.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Connection(
                    "refused".to_string(),
                ));
            }
            self.accepted.lock().extend_from_slice(events);
            Ok(())
        }
    }

    fn harness(
        sink: Arc<dyn StreamSink>,
        config: PublisherConfig,
    ) -> (
        mpsc::Sender<Vec<StreamEvent>>,
        PublisherHandle,
        watch::Receiver<BackpressureSignal>,
        Arc<ControlBus>,
        Arc<MetricsRegistry>,
    ) {
        let metrics = MetricsRegistry::new();
        let bus = Arc::new(ControlBus::new(64));
        let (in_tx, in_rx) = mpsc::channel(8);
        let (publisher, handle, backpressure) = BatchPublisher::new(
            sink,
            config,
            in_rx,
            &metrics,
            Arc::clone(&bus),
        );
        publisher.spawn();
        (in_tx, handle, backpressure, bus, metrics)
    }

    #[tokio::test]
    async fn publishes_batch_in_order() {
        let sink = FlakySink::new(0);
        let (in_tx, handle, _bp, _bus, metrics) = harness(
            sink.clone(),
            PublisherConfig::default(),
        );
        in_tx
            .send(vec![event(1), event(2), event(3)])
            .await
            .unwrap();
        assert!(handle.force_flush().await);
        let accepted = sink.accepted.lock();
        let addresses: Vec<u16> =
            accepted.iter().map(|e| e.vendor_id).collect();
        assert_eq!(accepted.len(), 3);
        assert_eq!(addresses, vec![0x1234; 3]);
        assert_eq!(
            metrics.counter(counters::PUBLISHED_EVENTS).get(),
            3
        );
    }

    #[tokio::test]
    async fn transient_failure_retries_without_loss() {
        let sink = FlakySink::new(2);
        let (in_tx, handle, _bp, _bus, metrics) = harness(
            sink.clone(),
            PublisherConfig {
                base_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                ..PublisherConfig::default()
            },
        );
        in_tx.send(vec![event(1), event(2)]).await.unwrap();
        assert!(handle.force_flush().await);
        assert_eq!(sink.accepted.lock().len(), 2);
        assert!(metrics.counter(counters::PUBLISH_RETRIES).get() >= 2);
        assert_eq!(metrics.counter(counters::BATCH_ERRORS).get(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_emit_batch_error_and_keep_events() {
        let sink = FlakySink::new(10);
        let (in_tx, handle, _bp, bus, metrics) = harness(
            sink.clone(),
            PublisherConfig {
                max_retries: 2,
                base_backoff: Duration::from_millis(2),
                max_backoff: Duration::from_millis(10),
                ..PublisherConfig::default()
            },
        );
        let mut events_rx = bus.subscribe();
        in_tx.send(vec![event(1)]).await.unwrap();

        // Wait for the batch-error signal.
        let batch_error = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let ControlEvent::BatchError { .. } =
                    events_rx.recv().await.unwrap()
                {
                    break;
                }
            }
        })
        .await;
        assert!(batch_error.is_ok(), "expected a batch-error signal");
        assert!(metrics.counter(counters::BATCH_ERRORS).get() >= 1);

        // The sink recovers; the event is still delivered.
        assert!(handle.force_flush().await);
        assert_eq!(sink.accepted.lock().len(), 1);
    }

    #[tokio::test]
    async fn high_water_raises_and_clears_backpressure() {
        let sink = FlakySink::new(3);
        let (in_tx, handle, mut bp, _bus, _metrics) = harness(
            sink.clone(),
            PublisherConfig {
                batch_size: 2,
                high_water: 3,
                pending_capacity: 64,
                base_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(50),
                max_retries: 10,
                ..PublisherConfig::default()
            },
        );
        // Fill past the high-water mark while the sink refuses.
        for _ in 0..3 {
            in_tx.send(vec![event(1), event(2)]).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                bp.changed().await.unwrap();
                if bp.borrow().is_some() {
                    break;
                }
            }
        })
        .await
        .expect("backpressure signal should activate");

        // After recovery the signal clears.
        assert!(handle.force_flush().await);
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if bp.borrow().is_none() {
                    break;
                }
                bp.changed().await.unwrap();
            }
        })
        .await
        .expect("backpressure signal should clear");
        assert_eq!(sink.accepted.lock().len(), 6);
    }

    mockall::mock! {
        Sink {}

        #[async_trait]
        impl StreamSink for Sink {
            async fn append_batch(
                &self,
                events: &[StreamEvent],
            ) -> Result<(), TransportError>;
        }
    }

    #[tokio::test]
    async fn permanent_errors_skip_the_retry_ladder() {
        let mut mock = MockSink::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_append_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(TransportError::Permanent("schema rejected".into()))
            });
        mock.expect_append_batch()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (in_tx, handle, _bp, bus, metrics) = harness(
            Arc::new(mock),
            PublisherConfig {
                max_backoff: Duration::from_millis(20),
                ..PublisherConfig::default()
            },
        );
        let mut control = bus.subscribe();
        in_tx.send(vec![event(1)]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let ControlEvent::BatchError { .. } =
                    control.recv().await.unwrap()
                {
                    break;
                }
            }
        })
        .await
        .expect("permanent failure must announce a batch error");
        assert_eq!(metrics.counter(counters::PUBLISH_RETRIES).get(), 0);

        // The event survived the failure and goes out on recovery.
        assert!(handle.force_flush().await);
        assert_eq!(
            metrics.counter(counters::PUBLISHED_EVENTS).get(),
            1
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let base = Duration::from_millis(50);
        let cap = Duration::from_secs(1);
        assert_eq!(retry_backoff(base, cap, 1), Duration::from_millis(50));
        assert_eq!(retry_backoff(base, cap, 2), Duration::from_millis(100));
        assert_eq!(retry_backoff(base, cap, 3), Duration::from_millis(200));
        assert_eq!(retry_backoff(base, cap, 10), cap);
    }
}
