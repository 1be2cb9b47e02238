//! USB hot-plug pipeline: observer, debouncer, and stream publisher.

pub mod backend;
pub mod consumer;
pub mod debouncer;
pub mod observer;
pub mod publisher;

pub use backend::{
    BackendTask, DeviceDescriptors, DeviceLocation, ObserverError,
    ObserverErrorKind, RawHotplugEvent, RusbBackend, UsbBackend,
};
pub use consumer::StreamConsumer;
pub use debouncer::{
    DebouncerConfig, DebouncerError, DebouncerHandle, EventDebouncer,
};
pub use observer::{DeviceObserver, ObserverConfig};
pub use publisher::{
    BatchPublisher, PublisherConfig, PublisherHandle, RedisStreamSink,
    StreamSink, TransportError,
};
