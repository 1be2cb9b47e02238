//! Shared performance primitives: bounded buffers, caches, pools, rate
//! limiting, metrics, and memory-pressure plumbing.

pub mod lru;
pub mod memory;
pub mod metrics;
pub mod object_pool;
pub mod ring;
pub mod token_bucket;

pub use lru::{SharedTtlLru, TtlLru};
pub use memory::{MemoryMonitor, MemoryPressure, PressureSubscriber};
pub use metrics::{Counter, Gauge, MetricsRegistry};
pub use object_pool::{ObjectPool, Reset};
pub use ring::{Overflow, RingBuffer};
pub use token_bucket::TokenBucket;
