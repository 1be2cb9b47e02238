//! Shared configuration library for AutoWeave.
//!
//! This crate centralizes config loading and validation for the daemon:
//! defaults, an optional TOML file, and `AUTOWEAVE__*` environment overrides
//! are layered in that order, then run through guard-rail validation so a
//! misconfigured host fails fast instead of misbehaving under load.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoadError, ConfigLoader};
pub use models::{
    Config, LoadConfig, MemoryConfig, PerformanceConfig, PublisherConfig,
    RedisConfig, ServerConfig, ShutdownConfig, WatcherConfig,
    WorkerPoolConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning};
