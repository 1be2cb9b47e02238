//! Worker pool and the capability-mediated plugin sandbox.

pub mod host_api;
pub mod host_modules;
pub mod pool;
pub mod sandbox;
pub mod worker;

pub use host_api::{HostCall, HostReply, HostService, StateStore};
pub use host_modules::HostModuleRegistry;
pub use pool::{
    PoolConfig, PoolError, WorkerEvent, WorkerPool, WorkerPoolHandle,
};
pub use sandbox::{CapabilityChecker, Denied, UrlGlob};
pub use worker::{
    HookError, PingReport, WorkerHandle, WorkerSpec, SandboxEnv,
};
