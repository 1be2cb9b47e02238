use thiserror::Error;

use crate::plugins::validator::ValidationError;
use crate::usb::backend::ObserverError;
use crate::workers::pool::PoolError;
use crate::workers::sandbox::Denied;

/// Resource limit that terminated a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Cpu,
    Time,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::Time => "time",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("manifest validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("permission denied: {0}")]
    PermissionDenied(#[from] Denied),

    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(ResourceKind),

    #[error("usb observer error: {0}")]
    Observer(#[from] ObserverError),

    #[error("debouncer queue overflow")]
    DebouncerOverflow,

    #[error("publisher pending queue overflow")]
    PublisherOverflow,

    #[error("stream transport error: {0}")]
    Transport(String),

    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("component shut down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<crate::usb::debouncer::DebouncerError> for CoreError {
    fn from(err: crate::usb::debouncer::DebouncerError) -> Self {
        match err {
            crate::usb::debouncer::DebouncerError::Overflow => {
                CoreError::DebouncerOverflow
            }
            crate::usb::debouncer::DebouncerError::Closed => {
                CoreError::Shutdown
            }
        }
    }
}

impl From<crate::usb::publisher::TransportError> for CoreError {
    fn from(err: crate::usb::publisher::TransportError) -> Self {
        CoreError::Transport(err.to_string())
    }
}

impl From<crate::perf::ring::Overflow> for CoreError {
    fn from(_: crate::perf::ring::Overflow) -> Self {
        CoreError::PublisherOverflow
    }
}

impl From<crate::workers::worker::HookError> for CoreError {
    fn from(err: crate::workers::worker::HookError) -> Self {
        use crate::workers::worker::HookError;
        match err {
            HookError::Deadline => {
                CoreError::ResourceExceeded(ResourceKind::Time)
            }
            HookError::CpuBudget => {
                CoreError::ResourceExceeded(ResourceKind::Cpu)
            }
            HookError::MemoryExceeded => {
                CoreError::ResourceExceeded(ResourceKind::Memory)
            }
            HookError::Crashed => {
                CoreError::WorkerCrash("worker unavailable".to_string())
            }
            other => CoreError::WorkerCrash(other.to_string()),
        }
    }
}
