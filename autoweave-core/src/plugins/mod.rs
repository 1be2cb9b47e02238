//! Plugin discovery, validation, and lifecycle management.

pub mod manager;
pub mod validator;
pub mod watcher;

pub use manager::{
    ManagerConfig, PluginManager, PluginManagerHandle,
};
pub use validator::{ManifestValidator, ValidationError};
pub use watcher::{PluginWatcher, WatchEvent, WatcherOptions};
