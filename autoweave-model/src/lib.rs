//! Core data model definitions shared across AutoWeave crates.
#![allow(missing_docs)]

pub mod device;
pub mod error;
pub mod ids;
pub mod manifest;
pub mod plugin;
pub mod stream;

// Intentionally curated re-exports for downstream consumers.
pub use device::{DeviceAction, HookDevicePayload, UsbDeviceInfo};
pub use error::{ModelError, Result as ModelResult};
pub use ids::{DeviceSignature, ManifestHash, MessageId, PluginId, WorkerId};
pub use manifest::{
    AccessMode, FilesystemGrant, HookKind, Hooks, InboundGrant,
    InboundInterface, ManifestSignature, MemoryPermissions,
    NetworkPermissions, Permissions, PluginManifest, UsbPermissions,
    MANIFEST_FILE_NAME, parse_hex_id,
};
pub use plugin::{PluginDescriptor, PluginMetrics, PluginPriority, PluginState};
pub use stream::{EventSource, StreamEvent, STREAM_NAME};
