//! Plugin manifest schema.
//!
//! A bundle directory carries one `autoweave.plugin.json` describing the
//! plugin's identity, its capability requests, and the lifecycle hooks it
//! exports. Deserialization is deliberately permissive about absent optional
//! sections; semantic rules (absolute paths, entry containment, heap
//! ceilings) are enforced by the validator, not by serde.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// File name the watcher looks for inside a bundle directory.
pub const MANIFEST_FILE_NAME: &str = "autoweave.plugin.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    /// Path of the code entry point, relative to the bundle root.
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<ManifestSignature>,
}

/// Capability request. Every field optional; absence grants nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filesystem: Vec<FilesystemGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb: Option<UsbPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryPermissions>,
    /// Importable host modules beyond the base `autoweave` namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemGrant {
    pub path: PathBuf,
    pub mode: AccessMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn allows_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn allows_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPermissions {
    /// URL glob patterns (scheme + host + path) the plugin may fetch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<InboundGrant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundGrant {
    pub port: u16,
    pub iface: InboundInterface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundInterface {
    Localhost,
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbPermissions {
    /// Hex-string ids (`"0x1234"`), matched against attached devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vendor_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_ids: Vec<String>,
}

impl UsbPermissions {
    pub fn vendor_id_set(&self) -> Result<Vec<u16>, ModelError> {
        self.vendor_ids.iter().map(|s| parse_hex_id(s)).collect()
    }

    pub fn product_id_set(&self) -> Result<Vec<u16>, ModelError> {
        self.product_ids.iter().map(|s| parse_hex_id(s)).collect()
    }
}

/// Parses `"0x1234"` (or bare `"1234"`) into a 16-bit id.
pub fn parse_hex_id(value: &str) -> Result<u16, ModelError> {
    let trimmed = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u16::from_str_radix(trimmed, 16)
        .map_err(|_| ModelError::InvalidHex(value.to_string()))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPermissions {
    /// Heap ceiling in MiB; the host default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_heap_mb: Option<u32>,
}

/// Lifecycle hook exports. Unrecognized hook names are captured into
/// `unknown` so the validator can reject them instead of serde silently
/// dropping them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(rename = "onLoad", default, skip_serializing_if = "Option::is_none")]
    pub on_load: Option<String>,
    #[serde(rename = "onUnload", default, skip_serializing_if = "Option::is_none")]
    pub on_unload: Option<String>,
    #[serde(
        rename = "onUSBAttach",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub on_usb_attach: Option<String>,
    #[serde(
        rename = "onUSBDetach",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub on_usb_detach: Option<String>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl Hooks {
    pub fn export_for(&self, kind: HookKind) -> Option<&str> {
        match kind {
            HookKind::Load => self.on_load.as_deref(),
            HookKind::Unload => self.on_unload.as_deref(),
            HookKind::UsbAttach => self.on_usb_attach.as_deref(),
            HookKind::UsbDetach => self.on_usb_detach.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Load,
    Unload,
    UsbAttach,
    UsbDetach,
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookKind::Load => "onLoad",
            HookKind::Unload => "onUnload",
            HookKind::UsbAttach => "onUSBAttach",
            HookKind::UsbDetach => "onUSBDetach",
        };
        f.write_str(name)
    }
}

/// Optional integrity envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSignature {
    pub algorithm: String,
    pub hash: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}
