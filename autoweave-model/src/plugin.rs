//! Plugin lifecycle states and operator-facing snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ManifestHash, PluginId, WorkerId};

/// Per-plugin state machine position. Transitions are owned exclusively by
/// the plugin manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Discovered,
    Validated,
    Loading,
    Active,
    Draining,
    Failed,
    Removed,
}

impl PluginState {
    /// Only `Active` plugins receive dispatched stream events.
    pub fn can_dispatch(self) -> bool {
        matches!(self, PluginState::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PluginState::Removed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Discovered => "discovered",
            PluginState::Validated => "validated",
            PluginState::Loading => "loading",
            PluginState::Active => "active",
            PluginState::Draining => "draining",
            PluginState::Failed => "failed",
            PluginState::Removed => "removed",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load ordering on startup, strict by priority then FIFO. Not a dispatch
/// QoS mechanism.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PluginPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for PluginPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Counters maintained by the manager for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_ok_at: Option<DateTime<Utc>>,
}

/// Operator-facing snapshot returned by `list()` / `get()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: PluginId,
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub priority: PluginPriority,
    pub manifest_hash: ManifestHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    pub metrics: PluginMetrics,
    /// Length in bytes of the preserved `onUnload` state snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_snapshot_len: Option<usize>,
}
