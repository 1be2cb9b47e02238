//! Typed control-event bus.
//!
//! A lightweight in-process broadcast bus that fans out runtime
//! notifications (plugin lifecycle, worker lifecycle, backpressure, memory
//! pressure) to observers such as the operational endpoint and the startup
//! log. Subscribers are explicit; there is no ambient emitter registry.

use std::fmt;

use autoweave_model::{PluginId, PluginState, WorkerId};
use serde::Serialize;
use tokio::sync::broadcast;

/// Why a worker was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MemoryExceeded,
    CpuExceeded,
    Unresponsive,
    HookDeadline,
    Crashed,
    Draining,
    Idle,
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationReason::MemoryExceeded => "memory-exceeded",
            TerminationReason::CpuExceeded => "cpu-exceeded",
            TerminationReason::Unresponsive => "unresponsive",
            TerminationReason::HookDeadline => "hook-deadline",
            TerminationReason::Crashed => "crashed",
            TerminationReason::Draining => "draining",
            TerminationReason::Idle => "idle",
            TerminationReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Everything the runtime announces about itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ControlEvent {
    PluginLoaded {
        plugin: PluginId,
        name: String,
        version: String,
    },
    PluginError {
        plugin: PluginId,
        message: String,
    },
    PluginStateChanged {
        plugin: PluginId,
        from: PluginState,
        to: PluginState,
    },
    WorkerCreated {
        worker: WorkerId,
        plugin: PluginId,
    },
    WorkerTerminated {
        worker: WorkerId,
        plugin: PluginId,
        reason: TerminationReason,
    },
    Backpressure {
        length: usize,
        active: bool,
    },
    BatchError {
        batch_len: usize,
        message: String,
    },
    MemoryWarning {
        rss_mb: u64,
    },
    MemoryCritical {
        rss_mb: u64,
    },
    ObserverAlarm {
        message: String,
    },
}

/// In-process broadcast bus for [`ControlEvent`]s. Sends never block; a
/// lagging subscriber loses the oldest events, which is acceptable for an
/// observability feed.
pub struct ControlBus {
    sender: broadcast::Sender<ControlEvent>,
    capacity: usize,
}

impl fmt::Debug for ControlBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl ControlBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ControlEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = ControlBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(ControlEvent::Backpressure {
            length: 600,
            active: true,
        });
        match rx.recv().await.unwrap() {
            ControlEvent::Backpressure { length, active } => {
                assert_eq!(length, 600);
                assert!(active);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = ControlBus::new(8);
        bus.emit(ControlEvent::MemoryWarning { rss_mb: 800 });
    }

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let json = serde_json::to_string(&ControlEvent::MemoryCritical {
            rss_mb: 1100,
        })
        .unwrap();
        assert!(json.contains("\"event\":\"memory-critical\""));
    }
}
