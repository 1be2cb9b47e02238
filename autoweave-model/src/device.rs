//! USB device snapshots as observed from the host.

use serde::{Deserialize, Serialize};

use crate::ids::DeviceSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    Attach,
    Detach,
}

impl DeviceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceAction::Attach => "attach",
            DeviceAction::Detach => "detach",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "attach" => Some(DeviceAction::Attach),
            "detach" => Some(DeviceAction::Detach),
            _ => None,
        }
    }

    /// Attach and detach oppose each other; opposing events are never
    /// coalesced by the debouncer.
    pub fn opposes(self, other: DeviceAction) -> bool {
        self != other
    }
}

impl std::fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extracted snapshot of a device. String descriptors are best-effort; a
/// failed descriptor read leaves them absent but the snapshot is still
/// emitted so detach accounting stays correct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    pub bus_number: u8,
    pub device_address: u8,
    pub port_path: String,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub signature: DeviceSignature,
    /// Monotonic milliseconds at observation time.
    pub timestamp_ms: u64,
}

impl UsbDeviceInfo {
    /// Best-effort snapshot carrying only what the hotplug notification
    /// itself provides.
    pub fn bare(
        vendor_id: u16,
        product_id: u16,
        bus_number: u8,
        device_address: u8,
        port_path: String,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            vendor_id,
            product_id,
            manufacturer: None,
            product: None,
            serial_number: None,
            bus_number,
            device_address,
            port_path,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            signature: DeviceSignature::compute(
                vendor_id,
                product_id,
                bus_number,
                device_address,
            ),
            timestamp_ms,
        }
    }

    pub fn vendor_id_hex(&self) -> String {
        format!("0x{:04x}", self.vendor_id)
    }

    pub fn product_id_hex(&self) -> String {
        format!("0x{:04x}", self.product_id)
    }

    /// The subset handed to plugin hooks.
    pub fn hook_payload(&self, action: DeviceAction) -> HookDevicePayload {
        HookDevicePayload {
            action,
            vendor_id: self.vendor_id_hex(),
            product_id: self.product_id_hex(),
            signature: self.signature,
            manufacturer: self.manufacturer.clone(),
            product: self.product.clone(),
            serial_number: self.serial_number.clone(),
            timestamp_ms: self.timestamp_ms,
        }
    }
}

/// Payload serialized into `onUSBAttach` / `onUSBDetach` invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookDevicePayload {
    pub action: DeviceAction,
    pub vendor_id: String,
    pub product_id: String,
    pub signature: DeviceSignature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UsbDeviceInfo {
        let mut info =
            UsbDeviceInfo::bare(0x1234, 0x5678, 1, 4, "1-4".into(), 1000);
        info.manufacturer = Some("Acme".into());
        info.product = Some("Widget".into());
        info
    }

    #[test]
    fn bare_snapshot_has_signature() {
        let info = sample();
        assert_eq!(
            info.signature,
            DeviceSignature::compute(0x1234, 0x5678, 1, 4)
        );
        assert_eq!(info.vendor_id_hex(), "0x1234");
    }

    #[test]
    fn hook_payload_carries_descriptor_strings() {
        let payload = sample().hook_payload(DeviceAction::Attach);
        assert_eq!(payload.manufacturer.as_deref(), Some("Acme"));
        assert_eq!(payload.action, DeviceAction::Attach);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"action\":\"attach\""));
        // Absent serial number must not serialize as null.
        assert!(!json.contains("serial_number"));
    }

    #[test]
    fn actions_oppose() {
        assert!(DeviceAction::Attach.opposes(DeviceAction::Detach));
        assert!(!DeviceAction::Attach.opposes(DeviceAction::Attach));
    }
}
