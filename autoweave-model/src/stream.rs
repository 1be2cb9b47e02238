//! Records appended to the durable hot-plug stream.
//!
//! The wire format is flat field/value pairs (one stream entry per event),
//! with numeric ids rendered as `0x....` hex strings and the timestamp as a
//! decimal string, so non-Rust consumers can read entries without a schema.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceAction, UsbDeviceInfo};
use crate::error::ModelError;
use crate::ids::{DeviceSignature, MessageId};
use crate::manifest::parse_hex_id;

/// Name of the durable append-only stream.
pub const STREAM_NAME: &str = "aw:hotplug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Observer,
    Udev,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Observer => "observer",
            EventSource::Udev => "udev",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "observer" => Some(EventSource::Observer),
            "udev" => Some(EventSource::Udev),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub message_id: MessageId,
    pub source: EventSource,
    pub action: DeviceAction,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_signature: DeviceSignature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl StreamEvent {
    pub fn from_device(
        source: EventSource,
        action: DeviceAction,
        device: &UsbDeviceInfo,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            source,
            action,
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            device_signature: device.signature,
            manufacturer: device.manufacturer.clone(),
            product: device.product.clone(),
            serial_number: device.serial_number.clone(),
            timestamp_ms,
        }
    }

    /// Flat field pairs in stream wire order.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("message_id", self.message_id.to_string()),
            ("source", self.source.as_str().to_string()),
            ("action", self.action.as_str().to_string()),
            ("vendor_id", format!("0x{:04x}", self.vendor_id)),
            ("product_id", format!("0x{:04x}", self.product_id)),
            ("device_signature", self.device_signature.as_hex()),
        ];
        if let Some(manufacturer) = &self.manufacturer {
            fields.push(("manufacturer", manufacturer.clone()));
        }
        if let Some(product) = &self.product {
            fields.push(("product", product.clone()));
        }
        if let Some(serial) = &self.serial_number {
            fields.push(("serial_number", serial.clone()));
        }
        fields.push(("timestamp", self.timestamp_ms.to_string()));
        fields
    }

    /// Rebuilds a record from stream fields; unknown fields are ignored so
    /// the schema can grow without breaking old consumers.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut message_id = None;
        let mut source = None;
        let mut action = None;
        let mut vendor_id = None;
        let mut product_id = None;
        let mut device_signature = None;
        let mut manufacturer = None;
        let mut product = None;
        let mut serial_number = None;
        let mut timestamp_ms = None;

        for (key, value) in fields {
            match key {
                "message_id" => message_id = Some(MessageId::parse(value)?),
                "source" => {
                    source = Some(EventSource::parse(value).ok_or(
                        ModelError::InvalidField {
                            field: "source",
                            value: value.to_string(),
                        },
                    )?);
                }
                "action" => {
                    action = Some(DeviceAction::parse(value).ok_or(
                        ModelError::InvalidField {
                            field: "action",
                            value: value.to_string(),
                        },
                    )?);
                }
                "vendor_id" => vendor_id = Some(parse_hex_id(value)?),
                "product_id" => product_id = Some(parse_hex_id(value)?),
                "device_signature" => {
                    device_signature = Some(DeviceSignature::parse(value)?);
                }
                "manufacturer" => manufacturer = Some(value.to_string()),
                "product" => product = Some(value.to_string()),
                "serial_number" => serial_number = Some(value.to_string()),
                "timestamp" => {
                    timestamp_ms = Some(value.parse().map_err(|_| {
                        ModelError::InvalidField {
                            field: "timestamp",
                            value: value.to_string(),
                        }
                    })?);
                }
                _ => {}
            }
        }

        Ok(Self {
            message_id: message_id
                .ok_or(ModelError::MissingField("message_id"))?,
            source: source.ok_or(ModelError::MissingField("source"))?,
            action: action.ok_or(ModelError::MissingField("action"))?,
            vendor_id: vendor_id.ok_or(ModelError::MissingField("vendor_id"))?,
            product_id: product_id
                .ok_or(ModelError::MissingField("product_id"))?,
            device_signature: device_signature
                .ok_or(ModelError::MissingField("device_signature"))?,
            manufacturer,
            product,
            serial_number,
            timestamp_ms: timestamp_ms
                .ok_or(ModelError::MissingField("timestamp"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> StreamEvent {
        let mut device =
            UsbDeviceInfo::bare(0x1234, 0x5678, 1, 4, "1-4".into(), 50);
        device.manufacturer = Some("Acme".into());
        StreamEvent::from_device(
            EventSource::Observer,
            DeviceAction::Attach,
            &device,
            1_700_000_000_000,
        )
    }

    #[test]
    fn fields_use_hex_ids_and_decimal_timestamp() {
        let event = sample_event();
        let fields = event.to_fields();
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("vendor_id"), Some("0x1234"));
        assert_eq!(get("product_id"), Some("0x5678"));
        assert_eq!(get("action"), Some("attach"));
        assert_eq!(get("source"), Some("observer"));
        assert_eq!(get("timestamp"), Some("1700000000000"));
        assert_eq!(get("manufacturer"), Some("Acme"));
        assert_eq!(get("serial_number"), None);
        assert_eq!(get("device_signature").unwrap().len(), 16);
    }

    #[test]
    fn field_round_trip() {
        let event = sample_event();
        let fields = event.to_fields();
        let borrowed: Vec<(&str, &str)> =
            fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let decoded = StreamEvent::from_fields(borrowed).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let err = StreamEvent::from_fields(vec![("action", "attach")])
            .unwrap_err();
        assert!(matches!(err, ModelError::MissingField(_)));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let event = sample_event();
        let mut fields: Vec<(String, String)> = event
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.push(("future_field".to_string(), "x".to_string()));
        let borrowed: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(StreamEvent::from_fields(borrowed).unwrap(), event);
    }
}
