use crate::error::ModelError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Number of raw bytes behind a 16-hex-char identifier.
const SHORT_HASH_LEN: usize = 8;

fn short_hash(parts: &[&[u8]]) -> [u8; SHORT_HASH_LEN] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; SHORT_HASH_LEN];
    out.copy_from_slice(&digest[..SHORT_HASH_LEN]);
    out
}

fn parse_short_hex(value: &str) -> Result<[u8; SHORT_HASH_LEN], ModelError> {
    let bytes = hex::decode(value)
        .map_err(|_| ModelError::InvalidHex(value.to_string()))?;
    if bytes.len() != SHORT_HASH_LEN {
        return Err(ModelError::InvalidHex(value.to_string()));
    }
    let mut out = [0u8; SHORT_HASH_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Stable plugin identity derived from the manifest name. Survives reloads
/// because the name, not the bundle contents, feeds the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginId([u8; SHORT_HASH_LEN]);

impl PluginId {
    pub fn from_name(name: &str) -> Self {
        Self(short_hash(&[name.as_bytes()]))
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse(value: &str) -> Result<Self, ModelError> {
        parse_short_hex(value).map(Self)
    }
}

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

impl Serialize for PluginId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_hex())
    }
}

impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Stable identifier for one physical USB connection, 16 hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceSignature([u8; SHORT_HASH_LEN]);

impl DeviceSignature {
    /// Derived from descriptor fields so the value does not depend on the
    /// host keeping the same address assignment across reboots.
    pub fn compute(vendor_id: u16, product_id: u16, bus: u8, address: u8) -> Self {
        Self(short_hash(&[
            &vendor_id.to_be_bytes(),
            &product_id.to_be_bytes(),
            &[bus],
            &[address],
        ]))
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse(value: &str) -> Result<Self, ModelError> {
        parse_short_hex(value).map(Self)
    }
}

impl std::fmt::Display for DeviceSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

impl Serialize for DeviceSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_hex())
    }
}

impl<'de> Deserialize<'de> for DeviceSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Content hash of manifest bytes; drives change detection and the
/// validation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestHash(#[serde(with = "hash_hex")] [u8; 32]);

impl ManifestHash {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ManifestHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

mod hash_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8; 32],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let decoded =
            hex::decode(&raw).map_err(serde::de::Error::custom)?;
        decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Pool-assigned worker identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique id stamped on every stream record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Result<Self, ModelError> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|_| ModelError::InvalidField {
                field: "message_id",
                value: value.to_string(),
            })
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_id_is_stable_for_name() {
        let a = PluginId::from_name("scale-reader");
        let b = PluginId::from_name("scale-reader");
        let c = PluginId::from_name("scale-writer");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_hex().len(), 16);
    }

    #[test]
    fn device_signature_round_trips_hex() {
        let sig = DeviceSignature::compute(0x1234, 0x5678, 1, 4);
        let rendered = sig.as_hex();
        assert_eq!(rendered.len(), 16);
        assert_eq!(DeviceSignature::parse(&rendered).unwrap(), sig);
    }

    #[test]
    fn device_signature_depends_on_location() {
        let a = DeviceSignature::compute(0x1234, 0x5678, 1, 4);
        let b = DeviceSignature::compute(0x1234, 0x5678, 1, 5);
        assert_ne!(a, b);
    }

    #[test]
    fn manifest_hash_distinguishes_content() {
        let a = ManifestHash::of(b"{\"name\":\"a\"}");
        let b = ManifestHash::of(b"{\"name\":\"b\"}");
        assert_ne!(a, b);
        assert_eq!(a, ManifestHash::of(b"{\"name\":\"a\"}"));
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(PluginId::parse("zzzz").is_err());
        assert!(DeviceSignature::parse("abcd").is_err());
    }
}
