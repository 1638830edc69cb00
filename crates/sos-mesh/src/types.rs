use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MeshError;

/// Default hop budget for locally originated messages.
pub const DEFAULT_TTL_HOPS: u8 = 6;

/// Default validity window for locally originated messages (1 h).
pub const DEFAULT_VALIDITY_MS: u64 = 60 * 60 * 1000;

/// Longest validity window accepted from a peer, measured from the local
/// clock (24 h).
pub const MAX_VALIDITY_MS: u64 = 24 * 60 * 60 * 1000;

/// Maximum payload size accepted on the wire (4 KiB).
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024;

/// Maximum number of device ids carried in `path_hint`.
pub const MAX_PATH_HINT: usize = 8;

/// Hard fan-out cap for SOS flooding.
pub const SOS_FANOUT_CAP: usize = 8;

/// Fan-out for TEXT and ACK messages.
pub const TEXT_FANOUT: usize = 3;

// ── DeviceId ───────────────────────────────────────────────────────────

/// Identity of a mesh device.
///
/// 16 bytes, rendered as 32 lowercase hex characters. The link layer
/// hands us platform addresses (BLE MAC, WiFi-Direct name); those are
/// folded into a `DeviceId` with [`DeviceId::from_name`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a stable id from a platform address or name.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({}...)", &hex::encode(&self.0[..4]))
    }
}

impl FromStr for DeviceId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| MeshError::InvalidId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── MessageId ──────────────────────────────────────────────────────────

/// Content address of a message: SHA-256 over (origin, sequence, payload).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({}...)", self.short())
    }
}

impl FromStr for MessageId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| MeshError::InvalidId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

// ── Kinds & status ─────────────────────────────────────────────────────

/// Message kind. Decides fan-out and whether the message leaves one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Sos,
    Text,
    Ack,
    Heartbeat,
}

impl MessageKind {
    /// SOS and TEXT are handed to the local UI and to the gateway.
    pub fn is_deliverable(self) -> bool {
        matches!(self, MessageKind::Sos | MessageKind::Text)
    }
}

/// Lifecycle of a relay record.
///
/// The first four variants advance monotonically:
/// Pending -> Forwarded -> DeliveredLocal -> ExternallyDelivered.
/// `Expired` and `Dropped` are terminal and set explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RelayStatus {
    Pending = 0,
    Forwarded = 1,
    DeliveredLocal = 2,
    ExternallyDelivered = 3,
    Expired = 4,
    Dropped = 5,
}

impl RelayStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RelayStatus::Expired | RelayStatus::Dropped)
    }

    pub(crate) fn as_i64(self) -> i64 {
        self as i64
    }

    pub(crate) fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            0 => RelayStatus::Pending,
            1 => RelayStatus::Forwarded,
            2 => RelayStatus::DeliveredLocal,
            3 => RelayStatus::ExternallyDelivered,
            4 => RelayStatus::Expired,
            5 => RelayStatus::Dropped,
            _ => return None,
        })
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
