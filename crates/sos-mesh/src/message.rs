use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MeshError;
use crate::types::{
    now_ms, DeviceId, MessageId, MessageKind, DEFAULT_TTL_HOPS, DEFAULT_VALIDITY_MS,
    MAX_PATH_HINT, MAX_PAYLOAD_BYTES,
};

/// Domain separator for content ids.
const ID_DOMAIN: &[u8] = b"sos-mesh/message-id/v1";

/// Unit of communication between mesh devices.
///
/// Serialized as MessagePack. `id` is a content hash over
/// `(origin_id, sequence, payload)` and is recomputed on decode, so a
/// corrupted or tampered frame never enters the store. Relays never mutate
/// a message; they build a [`Message::forwarded_copy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Content address, unique per (origin, sequence, payload).
    pub id: MessageId,
    pub kind: MessageKind,
    /// Device that created the message.
    pub origin_id: DeviceId,
    /// Monotonic per-origin counter.
    pub sequence: u64,
    /// Remaining hop budget. Zero means "do not forward".
    pub ttl_hops: u8,
    /// Creation time (Unix ms).
    pub created_at: u64,
    /// End of the validity window (Unix ms).
    pub expires_at: u64,
    /// Opaque bytes: text, GPS fix, etc.
    pub payload: Vec<u8>,
    /// Devices already traversed, oldest first. Bounded by `MAX_PATH_HINT`.
    pub path_hint: Vec<DeviceId>,
}

impl Message {
    /// Content hash over the identity-bearing fields.
    pub fn compute_id(origin_id: &DeviceId, sequence: u64, payload: &[u8]) -> MessageId {
        let mut hasher = Sha256::new();
        hasher.update(ID_DOMAIN);
        hasher.update(origin_id.as_bytes());
        hasher.update(sequence.to_be_bytes());
        hasher.update((payload.len() as u64).to_be_bytes());
        hasher.update(payload);
        MessageId::from_bytes(hasher.finalize().into())
    }

    /// True once `now` has reached `expires_at`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Recompute the content id and compare.
    pub fn verify_id(&self) -> Result<(), MeshError> {
        if Self::compute_id(&self.origin_id, self.sequence, &self.payload) == self.id {
            Ok(())
        } else {
            Err(MeshError::HashMismatch)
        }
    }

    /// Structural checks applied to every decoded frame.
    pub fn validate(&self, max_payload: usize) -> Result<(), MeshError> {
        if self.payload.len() > max_payload {
            return Err(MeshError::PayloadTooLarge {
                size: self.payload.len(),
                max: max_payload,
            });
        }
        if self.path_hint.len() > MAX_PATH_HINT {
            return Err(MeshError::Malformed {
                reason: format!(
                    "path hint length {} exceeds max {}",
                    self.path_hint.len(),
                    MAX_PATH_HINT
                ),
            });
        }
        if self.expires_at < self.created_at {
            return Err(MeshError::Malformed {
                reason: "expires_at precedes created_at".into(),
            });
        }
        self.verify_id()
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Decode and validate a frame with the default payload limit.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MeshError> {
        Self::from_bytes_with_limit(data, MAX_PAYLOAD_BYTES)
    }

    /// Decode and validate a frame.
    pub fn from_bytes_with_limit(data: &[u8], max_payload: usize) -> Result<Self, MeshError> {
        let message: Message = rmp_serde::from_slice(data)?;
        message.validate(max_payload)?;
        Ok(message)
    }

    /// MessagePack size in bytes.
    pub fn wire_size(&self) -> usize {
        self.to_bytes().map(|b| b.len()).unwrap_or(0)
    }

    /// Copy for the next hop: TTL decremented, `local_id` appended to the
    /// path hint (oldest entries fall off past `hint_cap`).
    ///
    /// Returns `None` when the hop budget is already spent.
    pub fn forwarded_copy(&self, local_id: DeviceId, hint_cap: usize) -> Option<Message> {
        let ttl_hops = self.ttl_hops.checked_sub(1)?;
        let mut copy = self.clone();
        copy.ttl_hops = ttl_hops;
        if copy.path_hint.last() != Some(&local_id) {
            copy.path_hint.push(local_id);
        }
        let cap = hint_cap.min(MAX_PATH_HINT);
        if copy.path_hint.len() > cap {
            let excess = copy.path_hint.len() - cap;
            copy.path_hint.drain(..excess);
        }
        Some(copy)
    }
}

/// Fluent builder for locally originated messages.
///
/// ```ignore
/// let sos = MessageBuilder::new(me, MessageKind::Sos, gps_fix)
///     .sequence(next_seq)
///     .ttl_hops(6)
///     .validity_ms(30 * 60 * 1000)
///     .build();
/// ```
pub struct MessageBuilder {
    origin_id: DeviceId,
    kind: MessageKind,
    payload: Vec<u8>,
    sequence: u64,
    ttl_hops: u8,
    validity_ms: u64,
    created_at: Option<u64>,
}

impl MessageBuilder {
    pub fn new(origin_id: DeviceId, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            origin_id,
            kind,
            payload,
            sequence: 0,
            ttl_hops: DEFAULT_TTL_HOPS,
            validity_ms: DEFAULT_VALIDITY_MS,
            created_at: None,
        }
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn ttl_hops(mut self, ttl_hops: u8) -> Self {
        self.ttl_hops = ttl_hops;
        self
    }

    pub fn validity_ms(mut self, validity_ms: u64) -> Self {
        self.validity_ms = validity_ms;
        self
    }

    /// Pin the creation time (defaults to now).
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build(self) -> Message {
        let created_at = self.created_at.unwrap_or_else(now_ms);
        Message {
            id: Message::compute_id(&self.origin_id, self.sequence, &self.payload),
            kind: self.kind,
            origin_id: self.origin_id,
            sequence: self.sequence,
            ttl_hops: self.ttl_hops,
            created_at,
            expires_at: created_at.saturating_add(self.validity_ms),
            payload: self.payload,
            path_hint: Vec::new(),
        }
    }
}
