/// Gateway bridge: hands SOS/TEXT records to an external transport when
/// this device has internet (cellular, satellite, wifi uplink).
///
/// The bridge only decides *what* to push; the runtime executor performs
/// the actual `send_external` calls and reports the outcome back.
use std::collections::HashSet;

use crate::error::MeshError;
use crate::message::{Message, MessageBuilder};
use crate::store::MessageStore;
use crate::types::{DeviceId, MessageId, MessageKind};

/// Uplink to the outside world.
///
/// `Ok(())` means the remote end acknowledged the message; only then is
/// the record marked `ExternallyDelivered`.
#[async_trait::async_trait]
pub trait ExternalTransport: Send + Sync + 'static {
    async fn send_external(&self, message: &Message) -> Result<(), MeshError>;
}

/// No uplink. Used by devices that never act as a gateway.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExternal;

#[async_trait::async_trait]
impl ExternalTransport for NoExternal {
    async fn send_external(&self, _message: &Message) -> Result<(), MeshError> {
        Err(MeshError::TransientLink {
            device_id: "external".into(),
            reason: "no external transport".into(),
        })
    }
}

#[derive(Debug, Default)]
pub struct GatewayBridge {
    online: bool,
    in_flight: HashSet<MessageId>,
}

impl GatewayBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
        if !online {
            // Outstanding uploads may still complete; their outcome is
            // applied whenever it arrives.
            tracing::debug!(pending = self.in_flight.len(), "gateway offline");
        }
    }

    /// SOS/TEXT records not yet externally delivered and not already being
    /// uploaded, oldest first. Reserves each returned id until
    /// [`complete`](Self::complete) is called for it.
    pub fn drain_pending(&mut self, store: &MessageStore, now: u64) -> Vec<Message> {
        if !self.online {
            return Vec::new();
        }
        let mut out = Vec::new();
        for record in store.gateway_candidates(now) {
            if self.in_flight.insert(record.id()) {
                out.push(record.message.clone());
            }
        }
        out
    }

    /// Release the reservation for `id`.
    pub fn complete(&mut self, id: &MessageId) {
        self.in_flight.remove(id);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

// ── External acknowledgements ──────────────────────────────────────────

/// ACK flooded back into the mesh once `delivered` reached the outside
/// world. Payload is the delivered message id.
pub fn external_ack(local_id: DeviceId, sequence: u64, delivered: &Message, now: u64) -> Message {
    MessageBuilder::new(local_id, MessageKind::Ack, delivered.id.as_bytes().to_vec())
        .sequence(sequence)
        .created_at(now)
        .validity_ms(delivered.expires_at.saturating_sub(now).max(1))
        .build()
}

/// Id carried by an ACK payload, if it is one.
pub fn acked_id(message: &Message) -> Option<MessageId> {
    if message.kind != MessageKind::Ack {
        return None;
    }
    let bytes: [u8; 32] = message.payload.as_slice().try_into().ok()?;
    Some(MessageId::from_bytes(bytes))
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records uploads; can be told to fail.
    #[derive(Clone, Default)]
    pub struct MockExternal {
        sent: Arc<Mutex<Vec<MessageId>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl MockExternal {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<MessageId> {
            self.sent.lock().unwrap().clone()
        }

        pub fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    #[async_trait::async_trait]
    impl ExternalTransport for MockExternal {
        async fn send_external(&self, message: &Message) -> Result<(), MeshError> {
            if *self.fail.lock().unwrap() {
                return Err(MeshError::TransientLink {
                    device_id: "external".into(),
                    reason: "uplink down".into(),
                });
            }
            self.sent.lock().unwrap().push(message.id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(seed: u8) -> DeviceId {
        DeviceId::from_bytes([seed; 16])
    }

    fn store_with(kinds: &[MessageKind]) -> (MessageStore, Vec<Message>) {
        let mut store = MessageStore::new();
        let mut messages = Vec::new();
        for (i, kind) in kinds.iter().enumerate() {
            let m = MessageBuilder::new(device(1), *kind, vec![i as u8])
                .sequence(i as u64)
                .created_at(i as u64)
                .validity_ms(10_000)
                .build();
            store.put(m.clone(), 0).unwrap();
            messages.push(m);
        }
        (store, messages)
    }

    #[test]
    fn offline_drains_nothing() {
        let (store, _) = store_with(&[MessageKind::Sos]);
        let mut bridge = GatewayBridge::new();
        assert!(bridge.drain_pending(&store, 10).is_empty());
    }

    #[test]
    fn drains_only_deliverable_kinds_once() {
        let (store, messages) = store_with(&[
            MessageKind::Sos,
            MessageKind::Ack,
            MessageKind::Text,
            MessageKind::Heartbeat,
        ]);
        let mut bridge = GatewayBridge::new();
        bridge.set_online(true);

        let drained: Vec<MessageId> = bridge.drain_pending(&store, 10).iter().map(|m| m.id).collect();
        assert_eq!(drained, vec![messages[0].id, messages[2].id]);
        assert!(bridge.drain_pending(&store, 10).is_empty(), "reserved");
        assert_eq!(bridge.in_flight(), 2);
    }

    #[test]
    fn failed_upload_is_retried() {
        let (store, messages) = store_with(&[MessageKind::Sos]);
        let mut bridge = GatewayBridge::new();
        bridge.set_online(true);
        bridge.drain_pending(&store, 10);
        bridge.complete(&messages[0].id);
        assert_eq!(bridge.drain_pending(&store, 10).len(), 1);
    }

    #[test]
    fn delivered_records_not_drained() {
        let (mut store, messages) = store_with(&[MessageKind::Sos]);
        store.mark_externally_delivered(&messages[0].id);
        let mut bridge = GatewayBridge::new();
        bridge.set_online(true);
        assert!(bridge.drain_pending(&store, 10).is_empty());
    }

    #[test]
    fn ack_payload_roundtrip() {
        let (_, messages) = store_with(&[MessageKind::Sos]);
        let ack = external_ack(device(9), 1, &messages[0], 100);
        assert_eq!(ack.kind, MessageKind::Ack);
        assert_eq!(acked_id(&ack), Some(messages[0].id));
        assert_eq!(ack.expires_at, messages[0].expires_at);
        assert_eq!(acked_id(&messages[0]), None);
    }

    #[tokio::test]
    async fn mock_external_records_and_fails() {
        let (_, messages) = store_with(&[MessageKind::Sos]);
        let ext = mock::MockExternal::new();
        ext.send_external(&messages[0]).await.unwrap();
        ext.set_fail(true);
        assert!(ext.send_external(&messages[0]).await.is_err());
        assert_eq!(ext.sent(), vec![messages[0].id]);
    }
}
