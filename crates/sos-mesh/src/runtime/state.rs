use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;

use crate::error::MeshError;
use crate::gateway::{acked_id, external_ack, GatewayBridge};
use crate::message::{Message, MessageBuilder};
use crate::neighbor::{NeighborEntry, NeighborState, NeighborTable};
use crate::router::{DropReason, Router, RoutingAction};
use crate::stats::RelayStats;
use crate::store::{MessageStore, PutOutcome, RelayRecord};
use crate::types::{DeviceId, MessageId, MessageKind};

use super::effect::{RuntimeEffect, TaskOutcome};
use super::{DeliveredMessage, MeshEvent, RuntimeConfig};

/// Neighbors tracked for malformed-frame accounting.
const MALFORMED_TRACKED: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(n) => n,
    None => unreachable!(),
};

/// Complete relay state. Pure logic with no async and no I/O.
///
/// Every `handle_*` / `tick_*` method takes the current time (Unix ms) and
/// returns the effects to execute. Nothing here touches the radio, the
/// uplink, the journal or a channel.
pub(crate) struct RelayState {
    pub(crate) local_id: DeviceId,
    pub(crate) config: RuntimeConfig,

    pub(crate) store: MessageStore,
    pub(crate) neighbors: NeighborTable,
    pub(crate) router: Router,
    pub(crate) gateway: GatewayBridge,

    /// Malformed frame count per neighbor, bounded.
    malformed: LruCache<DeviceId, u32>,
    stats: Arc<RelayStats>,
    /// Last sequence number used for a local message.
    sequence: u64,
    journaling: bool,
}

impl RelayState {
    pub fn new(local_id: DeviceId, config: RuntimeConfig, stats: Arc<RelayStats>) -> Self {
        Self {
            local_id,
            store: MessageStore::with_capacity(config.store_capacity),
            neighbors: NeighborTable::new(),
            router: Router::new(local_id, config.routing.clone()),
            gateway: GatewayBridge::new(),
            malformed: LruCache::new(MALFORMED_TRACKED),
            stats,
            sequence: 0,
            journaling: config.journal_path.is_some(),
            config,
        }
    }

    /// Reload journaled records. Returns how many were accepted.
    pub fn restore(&mut self, records: Vec<RelayRecord>, sequence: u64, now: u64) -> usize {
        self.sequence = self.sequence.max(sequence);
        let mut restored = 0;
        for record in records {
            if self.store.restore(record, now) {
                restored += 1;
            }
        }
        self.stats.stored.set(self.store.len() as i64);
        restored
    }

    #[cfg(test)]
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    // ── Neighbor lifecycle ──────────────────────────────────────────────

    pub fn handle_neighbor_discovered(
        &mut self,
        device_id: DeviceId,
        link_quality: u8,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        if device_id == self.local_id {
            return Vec::new();
        }
        let mut effects = Vec::new();
        let is_new = self.neighbors.get(&device_id).is_none();
        let state = self.neighbors.upsert(device_id, link_quality, now).state;
        if is_new {
            tracing::debug!(peer = %device_id, link_quality, "neighbor discovered");
            effects.push(RuntimeEffect::Emit(MeshEvent::NeighborDiscovered { device_id }));
        }
        if state == NeighborState::Discovered && self.neighbors.mark_connecting(&device_id) {
            effects.push(RuntimeEffect::Connect(device_id));
        }
        effects
    }

    /// Link up, reported by the platform or by a successful connect.
    pub fn handle_neighbor_connected(&mut self, device_id: DeviceId, now: u64) -> Vec<RuntimeEffect> {
        if device_id == self.local_id {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.mark_link_active(device_id, now, &mut effects);
        effects
    }

    pub fn handle_neighbor_lost(&mut self, device_id: DeviceId) -> Vec<RuntimeEffect> {
        if self.neighbors.remove(&device_id).is_none() {
            return Vec::new();
        }
        tracing::debug!(peer = %device_id, "neighbor lost");
        self.refresh_neighbor_gauge();
        vec![RuntimeEffect::Emit(MeshEvent::NeighborLost { device_id })]
    }

    /// Liveness pass: idle neighbors go stale, long-stale ones are removed.
    pub fn tick_liveness(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let window = self.config.liveness_window.as_millis() as u64;
        let grace = self.config.stale_eviction.as_millis() as u64;

        let mut effects = Vec::new();
        for device_id in self.neighbors.mark_stale_if_idle(now, window).went_stale {
            tracing::debug!(peer = %device_id, "neighbor stale");
            effects.push(RuntimeEffect::Emit(MeshEvent::NeighborStale { device_id }));
        }
        for device_id in self.neighbors.evict_stale(now, grace) {
            tracing::debug!(peer = %device_id, "stale neighbor evicted");
            effects.push(RuntimeEffect::Emit(MeshEvent::NeighborLost { device_id }));
        }
        self.refresh_neighbor_gauge();
        effects
    }

    /// One-hop heartbeat to every connected neighbor.
    pub fn tick_heartbeat(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let connected = self.neighbors.connected();
        if connected.is_empty() {
            return Vec::new();
        }
        let heartbeat = MessageBuilder::new(self.local_id, MessageKind::Heartbeat, Vec::new())
            .sequence(now)
            .ttl_hops(0)
            .created_at(now)
            .validity_ms(self.config.liveness_window.as_millis() as u64)
            .build();
        let frame = match heartbeat.to_bytes() {
            Ok(frame) => frame,
            Err(e) => return vec![self.error(format!("heartbeat encode failed: {e}"))],
        };
        connected
            .into_iter()
            .map(|to| RuntimeEffect::SendFrame {
                to,
                frame: frame.clone(),
                track: None,
            })
            .collect()
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// A raw frame arrived from a neighbor.
    ///
    /// Any frame proves the link is up, garbage included. The routing pass
    /// for a newly connected sender runs last, once its `received_from`
    /// entry is recorded.
    pub fn handle_bytes_received(
        &mut self,
        from: DeviceId,
        bytes: &[u8],
        now: u64,
    ) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        let link_up = self.neighbors.touch_connected(from, now);
        self.process_frame(from, bytes, now, &mut effects);
        if link_up {
            self.on_link_up(from, now, &mut effects);
        }
        effects
    }

    fn process_frame(
        &mut self,
        from: DeviceId,
        bytes: &[u8],
        now: u64,
        effects: &mut Vec<RuntimeEffect>,
    ) {
        let message = match Message::from_bytes_with_limit(bytes, self.config.max_payload) {
            Ok(m) => m,
            Err(e) => {
                self.flag_malformed(from, &e, effects);
                return;
            }
        };
        let horizon = now.saturating_add(duration_ms(self.config.max_validity));
        if message.expires_at > horizon {
            let e = MeshError::Malformed {
                reason: format!("validity window ends past {horizon}"),
            };
            self.flag_malformed(from, &e, effects);
            return;
        }

        match message.kind {
            MessageKind::Heartbeat => return,
            _ if message.origin_id == self.local_id => {
                // Our own message echoed back.
                self.store.record_received_from(&message.id, from);
                return;
            }
            _ => {}
        }

        let id = message.id;
        let kind = message.kind;
        match self.store.put(message, now) {
            Ok(PutOutcome::Duplicate) => {
                self.stats.duplicates.inc();
                self.store.record_received_from(&id, from);
                tracing::trace!(id = %id.short(), peer = %from, "duplicate");
                self.persist(&id, effects);
                return;
            }
            Ok(PutOutcome::Expired) => {
                self.stats.expired.inc();
                tracing::debug!(id = %id.short(), peer = %from, "{}", MeshError::Expired);
                return;
            }
            Ok(PutOutcome::Inserted { evicted }) => {
                self.on_inserted(evicted, effects);
                self.store.record_received_from(&id, from);
            }
            Err(e) => {
                self.stats.rejected_capacity.inc();
                tracing::warn!(id = %id.short(), peer = %from, "{e}");
                return;
            }
        }

        if kind == MessageKind::Ack {
            self.apply_external_ack(&id, effects);
        }
        if kind.is_deliverable() {
            self.deliver_local(&id, effects);
        }
        self.route_record(&id, now, effects);
        self.persist(&id, effects);
        if kind.is_deliverable() && self.gateway.is_online() {
            effects.extend(self.tick_gateway(now));
        }
    }

    // ── Local origin ────────────────────────────────────────────────────

    /// Originate a message from this device.
    /// `ttl_hops` and `validity` fall back to the configured defaults.
    pub fn handle_submit_local(
        &mut self,
        kind: MessageKind,
        payload: Vec<u8>,
        ttl_hops: Option<u8>,
        validity: Option<Duration>,
        now: u64,
    ) -> (Result<MessageId, MeshError>, Vec<RuntimeEffect>) {
        if kind == MessageKind::Heartbeat {
            let err = MeshError::Malformed {
                reason: "heartbeats are generated by the runtime".into(),
            };
            return (Err(err), Vec::new());
        }
        if payload.len() > self.config.max_payload {
            let err = MeshError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload,
            };
            return (Err(err), Vec::new());
        }

        let validity = validity
            .unwrap_or(self.config.validity)
            .min(self.config.max_validity);
        if validity.is_zero() {
            return (Err(MeshError::Expired), Vec::new());
        }

        let mut effects = Vec::new();
        let message = MessageBuilder::new(self.local_id, kind, payload)
            .sequence(self.sequence + 1)
            .ttl_hops(ttl_hops.unwrap_or(self.config.ttl_hops))
            .created_at(now)
            .validity_ms(duration_ms(validity))
            .build();
        let id = message.id;

        match self.originate(message, now, &mut effects) {
            Ok(()) => {
                tracing::info!(id = %id.short(), ?kind, "local message submitted");
                (Ok(id), effects)
            }
            Err(e) => (Err(e), effects),
        }
    }

    /// Store a message we created and start flooding it.
    fn originate(
        &mut self,
        message: Message,
        now: u64,
        effects: &mut Vec<RuntimeEffect>,
    ) -> Result<(), MeshError> {
        let id = message.id;
        let sequence = message.sequence;
        let outcome = self.store.put_local(message, now)?;
        self.sequence = self.sequence.max(sequence);
        if self.journaling {
            effects.push(RuntimeEffect::PersistSequence(self.sequence));
        }
        match outcome {
            PutOutcome::Inserted { evicted } => self.on_inserted(evicted, effects),
            PutOutcome::Duplicate => {}
            PutOutcome::Expired => return Err(MeshError::Expired),
        }
        self.route_record(&id, now, effects);
        self.persist(&id, effects);
        if self.gateway.is_online() {
            effects.extend(self.tick_gateway(now));
        }
        Ok(())
    }

    // ── Task outcomes ───────────────────────────────────────────────────

    pub fn handle_outcome(&mut self, outcome: TaskOutcome, now: u64) -> Vec<RuntimeEffect> {
        match outcome {
            TaskOutcome::Sent { to, track, result } => self.handle_send_outcome(to, track, result, now),
            TaskOutcome::Connected { device_id, result } => match result {
                Ok(()) if self.neighbors.get(&device_id).is_none() => {
                    tracing::debug!(peer = %device_id, "connect finished after neighbor was lost");
                    Vec::new()
                }
                Ok(()) => self.handle_neighbor_connected(device_id, now),
                Err(reason) => {
                    tracing::debug!(peer = %device_id, "connect failed: {reason}");
                    self.neighbors.mark_connect_failed(&device_id);
                    Vec::new()
                }
            },
            TaskOutcome::Uploaded { message_id, result } => {
                self.handle_upload_outcome(message_id, result, now)
            }
        }
    }

    fn handle_send_outcome(
        &mut self,
        to: DeviceId,
        track: Option<MessageId>,
        result: Result<(), String>,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        let Some(message_id) = track else {
            if let Err(reason) = result {
                tracing::trace!(peer = %to, "heartbeat send failed: {reason}");
            }
            return Vec::new();
        };
        self.stats.in_flight.dec();

        let mut effects = Vec::new();
        match result {
            Ok(()) => {
                if !self.store.contains(&message_id) {
                    // Swept or evicted while the send was outstanding.
                    return effects;
                }
                self.store.mark_forwarded(&message_id, to);
                self.stats.forwarded.inc();
                self.neighbors.touch_if_present(&to, now);
                tracing::debug!(id = %message_id.short(), peer = %to, "forwarded");
                effects.push(RuntimeEffect::Emit(MeshEvent::Forwarded { message_id, to }));
                self.persist(&message_id, &mut effects);
            }
            Err(reason) => {
                self.store.clear_in_flight(&message_id, &to);
                self.stats.send_failures.inc();
                let err = MeshError::TransientLink {
                    device_id: to.to_string(),
                    reason: reason.clone(),
                };
                tracing::debug!(id = %message_id.short(), "{err}");
                effects.push(RuntimeEffect::Emit(MeshEvent::SendFailed {
                    message_id,
                    to,
                    reason,
                }));
            }
        }
        effects
    }

    fn handle_upload_outcome(
        &mut self,
        message_id: MessageId,
        result: Result<(), String>,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        self.gateway.complete(&message_id);
        let mut effects = Vec::new();
        if let Err(reason) = result {
            tracing::debug!(id = %message_id.short(), "external send failed: {reason}");
            return effects;
        }
        if !self.store.mark_externally_delivered(&message_id) {
            return effects;
        }
        self.stats.externally_delivered.inc();
        tracing::info!(id = %message_id.short(), "externally delivered");
        effects.push(RuntimeEffect::Emit(MeshEvent::ExternallyDelivered { message_id }));
        self.persist(&message_id, &mut effects);

        let Some(record) = self.store.get(&message_id) else {
            return effects;
        };
        if record.local_origin {
            effects.push(RuntimeEffect::Emit(MeshEvent::ExternallyAcknowledged { message_id }));
            return effects;
        }

        // Tell the origin (and every relay on the way) it went out.
        let ack = external_ack(self.local_id, self.sequence + 1, &record.message, now);
        if let Err(e) = self.originate(ack, now, &mut effects) {
            tracing::warn!(id = %message_id.short(), "external ack not sent: {e}");
        }
        effects
    }

    // ── Connectivity / gateway ──────────────────────────────────────────

    pub fn handle_connectivity_gained(&mut self, now: u64) -> Vec<RuntimeEffect> {
        tracing::info!("external connectivity gained");
        self.gateway.set_online(true);
        self.tick_gateway(now)
    }

    pub fn handle_connectivity_lost(&mut self) -> Vec<RuntimeEffect> {
        tracing::info!("external connectivity lost");
        self.gateway.set_online(false);
        Vec::new()
    }

    /// Push every pending SOS/TEXT through the uplink, if online.
    pub fn tick_gateway(&mut self, now: u64) -> Vec<RuntimeEffect> {
        self.gateway
            .drain_pending(&self.store, now)
            .into_iter()
            .map(RuntimeEffect::SendExternal)
            .collect()
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Drop expired records. Their outstanding sends are abandoned.
    pub fn tick_sweep(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let swept = self.store.sweep_expired_ids(now);
        if swept.is_empty() {
            return Vec::new();
        }
        tracing::debug!(count = swept.len(), "swept expired records");
        self.stats.expired.inc_by(swept.len() as u64);
        self.stats.stored.set(self.store.len() as i64);

        let mut effects = Vec::with_capacity(swept.len() * 2);
        for message_id in swept {
            if self.journaling {
                effects.push(RuntimeEffect::Forget(message_id));
            }
            effects.push(RuntimeEffect::Emit(MeshEvent::Expired { message_id }));
        }
        effects
    }

    /// Re-run routing for every live record.
    pub fn tick_reroute(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        for id in self.store.live_ids(now) {
            self.route_record(&id, now, &mut effects);
        }
        effects
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn neighbor_snapshot(&self) -> Vec<NeighborEntry> {
        self.neighbors.snapshot()
    }

    pub fn record(&self, id: &MessageId) -> Option<RelayRecord> {
        self.store.get(id).cloned()
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Mark `device_id` connected.
    fn mark_link_active(&mut self, device_id: DeviceId, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if self.neighbors.touch_connected(device_id, now) {
            self.on_link_up(device_id, now, effects);
        }
    }

    /// A neighbor just came up: routing pass over every live record.
    fn on_link_up(&mut self, device_id: DeviceId, now: u64, effects: &mut Vec<RuntimeEffect>) {
        tracing::debug!(peer = %device_id, "neighbor connected");
        self.refresh_neighbor_gauge();
        effects.push(RuntimeEffect::Emit(MeshEvent::NeighborConnected { device_id }));
        for id in self.store.live_ids(now) {
            self.route_record(&id, now, effects);
        }
    }

    fn on_inserted(&mut self, evicted: Option<MessageId>, effects: &mut Vec<RuntimeEffect>) {
        self.stats.inserted.inc();
        if let Some(message_id) = evicted {
            self.stats.evicted.inc();
            if self.journaling {
                effects.push(RuntimeEffect::Forget(message_id));
            }
            effects.push(RuntimeEffect::Emit(MeshEvent::Evicted { message_id }));
        }
        self.stats.stored.set(self.store.len() as i64);
    }

    /// Route one record and reserve the chosen targets.
    fn route_record(&mut self, id: &MessageId, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let Some(record) = self.store.get(id) else {
            return;
        };
        let snapshot = self.neighbors.snapshot();
        match self.router.route(record, &snapshot, now) {
            RoutingAction::Forward { message, targets } => {
                if targets.is_empty() {
                    return;
                }
                let frame = match message.to_bytes() {
                    Ok(frame) => frame,
                    Err(e) => {
                        self.store.mark_dropped(id);
                        effects.push(self.error(format!("encode {} failed: {e}", id.short())));
                        return;
                    }
                };
                for to in targets {
                    if self.store.mark_in_flight(id, to) {
                        self.stats.in_flight.inc();
                        effects.push(RuntimeEffect::SendFrame {
                            to,
                            frame: frame.clone(),
                            track: Some(*id),
                        });
                    }
                }
            }
            RoutingAction::Reject {
                reason: DropReason::Expired,
            } => {
                self.store.mark_expired(id);
                effects.push(RuntimeEffect::Emit(MeshEvent::Dropped {
                    message_id: *id,
                    reason: DropReason::Expired,
                }));
            }
            RoutingAction::Reject { reason } => {
                // TTL 0 and heartbeats still count for local delivery and
                // the gateway; they just stay here.
                tracing::trace!(id = %id.short(), ?reason, "not forwarded");
            }
        }
    }

    fn deliver_local(&mut self, id: &MessageId, effects: &mut Vec<RuntimeEffect>) {
        if !self.store.mark_delivered_local(id) {
            return;
        }
        let Some(record) = self.store.get(id) else {
            return;
        };
        self.stats.delivered_local.inc();
        let m = &record.message;
        effects.push(RuntimeEffect::Deliver(DeliveredMessage {
            id: m.id,
            kind: m.kind,
            origin_id: m.origin_id,
            sequence: m.sequence,
            payload: m.payload.clone(),
            created_at: m.created_at,
            hops: m.path_hint.len(),
        }));
    }

    /// An ACK naming a record we hold: stop uploading it, and tell the app
    /// if the record is ours.
    fn apply_external_ack(&mut self, ack_id: &MessageId, effects: &mut Vec<RuntimeEffect>) {
        let Some(delivered) = self.store.get(ack_id).and_then(|r| acked_id(&r.message)) else {
            return;
        };
        if !self.store.mark_externally_delivered(&delivered) {
            return;
        }
        let local_origin = self
            .store
            .get(&delivered)
            .map(|r| r.local_origin)
            .unwrap_or(false);
        if local_origin {
            tracing::info!(id = %delivered.short(), "external delivery acknowledged");
            effects.push(RuntimeEffect::Emit(MeshEvent::ExternallyAcknowledged {
                message_id: delivered,
            }));
        }
        self.persist(&delivered, effects);
    }

    /// Count a bad frame against `from` and report it.
    fn flag_malformed(&mut self, from: DeviceId, e: &MeshError, effects: &mut Vec<RuntimeEffect>) {
        self.stats.malformed.inc();
        let count = self.malformed.get(&from).copied().unwrap_or(0).saturating_add(1);
        self.malformed.put(from, count);
        tracing::debug!(peer = %from, count, "malformed frame: {e}");
        effects.push(RuntimeEffect::Emit(MeshEvent::MalformedFrom {
            device_id: from,
            count,
        }));
    }

    fn persist(&self, id: &MessageId, effects: &mut Vec<RuntimeEffect>) {
        if !self.journaling {
            return;
        }
        if let Some(record) = self.store.get(id) {
            effects.push(RuntimeEffect::Persist(record.clone()));
        }
    }

    fn refresh_neighbor_gauge(&self) {
        self.stats
            .connected_neighbors
            .set(self.neighbors.connected().len() as i64);
    }

    fn error(&self, description: String) -> RuntimeEffect {
        tracing::warn!("{description}");
        RuntimeEffect::Emit(MeshEvent::Error { description })
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
