/// Content-addressed message store.
///
/// The single authority for `MessageId -> RelayRecord`. Dedupes inbound
/// copies, tracks which neighbors already have each message, and bounds
/// memory with a fixed record capacity.
///
/// Pure state machine: every time-dependent call takes `now` (Unix ms),
/// the runtime drives the sweep timer.
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::message::Message;
use crate::types::{DeviceId, MessageId, MessageKind, RelayStatus};

/// Default maximum number of records.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Result of [`MessageStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New id. `evicted` names the record dropped to make room, if any.
    Inserted { evicted: Option<MessageId> },
    /// Id already present, nothing changed.
    Duplicate,
    /// Validity window already over, not stored.
    Expired,
}

impl PutOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, PutOutcome::Inserted { .. })
    }
}

/// Everything this device knows about one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    /// The message as first stored here.
    pub message: Message,
    /// Neighbors that sent us this id.
    pub received_from: BTreeSet<DeviceId>,
    /// Neighbors we successfully sent this id to. Only grows.
    pub forwarded_to: BTreeSet<DeviceId>,
    /// Neighbors with a send currently outstanding.
    #[serde(skip)]
    pub in_flight: BTreeSet<DeviceId>,
    pub status: RelayStatus,
    /// Handed to the local UI (at most once).
    pub delivered_local: bool,
    /// Created by this device.
    pub local_origin: bool,
}

impl RelayRecord {
    fn new(message: Message) -> Self {
        Self {
            message,
            received_from: BTreeSet::new(),
            forwarded_to: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            status: RelayStatus::Pending,
            delivered_local: false,
            local_origin: false,
        }
    }

    pub fn id(&self) -> MessageId {
        self.message.id
    }

    /// Still worth routing: not terminal, not expired, has hops left.
    pub fn is_live(&self, now: u64) -> bool {
        !self.status.is_terminal()
            && !self.message.is_expired(now)
            && self.message.ttl_hops > 0
            && self.message.kind != MessageKind::Heartbeat
    }

    /// SOS/TEXT not yet handed to the outside world.
    pub fn is_gateway_eligible(&self, now: u64) -> bool {
        self.message.kind.is_deliverable()
            && self.status < RelayStatus::ExternallyDelivered
            && !self.message.is_expired(now)
    }

    /// Records evicted first under capacity pressure.
    fn is_settled(&self, now: u64) -> bool {
        self.status.is_terminal()
            || self.status >= RelayStatus::DeliveredLocal
            || self.message.is_expired(now)
    }

    /// Move forward in the status pipeline; never backwards, never out of a
    /// terminal state.
    fn advance(&mut self, status: RelayStatus) -> bool {
        if self.status.is_terminal() || status <= self.status {
            return false;
        }
        self.status = status;
        true
    }
}

/// Bounded, deduplicating store of relay records.
#[derive(Debug)]
pub struct MessageStore {
    records: HashMap<MessageId, RelayRecord>,
    capacity: usize,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert if the id is unseen and the message still valid.
    ///
    /// Idempotent: a second `put` of the same id is `Duplicate`. Fails
    /// with `CapacityExceeded` only when the store is full and every record
    /// has sends in flight.
    pub fn put(&mut self, message: Message, now: u64) -> Result<PutOutcome, MeshError> {
        if let Some(existing) = self.records.get(&message.id) {
            if existing.message.origin_id != message.origin_id
                || existing.message.sequence != message.sequence
            {
                tracing::warn!(
                    id = %message.id.short(),
                    "content id collision between distinct (origin, sequence) pairs"
                );
            }
            return Ok(PutOutcome::Duplicate);
        }
        if message.is_expired(now) {
            return Ok(PutOutcome::Expired);
        }

        let evicted = if self.records.len() >= self.capacity {
            let victim = self
                .eviction_candidate(now)
                .ok_or(MeshError::CapacityExceeded {
                    capacity: self.capacity,
                })?;
            self.records.remove(&victim);
            tracing::debug!(id = %victim.short(), "evicted record under capacity pressure");
            Some(victim)
        } else {
            None
        };

        self.records.insert(message.id, RelayRecord::new(message));
        Ok(PutOutcome::Inserted { evicted })
    }

    /// `put` for a message created on this device.
    pub fn put_local(&mut self, message: Message, now: u64) -> Result<PutOutcome, MeshError> {
        let id = message.id;
        let outcome = self.put(message, now)?;
        if outcome.is_inserted() {
            if let Some(record) = self.records.get_mut(&id) {
                record.local_origin = true;
            }
        }
        Ok(outcome)
    }

    /// Re-insert a record restored from the journal, untouched.
    pub fn restore(&mut self, record: RelayRecord, now: u64) -> bool {
        if self.records.len() >= self.capacity
            || record.message.is_expired(now)
            || self.records.contains_key(&record.id())
        {
            return false;
        }
        self.records.insert(record.id(), record);
        true
    }

    pub fn get(&self, id: &MessageId) -> Option<&RelayRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.records.contains_key(id)
    }

    /// Remember that `neighbor` has this id (sent it or asked for it).
    pub fn record_received_from(&mut self, id: &MessageId, neighbor: DeviceId) {
        if let Some(record) = self.records.get_mut(id) {
            record.received_from.insert(neighbor);
        }
    }

    /// Reserve a send slot. False if unknown, already sent, or in flight.
    pub fn mark_in_flight(&mut self, id: &MessageId, neighbor: DeviceId) -> bool {
        match self.records.get_mut(id) {
            Some(record) if !record.forwarded_to.contains(&neighbor) => {
                record.in_flight.insert(neighbor)
            }
            _ => false,
        }
    }

    /// A send failed or was abandoned; the neighbor becomes eligible again.
    pub fn clear_in_flight(&mut self, id: &MessageId, neighbor: &DeviceId) {
        if let Some(record) = self.records.get_mut(id) {
            record.in_flight.remove(neighbor);
        }
    }

    /// Send succeeded. No-op for unknown ids.
    pub fn mark_forwarded(&mut self, id: &MessageId, neighbor: DeviceId) {
        if let Some(record) = self.records.get_mut(id) {
            record.in_flight.remove(&neighbor);
            record.forwarded_to.insert(neighbor);
            record.advance(RelayStatus::Forwarded);
        }
    }

    /// Hand-off to the local UI. Returns true only the first time.
    pub fn mark_delivered_local(&mut self, id: &MessageId) -> bool {
        match self.records.get_mut(id) {
            Some(record) if !record.delivered_local => {
                record.delivered_local = true;
                record.advance(RelayStatus::DeliveredLocal);
                true
            }
            _ => false,
        }
    }

    /// External transport acknowledged. Returns true only the first time.
    pub fn mark_externally_delivered(&mut self, id: &MessageId) -> bool {
        self.records
            .get_mut(id)
            .map(|r| r.advance(RelayStatus::ExternallyDelivered))
            .unwrap_or(false)
    }

    /// Validity window over; kept until the next sweep.
    pub fn mark_expired(&mut self, id: &MessageId) {
        if let Some(record) = self.records.get_mut(id) {
            if !record.status.is_terminal() {
                record.status = RelayStatus::Expired;
            }
        }
    }

    /// Stop relaying (hop budget spent, rejected).
    pub fn mark_dropped(&mut self, id: &MessageId) {
        if let Some(record) = self.records.get_mut(id) {
            if !record.status.is_terminal() {
                record.status = RelayStatus::Dropped;
            }
        }
    }

    /// Remove every record past `expires_at`. Returns the count.
    pub fn sweep_expired(&mut self, now: u64) -> usize {
        self.sweep_expired_ids(now).len()
    }

    /// Like [`sweep_expired`](Self::sweep_expired) but names what went.
    ///
    /// In-flight sends for swept records are abandoned: their outcomes
    /// arrive for an unknown id and are ignored.
    pub fn sweep_expired_ids(&mut self, now: u64) -> Vec<MessageId> {
        let mut removed = Vec::new();
        self.records.retain(|id, record| {
            if record.message.is_expired(now) {
                removed.push(*id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Ids worth a routing pass, oldest first.
    pub fn live_ids(&self, now: u64) -> Vec<MessageId> {
        let mut live: Vec<&RelayRecord> = self
            .records
            .values()
            .filter(|r| r.is_live(now))
            .collect();
        live.sort_by_key(|r| (r.message.created_at, r.id()));
        live.into_iter().map(|r| r.id()).collect()
    }

    /// Records the gateway should push out, oldest first.
    pub fn gateway_candidates(&self, now: u64) -> Vec<&RelayRecord> {
        let mut out: Vec<&RelayRecord> = self
            .records
            .values()
            .filter(|r| r.is_gateway_eligible(now))
            .collect();
        out.sort_by_key(|r| (r.message.created_at, r.id()));
        out
    }

    pub fn records(&self) -> impl Iterator<Item = &RelayRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ── Internal ───────────────────────────────────────────────────────

    /// Oldest settled record first, then oldest unsettled. Records with
    /// sends in flight are never chosen.
    fn eviction_candidate(&self, now: u64) -> Option<MessageId> {
        let idle = self.records.values().filter(|r| r.in_flight.is_empty());
        let oldest = |settled: bool| {
            idle.clone()
                .filter(|r| r.is_settled(now) == settled)
                .min_by_key(|r| (r.message.created_at, r.id()))
                .map(|r| r.id())
        };
        oldest(true).or_else(|| oldest(false))
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;

    fn device(seed: u8) -> DeviceId {
        DeviceId::from_bytes([seed; 16])
    }

    fn msg(seq: u64, created_at: u64, validity: u64) -> Message {
        MessageBuilder::new(device(1), MessageKind::Sos, format!("sos #{seq}").into_bytes())
            .sequence(seq)
            .created_at(created_at)
            .validity_ms(validity)
            .build()
    }

    #[test]
    fn put_twice_is_inserted_then_duplicate() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 1_000);
        assert_eq!(
            store.put(m.clone(), 10).unwrap(),
            PutOutcome::Inserted { evicted: None }
        );
        assert_eq!(store.put(m, 20).unwrap(), PutOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expired_message_not_stored() {
        let mut store = MessageStore::new();
        assert_eq!(store.put(msg(1, 0, 100), 100).unwrap(), PutOutcome::Expired);
        assert!(store.is_empty());
    }

    #[test]
    fn sweep_resets_dedupe() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 100);
        store.put(m.clone(), 10).unwrap();
        assert_eq!(store.sweep_expired(150), 1);
        assert!(store.get(&m.id).is_none());

        // Same (origin, sequence, payload) re-broadcast with a fresh window.
        let again = MessageBuilder::new(device(1), MessageKind::Sos, m.payload.clone())
            .sequence(1)
            .created_at(150)
            .validity_ms(1_000)
            .build();
        assert_eq!(again.id, m.id);
        assert!(store.put(again, 160).unwrap().is_inserted());
    }

    #[test]
    fn received_from_accumulates() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 1_000);
        store.put(m.clone(), 0).unwrap();
        store.record_received_from(&m.id, device(2));
        assert_eq!(store.put(m.clone(), 1).unwrap(), PutOutcome::Duplicate);
        store.record_received_from(&m.id, device(3));

        let record = store.get(&m.id).unwrap();
        assert_eq!(
            record.received_from,
            [device(2), device(3)].into_iter().collect()
        );
    }

    #[test]
    fn forwarded_once_per_neighbor() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 1_000);
        store.put(m.clone(), 0).unwrap();

        assert!(store.mark_in_flight(&m.id, device(2)));
        assert!(!store.mark_in_flight(&m.id, device(2)), "already in flight");
        store.mark_forwarded(&m.id, device(2));
        assert!(!store.mark_in_flight(&m.id, device(2)), "already forwarded");

        let record = store.get(&m.id).unwrap();
        assert!(record.in_flight.is_empty());
        assert_eq!(record.status, RelayStatus::Forwarded);
    }

    #[test]
    fn failed_send_frees_slot() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 1_000);
        store.put(m.clone(), 0).unwrap();
        store.mark_in_flight(&m.id, device(2));
        store.clear_in_flight(&m.id, &device(2));
        assert!(store.get(&m.id).unwrap().forwarded_to.is_empty());
        assert!(store.mark_in_flight(&m.id, device(2)));
    }

    #[test]
    fn unknown_ids_are_noops() {
        let mut store = MessageStore::new();
        let ghost = msg(9, 0, 1_000).id;
        store.mark_forwarded(&ghost, device(2));
        store.record_received_from(&ghost, device(2));
        assert!(!store.mark_delivered_local(&ghost));
        assert!(!store.mark_externally_delivered(&ghost));
        assert!(!store.mark_in_flight(&ghost, device(2)));
        assert!(store.is_empty());
    }

    #[test]
    fn local_delivery_at_most_once() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 1_000);
        store.put(m.clone(), 0).unwrap();
        assert!(store.mark_delivered_local(&m.id));
        assert!(!store.mark_delivered_local(&m.id));
        assert_eq!(store.get(&m.id).unwrap().status, RelayStatus::DeliveredLocal);

        // Forwarding afterwards does not regress the status.
        store.mark_forwarded(&m.id, device(3));
        assert_eq!(store.get(&m.id).unwrap().status, RelayStatus::DeliveredLocal);
    }

    #[test]
    fn external_delivery_is_terminal_for_gateway() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 1_000);
        store.put(m.clone(), 0).unwrap();
        assert_eq!(store.gateway_candidates(10).len(), 1);
        assert!(store.mark_externally_delivered(&m.id));
        assert!(!store.mark_externally_delivered(&m.id));
        assert!(store.gateway_candidates(10).is_empty());
    }

    #[test]
    fn eviction_prefers_settled_records() {
        let mut store = MessageStore::with_capacity(3);
        let old_pending = msg(1, 0, 10_000);
        let delivered = msg(2, 100, 10_000);
        let fresh_pending = msg(3, 200, 10_000);
        for m in [&old_pending, &delivered, &fresh_pending] {
            store.put(m.clone(), 300).unwrap();
        }
        store.mark_delivered_local(&delivered.id);

        let outcome = store.put(msg(4, 300, 10_000), 300).unwrap();
        assert_eq!(
            outcome,
            PutOutcome::Inserted {
                evicted: Some(delivered.id)
            }
        );
        assert!(store.contains(&old_pending.id));
    }

    #[test]
    fn eviction_falls_back_to_oldest_pending() {
        let mut store = MessageStore::with_capacity(2);
        let first = msg(1, 0, 10_000);
        let second = msg(2, 100, 10_000);
        store.put(first.clone(), 200).unwrap();
        store.put(second.clone(), 200).unwrap();

        let outcome = store.put(msg(3, 200, 10_000), 200).unwrap();
        assert_eq!(
            outcome,
            PutOutcome::Inserted {
                evicted: Some(first.id)
            }
        );
    }

    #[test]
    fn eviction_skips_in_flight_records() {
        let mut store = MessageStore::with_capacity(2);
        let first = msg(1, 0, 10_000);
        let second = msg(2, 100, 10_000);
        store.put(first.clone(), 200).unwrap();
        store.put(second.clone(), 200).unwrap();
        store.mark_in_flight(&first.id, device(7));

        let outcome = store.put(msg(3, 200, 10_000), 200).unwrap();
        assert_eq!(
            outcome,
            PutOutcome::Inserted {
                evicted: Some(second.id)
            }
        );
        assert!(store.contains(&first.id));
    }

    #[test]
    fn capacity_exceeded_when_everything_in_flight() {
        let mut store = MessageStore::with_capacity(1);
        let first = msg(1, 0, 10_000);
        store.put(first.clone(), 0).unwrap();
        store.mark_in_flight(&first.id, device(7));

        let err = store.put(msg(2, 0, 10_000), 0).unwrap_err();
        assert!(matches!(err, MeshError::CapacityExceeded { capacity: 1 }));
    }

    #[test]
    fn sweep_abandons_in_flight_sends() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 100);
        store.put(m.clone(), 0).unwrap();
        store.mark_in_flight(&m.id, device(2));

        assert_eq!(store.sweep_expired_ids(100), vec![m.id]);
        // Late outcome for the abandoned send is ignored.
        store.mark_forwarded(&m.id, device(2));
        assert!(store.is_empty());
    }

    #[test]
    fn live_ids_exclude_dead_records() {
        let mut store = MessageStore::new();
        let live = msg(1, 0, 1_000);
        let dropped = msg(2, 10, 1_000);
        let spent = MessageBuilder::new(device(1), MessageKind::Text, b"x".to_vec())
            .sequence(3)
            .created_at(20)
            .ttl_hops(0)
            .build();
        for m in [&live, &dropped, &spent] {
            store.put(m.clone(), 30).unwrap();
        }
        store.mark_dropped(&dropped.id);

        assert_eq!(store.live_ids(30), vec![live.id]);
        assert!(store.live_ids(1_000).is_empty(), "expired");
    }

    #[test]
    fn put_local_flags_origin() {
        let mut store = MessageStore::new();
        let m = msg(1, 0, 1_000);
        store.put_local(m.clone(), 0).unwrap();
        assert!(store.get(&m.id).unwrap().local_origin);
    }
}
