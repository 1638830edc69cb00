/// One-hop neighbor table.
///
/// Tracks devices directly reachable over the radio, their link quality
/// and liveness. Pure state; the runtime feeds discovery events and
/// timer ticks, the router reads [`NeighborTable::snapshot`].
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::DeviceId;

/// Connection state of a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborState {
    /// Seen by discovery, no link yet.
    Discovered,
    /// Link layer asked to connect.
    Connecting,
    /// Link up; eligible for forwarding.
    Connected,
    /// No activity within the liveness window.
    Stale,
}

/// A directly reachable device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub device_id: DeviceId,
    /// Signal-strength-derived score, higher is better.
    pub link_quality: u8,
    /// Unix ms of last discovery/heartbeat/link activity.
    pub last_seen: u64,
    pub state: NeighborState,
    /// Unix ms when the entry went stale (eviction clock).
    pub stale_since: Option<u64>,
}

/// What a liveness pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LivenessReport {
    /// Neighbors that just transitioned to `Stale`.
    pub went_stale: Vec<DeviceId>,
}

#[derive(Debug, Default)]
pub struct NeighborTable {
    entries: HashMap<DeviceId, NeighborEntry>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh or create an entry; resets `last_seen`.
    ///
    /// A new entry (or one coming back from `Stale`) starts `Discovered`.
    /// Live entries keep their connection state.
    pub fn upsert(&mut self, device_id: DeviceId, link_quality: u8, now: u64) -> &NeighborEntry {
        let entry = self
            .entries
            .entry(device_id)
            .or_insert_with(|| NeighborEntry {
                device_id,
                link_quality,
                last_seen: now,
                state: NeighborState::Discovered,
                stale_since: None,
            });
        entry.link_quality = link_quality;
        entry.last_seen = now;
        if entry.state == NeighborState::Stale {
            entry.state = NeighborState::Discovered;
            entry.stale_since = None;
        }
        entry
    }

    /// Record link activity (inbound frame, heartbeat, successful connect).
    ///
    /// Creates the entry if needed and marks it `Connected`. Returns true
    /// when the neighbor was not connected before.
    pub fn touch_connected(&mut self, device_id: DeviceId, now: u64) -> bool {
        let entry = self
            .entries
            .entry(device_id)
            .or_insert_with(|| NeighborEntry {
                device_id,
                link_quality: 0,
                last_seen: now,
                state: NeighborState::Discovered,
                stale_since: None,
            });
        entry.last_seen = now;
        entry.stale_since = None;
        let newly = entry.state != NeighborState::Connected;
        entry.state = NeighborState::Connected;
        newly
    }

    /// Like [`touch_connected`](Self::touch_connected) but never creates an
    /// entry: a removed neighbor stays removed. `None` if unknown.
    pub fn touch_if_present(&mut self, device_id: &DeviceId, now: u64) -> Option<bool> {
        let entry = self.entries.get_mut(device_id)?;
        entry.last_seen = now;
        entry.stale_since = None;
        let newly = entry.state != NeighborState::Connected;
        entry.state = NeighborState::Connected;
        Some(newly)
    }

    /// Move to `Connecting`. No-op for unknown or already connected entries.
    pub fn mark_connecting(&mut self, device_id: &DeviceId) -> bool {
        match self.entries.get_mut(device_id) {
            Some(entry) if entry.state != NeighborState::Connected => {
                entry.state = NeighborState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// A connect attempt failed, back to `Discovered`.
    pub fn mark_connect_failed(&mut self, device_id: &DeviceId) {
        if let Some(entry) = self.entries.get_mut(device_id) {
            if entry.state == NeighborState::Connecting {
                entry.state = NeighborState::Discovered;
            }
        }
    }

    /// Transition idle entries to `Stale`. Never deletes.
    pub fn mark_stale_if_idle(&mut self, now: u64, liveness_window: u64) -> LivenessReport {
        let mut report = LivenessReport::default();
        for entry in self.entries.values_mut() {
            if entry.state == NeighborState::Stale {
                continue;
            }
            if now.saturating_sub(entry.last_seen) >= liveness_window {
                entry.state = NeighborState::Stale;
                entry.stale_since = Some(now);
                report.went_stale.push(entry.device_id);
            }
        }
        report
    }

    /// Remove entries that have been stale for at least `grace` ms.
    pub fn evict_stale(&mut self, now: u64, grace: u64) -> Vec<DeviceId> {
        let mut evicted = Vec::new();
        self.entries.retain(|id, entry| match entry.stale_since {
            Some(since) if entry.state == NeighborState::Stale && now.saturating_sub(since) >= grace => {
                evicted.push(*id);
                false
            }
            _ => true,
        });
        evicted
    }

    pub fn remove(&mut self, device_id: &DeviceId) -> Option<NeighborEntry> {
        self.entries.remove(device_id)
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&NeighborEntry> {
        self.entries.get(device_id)
    }

    /// All entries, best link first; ties go to the most recently seen.
    pub fn snapshot(&self) -> Vec<NeighborEntry> {
        let mut entries: Vec<NeighborEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.link_quality
                .cmp(&a.link_quality)
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a.device_id.cmp(&b.device_id))
        });
        entries
    }

    /// Ids of connected neighbors, in snapshot order.
    pub fn connected(&self) -> Vec<DeviceId> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.state == NeighborState::Connected)
            .map(|e| e.device_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
