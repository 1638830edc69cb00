/// Controlled-flooding router.
///
/// Pure decision logic: given a stored record and the current neighbor
/// snapshot, decide which neighbors get a copy. No I/O, no store mutation.
/// The caller reserves the targets (`mark_in_flight`) and ships the
/// forwarded copy.
use crate::message::Message;
use crate::neighbor::{NeighborEntry, NeighborState};
use crate::store::RelayRecord;
use crate::types::{DeviceId, MessageKind, MAX_PATH_HINT, SOS_FANOUT_CAP, TEXT_FANOUT};

/// Fan-out limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Max distinct neighbors an SOS is ever sent to from this device.
    pub sos_fanout_cap: usize,
    /// Max distinct neighbors a TEXT or ACK is ever sent to.
    pub text_fanout: usize,
    /// Path hint length kept on forwarded copies.
    pub path_hint_cap: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            sos_fanout_cap: SOS_FANOUT_CAP,
            text_fanout: TEXT_FANOUT,
            path_hint_cap: MAX_PATH_HINT,
        }
    }
}

// ── Routing decisions ──────────────────────────────────────────────────

/// Why a message will not be forwarded, ever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// `ttl_hops` is zero.
    TtlExhausted,
    /// Validity window over.
    Expired,
    /// Heartbeats never leave one hop.
    OneHopOnly,
    /// Record already expired or dropped.
    Terminal,
}

/// What to do with a stored message right now.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingAction {
    /// Send `message` (TTL decremented, path hint extended) to each target.
    /// `targets` may be empty when nobody eligible is in range.
    Forward {
        message: Message,
        targets: Vec<DeviceId>,
    },
    /// Never forward this message again.
    Reject { reason: DropReason },
}

// ── Router ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Router {
    local_id: DeviceId,
    config: RoutingConfig,
}

impl Router {
    pub fn new(local_id: DeviceId, config: RoutingConfig) -> Self {
        Self { local_id, config }
    }

    pub fn local_id(&self) -> DeviceId {
        self.local_id
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Lifetime fan-out limit for a kind (0 = never forwarded).
    pub fn fanout_for(&self, kind: MessageKind) -> usize {
        match kind {
            MessageKind::Sos => self.config.sos_fanout_cap,
            MessageKind::Text | MessageKind::Ack => self.config.text_fanout,
            MessageKind::Heartbeat => 0,
        }
    }

    /// Decide where `record` goes next.
    ///
    /// Neighbors are taken in snapshot order (best link first). A target is
    /// never one that already has the message (sent it, got it, is getting
    /// it), is on the path hint, or is the origin.
    pub fn route(
        &self,
        record: &RelayRecord,
        neighbors: &[NeighborEntry],
        now: u64,
    ) -> RoutingAction {
        let message = &record.message;

        if record.status.is_terminal() {
            return RoutingAction::Reject {
                reason: DropReason::Terminal,
            };
        }
        if message.kind == MessageKind::Heartbeat {
            return RoutingAction::Reject {
                reason: DropReason::OneHopOnly,
            };
        }
        if message.is_expired(now) {
            return RoutingAction::Reject {
                reason: DropReason::Expired,
            };
        }
        let Some(copy) = message.forwarded_copy(self.local_id, self.config.path_hint_cap) else {
            return RoutingAction::Reject {
                reason: DropReason::TtlExhausted,
            };
        };

        let used = record.forwarded_to.len() + record.in_flight.len();
        let budget = self.fanout_for(message.kind).saturating_sub(used);

        let targets = neighbors
            .iter()
            .filter(|n| n.state == NeighborState::Connected)
            .map(|n| n.device_id)
            .filter(|id| self.is_eligible(record, id))
            .take(budget)
            .collect();

        RoutingAction::Forward {
            message: copy,
            targets,
        }
    }

    fn is_eligible(&self, record: &RelayRecord, id: &DeviceId) -> bool {
        *id != self.local_id
            && *id != record.message.origin_id
            && !record.received_from.contains(id)
            && !record.forwarded_to.contains(id)
            && !record.in_flight.contains(id)
            && !record.message.path_hint.contains(id)
    }
}
