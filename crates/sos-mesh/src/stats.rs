/// Relay counters, shared between the event loop and every handle.
use serde::Serialize;
use sos_metrics::{Counter, Gauge};

#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayStats {
    /// New records stored (local + received).
    pub inserted: Counter,
    /// Inbound copies of an id we already had.
    pub duplicates: Counter,
    /// Inbound messages already past their window, plus swept records.
    pub expired: Counter,
    /// Frames that failed to decode or validate.
    pub malformed: Counter,
    /// Successful per-neighbor sends.
    pub forwarded: Counter,
    /// Failed per-neighbor sends.
    pub send_failures: Counter,
    pub delivered_local: Counter,
    pub externally_delivered: Counter,
    /// Records dropped under capacity pressure.
    pub evicted: Counter,
    /// Inbound messages refused because the store was full.
    pub rejected_capacity: Counter,
    /// Sends currently outstanding.
    pub in_flight: Gauge,
    /// Neighbors currently `Connected`.
    pub connected_neighbors: Gauge,
    /// Records currently held.
    pub stored: Gauge,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }
}
