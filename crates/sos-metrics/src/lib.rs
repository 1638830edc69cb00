//! Relay statistics primitives.
//!
//! [`Counter`] only ever goes up (frames forwarded, duplicates seen).
//! [`Gauge`] tracks a level that moves both ways (sends in flight,
//! connected neighbors). Both serialize as their plain numeric value so
//! a stats snapshot can be logged as JSON or MessagePack directly.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonic event counter.
///
/// Relaxed ordering throughout: values are read for reporting only and
/// never used to synchronize other memory.
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Level that can rise and fall.
pub struct Gauge(AtomicI64);

impl Gauge {
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero.
    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some((v - 1).max(0)));
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

// Clones are detached snapshots, not shared handles.
impl Clone for Counter {
    fn clone(&self) -> Self {
        Self(AtomicU64::new(self.get()))
    }
}

impl Clone for Gauge {
    fn clone(&self) -> Self {
        Self(AtomicI64::new(self.get()))
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter({})", self.get())
    }
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gauge({})", self.get())
    }
}

impl serde::Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.get())
    }
}

impl<'de> serde::Deserialize<'de> for Counter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(|v| Self(AtomicU64::new(v)))
    }
}

impl serde::Serialize for Gauge {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.get())
    }
}

impl<'de> serde::Deserialize<'de> for Gauge {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(|v| Self(AtomicI64::new(v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = Counter::new();
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn gauge_moves_both_ways_and_floors_at_zero() {
        let g = Gauge::default();
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
        g.dec();
        g.dec();
        assert_eq!(g.get(), 0);
        g.set(7);
        assert_eq!(g.get(), 7);
    }

    #[test]
    fn clone_is_detached() {
        let c = Counter::new();
        c.inc_by(3);
        let snapshot = c.clone();
        c.inc();
        assert_eq!(snapshot.get(), 3);
        assert_eq!(c.get(), 4);
    }

    #[test]
    fn serializes_as_plain_number() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Stats {
            forwarded: Counter,
            in_flight: Gauge,
        }

        let stats = Stats {
            forwarded: Counter::new(),
            in_flight: Gauge::new(),
        };
        stats.forwarded.inc_by(12);
        stats.in_flight.set(2);

        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"forwarded":12,"in_flight":2}"#);

        let back: Stats = serde_json::from_str(&json).unwrap();
        assert_eq!(back.forwarded.get(), 12);
        assert_eq!(back.in_flight.get(), 2);
    }
}
