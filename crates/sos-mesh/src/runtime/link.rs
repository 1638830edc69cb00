use crate::error::MeshError;
use crate::types::DeviceId;

/// Short-range radio abstraction (BLE, WiFi-Direct, LoRa...).
///
/// In production: a platform binding. In tests: [`mock::MockLink`].
/// Inbound frames and discovery events are pushed into the runtime
/// through its handle; this trait only covers the outbound side.
#[async_trait::async_trait]
pub trait LinkLayer: Send + Sync + 'static {
    /// Ship one frame to a directly connected neighbor.
    async fn send(&self, to: DeviceId, frame: &[u8]) -> Result<(), MeshError>;

    /// Establish a link to a discovered neighbor.
    async fn connect(&self, to: DeviceId) -> Result<(), MeshError>;
}

// ── MockLink (tests) ──────────────────────────────────────────────────
