/// Errors raised by the mesh relay core.
///
/// None of these are fatal to the runtime: link failures are retried
/// opportunistically, malformed frames are dropped, capacity pressure
/// evicts. They surface as `Result`s at API boundaries and as log lines
/// inside the event loop.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("link send to {device_id} failed: {reason}")]
    TransientLink { device_id: String, reason: String },

    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("message id does not match its content")]
    HashMismatch,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("message store full ({capacity} records in flight)")]
    CapacityExceeded { capacity: usize },

    #[error("message expired")]
    Expired,

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("journal error: {0}")]
    Journal(#[from] rusqlite::Error),

    #[error("runtime shut down")]
    RuntimeClosed,
}

impl MeshError {
    /// True for errors that mean the peer sent garbage.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            MeshError::Malformed { .. }
                | MeshError::HashMismatch
                | MeshError::PayloadTooLarge { .. }
                | MeshError::Deserialization(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for MeshError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MeshError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MeshError::Deserialization(e.to_string())
    }
}
