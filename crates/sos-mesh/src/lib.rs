//! Emergency mesh relay core.
//!
//! Store-and-forward relaying of SOS and text messages between nearby
//! phones with no infrastructure: content-addressed dedup store, one-hop
//! neighbor table, bounded controlled flooding, and a gateway bridge that
//! hands messages to the internet once any device gets connectivity.
//!
//! Wire format: MessagePack (compact binary).
//! Message ids: SHA-256 over (origin, sequence, payload).

pub mod error;
pub mod gateway;
pub mod journal;
pub mod message;
pub mod neighbor;
pub mod router;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod types;

pub use error::MeshError;
pub use gateway::{acked_id, external_ack, ExternalTransport, GatewayBridge, NoExternal};
pub use journal::MessageJournal;
pub use message::{Message, MessageBuilder};
pub use neighbor::{LivenessReport, NeighborEntry, NeighborState, NeighborTable};
pub use router::{DropReason, Router, RoutingAction, RoutingConfig};
pub use runtime::{
    DeliveredMessage, LinkLayer, MeshEvent, RelayRuntime, RuntimeChannels, RuntimeConfig,
    RuntimeHandle,
};
pub use stats::RelayStats;
pub use store::{MessageStore, PutOutcome, RelayRecord};
pub use types::{now_ms, DeviceId, MessageId, MessageKind, RelayStatus};
