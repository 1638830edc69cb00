use crate::message::Message;
use crate::store::RelayRecord;
use crate::types::{DeviceId, MessageId};

use super::{DeliveredMessage, MeshEvent};

/// Intention produced by the pure [`RelayState`](super::state::RelayState).
///
/// Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`; the
/// executor turns them into link sends, uploads, channel sends and journal
/// writes.
#[derive(Debug)]
pub(crate) enum RuntimeEffect {
    /// Ship a frame to one neighbor. `track` names the record whose
    /// in-flight slot the outcome settles (heartbeats are untracked).
    SendFrame {
        to: DeviceId,
        frame: Vec<u8>,
        track: Option<MessageId>,
    },

    /// Ask the link layer to connect to a discovered neighbor.
    Connect(DeviceId),

    /// Push a message through the external transport.
    SendExternal(Message),

    /// Hand a message to the local UI.
    Deliver(DeliveredMessage),

    /// Notify the application.
    Emit(MeshEvent),

    /// Write a record to the journal.
    Persist(RelayRecord),

    /// Delete a record from the journal.
    Forget(MessageId),

    /// Persist the local sequence counter.
    PersistSequence(u64),
}

/// Completion of a spawned task, fed back into the loop.
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Sent {
        to: DeviceId,
        track: Option<MessageId>,
        result: Result<(), String>,
    },
    Connected {
        device_id: DeviceId,
        result: Result<(), String>,
    },
    Uploaded {
        message_id: MessageId,
        result: Result<(), String>,
    },
}
