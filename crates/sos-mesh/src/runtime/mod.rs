/// Relay runtime: wires store, neighbor table, router and gateway into a
/// live event loop.
///
/// One tokio task owns all relay state and processes inputs strictly one
/// at a time. Link sends and uploads run as spawned tasks and report back
/// through an internal channel, so a slow radio never blocks the pipeline.
/// The application talks to the loop through a [`RuntimeHandle`].
mod effect;
mod executor;
pub mod link;
mod r#loop;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::MeshError;
use crate::gateway::ExternalTransport;
use crate::journal::MessageJournal;
use crate::neighbor::NeighborEntry;
use crate::router::{DropReason, RoutingConfig};
use crate::stats::RelayStats;
use crate::store::{RelayRecord, DEFAULT_CAPACITY};
use crate::types::{
    now_ms, DeviceId, MessageId, MessageKind, DEFAULT_TTL_HOPS, DEFAULT_VALIDITY_MS,
    MAX_PAYLOAD_BYTES, MAX_VALIDITY_MS,
};

pub use link::LinkLayer;
use state::RelayState;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the relay runtime.
///
/// ```rust
/// use std::time::Duration;
/// use sos_mesh::RuntimeConfig;
///
/// let config = RuntimeConfig::new()
///     .ttl_hops(4)
///     .reroute_interval(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Hop budget for locally originated messages.
    pub ttl_hops: u8,
    /// Validity window for locally originated messages.
    pub validity: Duration,
    /// Longest window accepted: inbound frames expiring later than
    /// `now + max_validity` are malformed, local submissions are clamped.
    pub max_validity: Duration,
    /// Maximum records held in the store.
    pub store_capacity: usize,
    /// Largest payload accepted from the radio or the UI.
    pub max_payload: usize,
    /// Fan-out limits.
    pub routing: RoutingConfig,
    /// Neighbors silent this long go stale.
    pub liveness_window: Duration,
    /// Stale neighbors are removed after this much longer.
    pub stale_eviction: Duration,
    /// How often liveness is checked.
    pub liveness_interval: Duration,
    /// How often expired records are swept.
    pub sweep_interval: Duration,
    /// How often live records are re-routed to pick up new neighbors.
    pub reroute_interval: Duration,
    /// How often one-hop heartbeats go out.
    pub heartbeat_interval: Duration,
    /// How often the gateway retries pending uploads.
    pub gateway_interval: Duration,
    /// SQLite journal location. `None` keeps everything in memory.
    pub journal_path: Option<PathBuf>,
    /// Buffer size of the delivered/events channels.
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            ttl_hops: DEFAULT_TTL_HOPS,
            validity: Duration::from_millis(DEFAULT_VALIDITY_MS),
            max_validity: Duration::from_millis(MAX_VALIDITY_MS),
            store_capacity: DEFAULT_CAPACITY,
            max_payload: MAX_PAYLOAD_BYTES,
            routing: RoutingConfig::default(),
            liveness_window: Duration::from_secs(30),
            stale_eviction: Duration::from_secs(90),
            liveness_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            reroute_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(10),
            gateway_interval: Duration::from_secs(20),
            journal_path: None,
            channel_capacity: 1024,
        }
    }

    /// Defaults overridden by `SOS_MESH_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(v) = env_parse::<u8>("SOS_MESH_TTL_HOPS") {
            config.ttl_hops = v;
        }
        if let Some(v) = env_parse::<u64>("SOS_MESH_VALIDITY_SECS") {
            config.validity = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("SOS_MESH_MAX_VALIDITY_SECS") {
            config.max_validity = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("SOS_MESH_STORE_CAPACITY") {
            config.store_capacity = v;
        }
        if let Some(v) = env_parse::<usize>("SOS_MESH_SOS_FANOUT") {
            config.routing.sos_fanout_cap = v;
        }
        if let Some(v) = env_parse::<usize>("SOS_MESH_TEXT_FANOUT") {
            config.routing.text_fanout = v;
        }
        if let Some(v) = env_parse::<u64>("SOS_MESH_LIVENESS_SECS") {
            config.liveness_window = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("SOS_MESH_REROUTE_SECS") {
            config.reroute_interval = Duration::from_secs(v);
        }
        if let Ok(path) = std::env::var("SOS_MESH_JOURNAL") {
            if !path.is_empty() {
                config.journal_path = Some(PathBuf::from(path));
            }
        }
        config
    }

    pub fn ttl_hops(mut self, ttl_hops: u8) -> Self {
        self.ttl_hops = ttl_hops;
        self
    }

    pub fn validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn max_validity(mut self, max_validity: Duration) -> Self {
        self.max_validity = max_validity;
        self
    }

    pub fn store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = capacity;
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    pub fn stale_eviction(mut self, grace: Duration) -> Self {
        self.stale_eviction = grace;
        self
    }

    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn reroute_interval(mut self, interval: Duration) -> Self {
        self.reroute_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn gateway_interval(mut self, interval: Duration) -> Self {
        self.gateway_interval = interval;
        self
    }

    pub fn journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Inputs processed by the event loop, in arrival order.
pub(crate) enum RuntimeCommand {
    NeighborDiscovered { device_id: DeviceId, link_quality: u8 },
    NeighborConnected { device_id: DeviceId },
    NeighborLost { device_id: DeviceId },
    BytesReceived { from: DeviceId, bytes: Vec<u8> },
    ConnectivityGained,
    ConnectivityLost,
    SubmitLocal {
        kind: MessageKind,
        payload: Vec<u8>,
        ttl_hops: Option<u8>,
        validity: Option<Duration>,
        reply: oneshot::Sender<Result<MessageId, MeshError>>,
    },
    GetNeighbors {
        reply: oneshot::Sender<Vec<NeighborEntry>>,
    },
    GetRecord {
        id: MessageId,
        reply: oneshot::Sender<Option<RelayRecord>>,
    },
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// An SOS or TEXT handed to the local UI. Each id at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub id: MessageId,
    pub kind: MessageKind,
    pub origin_id: DeviceId,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub created_at: u64,
    /// Transmissions so far, as far as the (bounded) path hint knows.
    pub hops: usize,
}

/// Relay-level events the application may want to observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    NeighborDiscovered { device_id: DeviceId },
    NeighborConnected { device_id: DeviceId },
    NeighborStale { device_id: DeviceId },
    NeighborLost { device_id: DeviceId },
    /// A copy reached a neighbor.
    Forwarded { message_id: MessageId, to: DeviceId },
    /// A send failed; the neighbor stays eligible for a later retry.
    SendFailed {
        message_id: MessageId,
        to: DeviceId,
        reason: String,
    },
    /// The router refused a message for good.
    Dropped {
        message_id: MessageId,
        reason: DropReason,
    },
    /// Record's validity window closed.
    Expired { message_id: MessageId },
    /// Record dropped to make room.
    Evicted { message_id: MessageId },
    /// This device uploaded the message through its external transport.
    ExternallyDelivered { message_id: MessageId },
    /// A gateway somewhere confirmed one of *our* messages went out.
    ExternallyAcknowledged { message_id: MessageId },
    /// A neighbor keeps sending frames that fail to decode.
    MalformedFrom { device_id: DeviceId, count: u32 },
    /// Non-fatal runtime error.
    Error { description: String },
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to a running relay runtime.
///
/// Cheap to clone. Inputs are queued in order; a closed runtime yields
/// [`MeshError::RuntimeClosed`].
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    local_id: DeviceId,
    stats: Arc<RelayStats>,
}

impl RuntimeHandle {
    pub fn local_id(&self) -> DeviceId {
        self.local_id
    }

    async fn send(&self, cmd: RuntimeCommand) -> Result<(), MeshError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| MeshError::RuntimeClosed)
    }

    /// Discovery saw a device in radio range.
    pub async fn on_neighbor_discovered(
        &self,
        device_id: DeviceId,
        link_quality: u8,
    ) -> Result<(), MeshError> {
        self.send(RuntimeCommand::NeighborDiscovered {
            device_id,
            link_quality,
        })
        .await
    }

    /// The link layer brought up a connection on its own.
    pub async fn on_neighbor_connected(&self, device_id: DeviceId) -> Result<(), MeshError> {
        self.send(RuntimeCommand::NeighborConnected { device_id }).await
    }

    /// The device left range or the link closed.
    pub async fn on_neighbor_lost(&self, device_id: DeviceId) -> Result<(), MeshError> {
        self.send(RuntimeCommand::NeighborLost { device_id }).await
    }

    /// A raw frame arrived from `from`.
    pub async fn on_bytes_received(&self, from: DeviceId, bytes: Vec<u8>) -> Result<(), MeshError> {
        self.send(RuntimeCommand::BytesReceived { from, bytes }).await
    }

    /// Internet is reachable: start pushing to the external transport.
    pub async fn on_connectivity_gained(&self) -> Result<(), MeshError> {
        self.send(RuntimeCommand::ConnectivityGained).await
    }

    pub async fn on_connectivity_lost(&self) -> Result<(), MeshError> {
        self.send(RuntimeCommand::ConnectivityLost).await
    }

    /// Originate an SOS, TEXT or ACK with the configured hop budget and
    /// validity. Returns the new message id.
    pub async fn submit_local_message(
        &self,
        kind: MessageKind,
        payload: Vec<u8>,
    ) -> Result<MessageId, MeshError> {
        self.submit_local_message_with(kind, payload, None, None)
            .await
    }

    /// Like [`submit_local_message`](Self::submit_local_message) with an
    /// explicit hop budget and/or validity window.
    pub async fn submit_local_message_with(
        &self,
        kind: MessageKind,
        payload: Vec<u8>,
        ttl_hops: Option<u8>,
        validity: Option<Duration>,
    ) -> Result<MessageId, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(RuntimeCommand::SubmitLocal {
            kind,
            payload,
            ttl_hops,
            validity,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| MeshError::RuntimeClosed)?
    }

    /// Neighbor table, best link first.
    pub async fn neighbors(&self) -> Vec<NeighborEntry> {
        let (tx, rx) = oneshot::channel();
        if self
            .send(RuntimeCommand::GetNeighbors { reply: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Current relay record for `id`, if still stored.
    pub async fn record(&self, id: MessageId) -> Option<RelayRecord> {
        let (tx, rx) = oneshot::channel();
        self.send(RuntimeCommand::GetRecord { id, reply: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Snapshot of the relay counters.
    pub fn stats(&self) -> RelayStats {
        (*self.stats).clone()
    }

    /// Stop the event loop. Outstanding sends are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    pub handle: RuntimeHandle,
    /// SOS/TEXT messages for the local UI.
    pub delivered: mpsc::Receiver<DeliveredMessage>,
    pub events: mpsc::Receiver<MeshEvent>,
}

// ── RelayRuntime ─────────────────────────────────────────────────────

pub struct RelayRuntime;

impl RelayRuntime {
    /// Start the event loop on the current tokio runtime.
    ///
    /// Opens the journal (if configured) and restores unexpired records
    /// and the local sequence counter before accepting input.
    pub fn spawn<L, E>(
        local_id: DeviceId,
        link: L,
        external: E,
        config: RuntimeConfig,
    ) -> Result<RuntimeChannels, MeshError>
    where
        L: LinkLayer,
        E: ExternalTransport,
    {
        let journal = match &config.journal_path {
            Some(path) => Some(MessageJournal::open(path)?),
            None => None,
        };

        let stats = Arc::new(RelayStats::new());
        let mut state = RelayState::new(local_id, config.clone(), stats.clone());
        if let Some(journal) = &journal {
            let now = now_ms();
            journal.purge_expired(now)?;
            let records = journal.load_live(now)?;
            let sequence = journal.load_sequence()?;
            let restored = state.restore(records, sequence, now);
            tracing::info!(restored, sequence, "journal restored");
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (delivered_tx, delivered_rx) = mpsc::channel(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(config.channel_capacity);

        let executor = executor::Executor::new(
            Arc::new(link),
            Arc::new(external),
            journal,
            delivered_tx,
            event_tx,
            outcome_tx,
        );

        tokio::spawn(r#loop::runtime_loop(
            state, executor, config, cmd_rx, outcome_rx,
        ));

        Ok(RuntimeChannels {
            handle: RuntimeHandle {
                cmd_tx,
                local_id,
                stats,
            },
            delivered: delivered_rx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.ttl_hops, DEFAULT_TTL_HOPS);
        assert_eq!(config.routing.sos_fanout_cap, 8);
        assert_eq!(config.routing.text_fanout, 3);
        assert_eq!(config.liveness_window, Duration::from_secs(30));
        assert_eq!(config.max_validity, Duration::from_secs(24 * 60 * 60));
        assert!(config.journal_path.is_none());
    }

    #[test]
    fn config_builder_overrides() {
        let config = RuntimeConfig::new()
            .ttl_hops(2)
            .store_capacity(16)
            .channel_capacity(0)
            .journal_path("/tmp/mesh.db");
        assert_eq!(config.ttl_hops, 2);
        assert_eq!(config.store_capacity, 16);
        assert_eq!(config.channel_capacity, 1);
        assert_eq!(config.journal_path, Some(PathBuf::from("/tmp/mesh.db")));
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn submitted_sos_reaches_connected_neighbor() {
        let link = link::mock::MockLink::new();
        let external = crate::gateway::mock::MockExternal::new();
        let channels = RelayRuntime::spawn(
            DeviceId::from_bytes([0; 16]),
            link.clone(),
            external,
            RuntimeConfig::default(),
        )
        .unwrap();
        let handle = channels.handle.clone();
        let peer = DeviceId::from_bytes([1; 16]);

        handle.on_neighbor_connected(peer).await.unwrap();
        let id = handle
            .submit_local_message(MessageKind::Sos, b"help".to_vec())
            .await
            .unwrap();

        wait_for(|| {
            let handle = handle.clone();
            async move {
                handle
                    .record(id)
                    .await
                    .is_some_and(|r| r.forwarded_to.contains(&peer))
            }
        })
        .await;
        assert_eq!(link.sent_to(&peer), 1);
        assert_eq!(handle.stats().forwarded.get(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn discovery_connects_through_link() {
        let link = link::mock::MockLink::new();
        let channels = RelayRuntime::spawn(
            DeviceId::from_bytes([0; 16]),
            link.clone(),
            crate::gateway::NoExternal,
            RuntimeConfig::default(),
        )
        .unwrap();
        let handle = channels.handle.clone();
        let peer = DeviceId::from_bytes([2; 16]);

        handle.on_neighbor_discovered(peer, 6).await.unwrap();
        wait_for(|| {
            let handle = handle.clone();
            async move {
                handle
                    .neighbors()
                    .await
                    .iter()
                    .any(|n| n.device_id == peer && n.state == crate::neighbor::NeighborState::Connected)
            }
        })
        .await;
        assert_eq!(link.connects(), vec![peer]);
    }

    #[tokio::test]
    async fn gateway_acknowledges_own_message() {
        let link = link::mock::MockLink::new();
        let external = crate::gateway::mock::MockExternal::new();
        let mut channels = RelayRuntime::spawn(
            DeviceId::from_bytes([0; 16]),
            link,
            external.clone(),
            RuntimeConfig::default(),
        )
        .unwrap();
        let handle = channels.handle.clone();

        let id = handle
            .submit_local_message(MessageKind::Text, b"we are safe".to_vec())
            .await
            .unwrap();
        handle.on_connectivity_gained().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match channels.events.recv().await {
                    Some(MeshEvent::ExternallyAcknowledged { message_id }) => break message_id,
                    Some(_) => continue,
                    None => panic!("events closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, id);
        assert_eq!(external.sent(), vec![id]);
    }

    #[tokio::test]
    async fn closed_runtime_reports_error() {
        let channels = RelayRuntime::spawn(
            DeviceId::from_bytes([0; 16]),
            link::mock::MockLink::new(),
            crate::gateway::NoExternal,
            RuntimeConfig::default(),
        )
        .unwrap();
        let handle = channels.handle.clone();
        handle.shutdown().await;
        wait_for(|| {
            let handle = handle.clone();
            async move {
                handle
                    .on_neighbor_lost(DeviceId::from_bytes([1; 16]))
                    .await
                    .is_err()
            }
        })
        .await;
        assert!(matches!(
            handle.submit_local_message(MessageKind::Sos, Vec::new()).await,
            Err(MeshError::RuntimeClosed)
        ));
    }

    #[test]
    fn env_parse_ignores_garbage() {
        std::env::set_var("SOS_MESH_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse::<u8>("SOS_MESH_TEST_GARBAGE"), None);
        std::env::set_var("SOS_MESH_TEST_GOOD", "7");
        assert_eq!(env_parse::<u8>("SOS_MESH_TEST_GOOD"), Some(7));
        assert_eq!(env_parse::<u8>("SOS_MESH_TEST_UNSET"), None);
    }
}
