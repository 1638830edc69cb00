//! Scenario runner: spawns one relay runtime per device, wires them to the
//! shared radio, injects SOS messages and measures how far they get.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sos_mesh::{
    DeviceId, ExternalTransport, MeshError, MeshEvent, Message, MessageId, MessageKind,
    NoExternal, RelayRuntime, RuntimeChannels, RuntimeConfig, RuntimeHandle,
};
use tokio::sync::mpsc;

use crate::output::{self, EventDelivered, EventExternal, EventStarted, EventSummary};
use crate::radio::{Radio, RadioLink};
use crate::topology::Topology;

pub struct SimConfig {
    pub scenario: String,
    pub topology: Topology,
    pub ttl: u8,
    pub loss: f64,
    pub seed: u64,
    pub duration: Duration,
    /// Number of SOS messages to inject.
    pub messages: usize,
    /// Fixed origin; random devices when `None`.
    pub origin: Option<usize>,
    /// Device with internet access, if any.
    pub gateway: Option<usize>,
}

#[derive(Clone, Default)]
struct SimUplink {
    uploads: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ExternalTransport for SimUplink {
    async fn send_external(&self, message: &Message) -> Result<(), MeshError> {
        let n = self.uploads.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(id = %message.id, kind = ?message.kind, uploads = n, "uploaded");
        Ok(())
    }
}

enum Observation {
    Delivered {
        node: usize,
        id: MessageId,
        hops: usize,
    },
    Acknowledged {
        id: MessageId,
    },
}

fn runtime_config(ttl: u8) -> RuntimeConfig {
    RuntimeConfig::new()
        .ttl_hops(ttl)
        .reroute_interval(Duration::from_millis(200))
        .heartbeat_interval(Duration::from_secs(1))
        .liveness_interval(Duration::from_secs(1))
        .liveness_window(Duration::from_secs(5))
        .gateway_interval(Duration::from_millis(500))
}

pub async fn run(config: SimConfig) -> anyhow::Result<EventSummary> {
    let start = Instant::now();
    let topo = &config.topology;
    anyhow::ensure!(topo.nodes >= 2, "need at least two devices");

    output::emit(&EventStarted {
        event: "started",
        scenario: config.scenario.clone(),
        nodes: topo.nodes,
        edges: topo.edges.len(),
        max_degree: (0..topo.nodes).map(|n| topo.degree(n)).max().unwrap_or(0),
        loss: config.loss,
        seed: config.seed,
    });

    let radio = Radio::new(config.loss, config.seed);
    let uplink = SimUplink::default();
    let (obs_tx, mut obs_rx) = mpsc::channel::<Observation>(4096);

    // ── Devices ─────────────────────────────────────────────────────
    let mut handles: Vec<RuntimeHandle> = Vec::with_capacity(topo.nodes);
    for node in 0..topo.nodes {
        let id = DeviceId::from_name(&format!("node-{node}"));
        let link = RadioLink {
            me: id,
            radio: radio.clone(),
        };
        let channels = if config.gateway == Some(node) {
            RelayRuntime::spawn(id, link, uplink.clone(), runtime_config(config.ttl))?
        } else {
            RelayRuntime::spawn(id, link, NoExternal, runtime_config(config.ttl))?
        };
        radio.attach(channels.handle.clone());
        handles.push(channels.handle.clone());
        observe(node, channels, obs_tx.clone());
    }
    drop(obs_tx);

    // ── Radio range ─────────────────────────────────────────────────
    let mut rng = StdRng::seed_from_u64(config.seed);
    for &(a, b) in &topo.edges {
        let (ida, idb) = (handles[a].local_id(), handles[b].local_id());
        radio.link(ida, idb);
        let quality: u8 = rng.random_range(1..=10);
        handles[a].on_neighbor_discovered(idb, quality).await?;
        handles[b].on_neighbor_discovered(ida, quality).await?;
    }
    if let Some(gw) = config.gateway {
        handles[gw].on_connectivity_gained().await?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // ── Inject ──────────────────────────────────────────────────────
    let mut origins: HashMap<MessageId, usize> = HashMap::new();
    for k in 0..config.messages {
        let origin = config
            .origin
            .unwrap_or_else(|| rng.random_range(0..topo.nodes));
        let payload = format!("SOS #{k} from node-{origin}").into_bytes();
        let id = handles[origin]
            .submit_local_message(MessageKind::Sos, payload)
            .await?;
        tracing::info!(%id, origin, "injected");
        origins.insert(id, origin);
    }

    // ── Observe ─────────────────────────────────────────────────────
    let expected = config.messages * (topo.nodes - 1);
    let mut delivered: HashSet<(usize, MessageId)> = HashSet::new();
    let mut acknowledged: HashSet<MessageId> = HashSet::new();
    let mut max_hops = 0;
    let deadline = tokio::time::Instant::now() + config.duration;

    loop {
        let done = delivered.len() >= expected
            && (config.gateway.is_none() || acknowledged.len() >= origins.len());
        if done {
            break;
        }
        let obs = match tokio::time::timeout_at(deadline, obs_rx.recv()).await {
            Ok(Some(obs)) => obs,
            Ok(None) | Err(_) => break,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match obs {
            Observation::Delivered { node, id, hops } => {
                if origins.contains_key(&id) && delivered.insert((node, id)) {
                    max_hops = max_hops.max(hops);
                    output::emit(&EventDelivered {
                        event: "delivered",
                        node,
                        message_id: id.short(),
                        hops,
                        elapsed_ms,
                    });
                }
            }
            Observation::Acknowledged { id } => {
                if acknowledged.insert(id) {
                    output::emit(&EventExternal {
                        event: "external_ack",
                        message_id: id.short(),
                        acknowledged_at_origin: true,
                        elapsed_ms,
                    });
                }
            }
        }
    }

    // ── Summary ─────────────────────────────────────────────────────
    let duplicates = handles.iter().map(|h| h.stats().duplicates.get()).sum();
    for handle in &handles {
        handle.shutdown().await;
    }

    Ok(EventSummary {
        event: "summary",
        scenario: config.scenario,
        messages: config.messages,
        expected_deliveries: expected,
        deliveries: delivered.len(),
        delivery_ratio: if expected == 0 {
            1.0
        } else {
            delivered.len() as f64 / expected as f64
        },
        max_hops,
        frames_sent: radio.frames_sent.load(Ordering::Relaxed),
        frames_lost: radio.frames_lost.load(Ordering::Relaxed),
        duplicates,
        externally_delivered: uplink.uploads.load(Ordering::Relaxed),
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Forward a device's deliveries and acknowledgements to the collector.
fn observe(node: usize, channels: RuntimeChannels, tx: mpsc::Sender<Observation>) {
    let RuntimeChannels {
        mut delivered,
        mut events,
        ..
    } = channels;

    let delivered_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(msg) = delivered.recv().await {
            let obs = Observation::Delivered {
                node,
                id: msg.id,
                hops: msg.hops,
            };
            if delivered_tx.send(obs).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MeshEvent::ExternallyAcknowledged { message_id } => {
                    if tx
                        .send(Observation::Acknowledged { id: message_id })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                MeshEvent::MalformedFrom { device_id, count } => {
                    tracing::warn!(node, peer = %device_id, count, "malformed frames");
                }
                other => tracing::trace!(node, ?other, "mesh event"),
            }
        }
    });
}
