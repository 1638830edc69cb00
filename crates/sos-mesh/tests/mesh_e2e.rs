/// Multi-device runs: several relay runtimes wired together through an
/// in-memory radio.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sos_mesh::{
    DeliveredMessage, DeviceId, ExternalTransport, LinkLayer, MeshError, MeshEvent, Message,
    MessageKind, NoExternal, RelayRuntime, RuntimeChannels, RuntimeConfig, RuntimeHandle,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct Radio {
    handles: Mutex<HashMap<DeviceId, RuntimeHandle>>,
    links: Mutex<HashSet<(DeviceId, DeviceId)>>,
}

impl Radio {
    fn link(&self, a: DeviceId, b: DeviceId) {
        let mut links = self.links.lock().unwrap();
        links.insert((a, b));
        links.insert((b, a));
    }

    fn in_range(&self, a: DeviceId, b: DeviceId) -> bool {
        self.links.lock().unwrap().contains(&(a, b))
    }
}

struct RadioLink {
    me: DeviceId,
    radio: Arc<Radio>,
}

#[async_trait::async_trait]
impl LinkLayer for RadioLink {
    async fn send(&self, to: DeviceId, frame: &[u8]) -> Result<(), MeshError> {
        if !self.radio.in_range(self.me, to) {
            return Err(MeshError::TransientLink {
                device_id: to.to_string(),
                reason: "out of range".into(),
            });
        }
        let handle = self.radio.handles.lock().unwrap().get(&to).cloned();
        match handle {
            Some(h) => h.on_bytes_received(self.me, frame.to_vec()).await,
            None => Err(MeshError::RuntimeClosed),
        }
    }

    async fn connect(&self, to: DeviceId) -> Result<(), MeshError> {
        if self.radio.in_range(self.me, to) {
            Ok(())
        } else {
            Err(MeshError::TransientLink {
                device_id: to.to_string(),
                reason: "out of range".into(),
            })
        }
    }
}

#[derive(Clone, Default)]
struct RecordingUplink {
    sent: Arc<Mutex<Vec<Message>>>,
}

#[async_trait::async_trait]
impl ExternalTransport for RecordingUplink {
    async fn send_external(&self, message: &Message) -> Result<(), MeshError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn config() -> RuntimeConfig {
    init_tracing();
    RuntimeConfig::new().reroute_interval(Duration::from_millis(100))
}

fn spawn<E: ExternalTransport>(
    radio: &Arc<Radio>,
    name: &str,
    external: E,
    config: RuntimeConfig,
) -> RuntimeChannels {
    let id = DeviceId::from_name(name);
    let link = RadioLink {
        me: id,
        radio: radio.clone(),
    };
    let channels = RelayRuntime::spawn(id, link, external, config).unwrap();
    radio
        .handles
        .lock()
        .unwrap()
        .insert(id, channels.handle.clone());
    channels
}

/// Link consecutive devices and tell both ends.
async fn wire_line(radio: &Arc<Radio>, nodes: &[&RuntimeChannels]) {
    for pair in nodes.windows(2) {
        let (a, b) = (pair[0].handle.local_id(), pair[1].handle.local_id());
        radio.link(a, b);
        pair[0].handle.on_neighbor_connected(b).await.unwrap();
        pair[1].handle.on_neighbor_connected(a).await.unwrap();
    }
}

async fn recv_delivered(rx: &mut mpsc::Receiver<DeliveredMessage>) -> Option<DeliveredMessage> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn sos_crosses_a_line_of_four() {
    let radio = Arc::new(Radio::default());
    let a = spawn(&radio, "A", NoExternal, config());
    let b = spawn(&radio, "B", NoExternal, config());
    let c = spawn(&radio, "C", NoExternal, config());
    let mut d = spawn(&radio, "D", NoExternal, config());
    wire_line(&radio, &[&a, &b, &c, &d]).await;

    let id = a
        .handle
        .submit_local_message(MessageKind::Sos, b"lat=45.18,lon=5.72".to_vec())
        .await
        .unwrap();

    let got = recv_delivered(&mut d.delivered).await.expect("D got the SOS");
    assert_eq!(got.id, id);
    assert_eq!(got.origin_id, a.handle.local_id());
    assert_eq!(got.hops, 3);
    assert_eq!(got.payload, b"lat=45.18,lon=5.72");
}

#[tokio::test]
async fn ttl_bounds_propagation() {
    let radio = Arc::new(Radio::default());
    let a = spawn(&radio, "A", NoExternal, config());
    let mut b = spawn(&radio, "B", NoExternal, config());
    let mut c = spawn(&radio, "C", NoExternal, config());
    let mut d = spawn(&radio, "D", NoExternal, config());
    wire_line(&radio, &[&a, &b, &c, &d]).await;

    a.handle
        .submit_local_message_with(MessageKind::Text, b"ping".to_vec(), Some(2), None)
        .await
        .unwrap();

    assert!(recv_delivered(&mut b.delivered).await.is_some());
    assert!(recv_delivered(&mut c.delivered).await.is_some());
    let late = tokio::time::timeout(Duration::from_millis(500), d.delivered.recv()).await;
    assert!(late.is_err(), "D is three hops away with a two-hop budget");
}

#[tokio::test]
async fn late_neighbor_still_gets_pending_sos() {
    let radio = Arc::new(Radio::default());
    let a = spawn(&radio, "A", NoExternal, config());
    let mut b = spawn(&radio, "B", NoExternal, config());

    let id = a
        .handle
        .submit_local_message(MessageKind::Sos, b"help".to_vec())
        .await
        .unwrap();

    // B walks into range afterwards.
    wire_line(&radio, &[&a, &b]).await;
    let got = recv_delivered(&mut b.delivered).await.expect("delivered on reconnect");
    assert_eq!(got.id, id);
}

#[tokio::test]
async fn gateway_delivery_acknowledged_to_origin() {
    let radio = Arc::new(Radio::default());
    let uplink = RecordingUplink::default();
    let mut a = spawn(&radio, "A", NoExternal, config());
    let b = spawn(&radio, "B", NoExternal, config());
    let gw = spawn(&radio, "GW", uplink.clone(), config());
    wire_line(&radio, &[&a, &b, &gw]).await;
    gw.handle.on_connectivity_gained().await.unwrap();

    let id = a
        .handle
        .submit_local_message(MessageKind::Sos, b"injured, need evac".to_vec())
        .await
        .unwrap();

    let acked = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match a.events.recv().await {
                Some(MeshEvent::ExternallyAcknowledged { message_id }) => break message_id,
                Some(_) => continue,
                None => panic!("events closed"),
            }
        }
    })
    .await
    .expect("origin learned of external delivery");

    assert_eq!(acked, id);
    let sent: Vec<_> = uplink.sent.lock().unwrap().iter().map(|m| m.id).collect();
    assert_eq!(sent, vec![id]);
}

#[tokio::test]
async fn every_device_delivers_once() {
    let radio = Arc::new(Radio::default());
    let a = spawn(&radio, "A", NoExternal, config());
    let mut b = spawn(&radio, "B", NoExternal, config());
    let mut c = spawn(&radio, "C", NoExternal, config());
    // Triangle: B hears the SOS from both A and C.
    wire_line(&radio, &[&a, &b, &c]).await;
    radio.link(a.handle.local_id(), c.handle.local_id());
    a.handle.on_neighbor_connected(c.handle.local_id()).await.unwrap();
    c.handle.on_neighbor_connected(a.handle.local_id()).await.unwrap();

    let id = a
        .handle
        .submit_local_message(MessageKind::Sos, b"help".to_vec())
        .await
        .unwrap();

    assert_eq!(recv_delivered(&mut b.delivered).await.map(|m| m.id), Some(id));
    assert_eq!(recv_delivered(&mut c.delivered).await.map(|m| m.id), Some(id));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.delivered.try_recv().is_err());
    assert!(c.delivered.try_recv().is_err());
    assert_eq!(b.handle.stats().delivered_local.get(), 1);
}
