//! In-memory radio shared by every simulated device.
//!
//! Frames travel only between linked devices and are dropped with a fixed
//! probability. Delivery goes straight into the receiver's runtime handle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sos_mesh::{DeviceId, LinkLayer, MeshError, RuntimeHandle};

pub struct Radio {
    handles: Mutex<HashMap<DeviceId, RuntimeHandle>>,
    links: Mutex<HashSet<(DeviceId, DeviceId)>>,
    loss: f64,
    rng: Mutex<StdRng>,
    pub frames_sent: AtomicU64,
    pub frames_lost: AtomicU64,
}

impl Radio {
    pub fn new(loss: f64, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            handles: Mutex::new(HashMap::new()),
            links: Mutex::new(HashSet::new()),
            loss: loss.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            frames_sent: AtomicU64::new(0),
            frames_lost: AtomicU64::new(0),
        })
    }

    pub fn attach(&self, handle: RuntimeHandle) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(handle.local_id(), handle);
        }
    }

    pub fn link(&self, a: DeviceId, b: DeviceId) {
        if let Ok(mut links) = self.links.lock() {
            links.insert((a, b));
            links.insert((b, a));
        }
    }

    pub fn in_range(&self, a: DeviceId, b: DeviceId) -> bool {
        self.links
            .lock()
            .map(|links| links.contains(&(a, b)))
            .unwrap_or(false)
    }

    fn roll_loss(&self) -> bool {
        if self.loss <= 0.0 {
            return false;
        }
        self.rng
            .lock()
            .map(|mut rng| rng.random::<f64>() < self.loss)
            .unwrap_or(false)
    }

    fn handle(&self, id: &DeviceId) -> Option<RuntimeHandle> {
        self.handles.lock().ok()?.get(id).cloned()
    }
}

/// One device's view of the radio.
pub struct RadioLink {
    pub me: DeviceId,
    pub radio: Arc<Radio>,
}

fn out_of_range(to: DeviceId, reason: &str) -> MeshError {
    MeshError::TransientLink {
        device_id: to.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait::async_trait]
impl LinkLayer for RadioLink {
    async fn send(&self, to: DeviceId, frame: &[u8]) -> Result<(), MeshError> {
        if !self.radio.in_range(self.me, to) {
            return Err(out_of_range(to, "out of range"));
        }
        self.radio.frames_sent.fetch_add(1, Ordering::Relaxed);
        if self.radio.roll_loss() {
            self.radio.frames_lost.fetch_add(1, Ordering::Relaxed);
            return Err(out_of_range(to, "frame lost"));
        }
        let handle = self
            .radio
            .handle(&to)
            .ok_or_else(|| out_of_range(to, "no such device"))?;
        handle.on_bytes_received(self.me, frame.to_vec()).await
    }

    async fn connect(&self, to: DeviceId) -> Result<(), MeshError> {
        if self.radio.in_range(self.me, to) {
            Ok(())
        } else {
            Err(out_of_range(to, "out of range"))
        }
    }
}
