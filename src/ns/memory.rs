//! In-memory network-server.
//!
//! Keeps whatever the core pushes so tests (and single-process deployments without a
//! network-server) can observe it. Can be switched to an unavailable state to
//! exercise error paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::*;
use crate::error::Error;
use crate::lorawan::NetId;

const FRAME_LOG_BUFFER: usize = 64;

#[derive(Default)]
struct State {
    devices: HashMap<Eui64, NsDevice>,
    activations: HashMap<Eui64, NsActivation>,
    queues: HashMap<Eui64, Vec<DeviceQueueItem>>,
    groups: HashMap<Uuid, NsMulticastGroup>,
    members: HashMap<Uuid, BTreeSet<Eui64>>,
    multicast_queues: HashMap<Uuid, Vec<MulticastQueueItem>>,
    subscribers: HashMap<Eui64, Vec<mpsc::Sender<FrameLog>>>,
}

pub struct InMemoryNetworkServer {
    net_id: NetId,
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryNetworkServer {
    pub fn new(net_id: NetId) -> Self {
        Self {
            net_id,
            state: Mutex::new(State::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with `NetworkServerUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::NetworkServerUnavailable(
                "in-memory network-server switched off".into(),
            ));
        }
        Ok(())
    }

    pub fn device(&self, dev_eui: Eui64) -> Option<NsDevice> {
        self.state.lock().devices.get(&dev_eui).cloned()
    }

    pub fn activation(&self, dev_eui: Eui64) -> Option<NsActivation> {
        self.state.lock().activations.get(&dev_eui).cloned()
    }

    pub fn device_queue(&self, dev_eui: Eui64) -> Vec<DeviceQueueItem> {
        self.state
            .lock()
            .queues
            .get(&dev_eui)
            .cloned()
            .unwrap_or_default()
    }

    pub fn multicast_group(&self, id: Uuid) -> Option<NsMulticastGroup> {
        self.state.lock().groups.get(&id).cloned()
    }

    pub fn multicast_members(&self, id: Uuid) -> Vec<Eui64> {
        self.state
            .lock()
            .members
            .get(&id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn multicast_queue(&self, id: Uuid) -> Vec<MulticastQueueItem> {
        self.state
            .lock()
            .multicast_queues
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Hand a frame to every live `stream_frame_logs` subscriber of its device.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish_frame(&self, frame: FrameLog) -> usize {
        let mut state = self.state.lock();
        let Some(subs) = state.subscribers.get_mut(&frame.dev_eui) else {
            return 0;
        };
        subs.retain(|tx| !tx.is_closed());
        subs.iter()
            .filter(|tx| tx.try_send(frame.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl NetworkServer for InMemoryNetworkServer {
    async fn create_device(&self, device: &NsDevice) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        if state.devices.contains_key(&device.dev_eui) {
            return Err(Error::AlreadyExists(format!("device {}", device.dev_eui)));
        }
        state.devices.insert(device.dev_eui, device.clone());
        Ok(())
    }

    async fn update_device(&self, device: &NsDevice) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        match state.devices.get_mut(&device.dev_eui) {
            Some(d) => {
                *d = device.clone();
                Ok(())
            }
            None => Err(Error::UnknownDevice(device.dev_eui)),
        }
    }

    async fn delete_device(&self, dev_eui: Eui64) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.devices.remove(&dev_eui);
        state.activations.remove(&dev_eui);
        state.queues.remove(&dev_eui);
        for m in state.members.values_mut() {
            m.remove(&dev_eui);
        }
        Ok(())
    }

    async fn activate_device(&self, activation: &NsActivation) -> Result<()> {
        self.check()?;
        debug!(dev_eui = %activation.dev_eui, dev_addr = %activation.dev_addr, "activate");
        let mut state = self.state.lock();
        state.queues.remove(&activation.dev_eui);
        state
            .activations
            .insert(activation.dev_eui, activation.clone());
        Ok(())
    }

    async fn deactivate_device(&self, dev_eui: Eui64) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.activations.remove(&dev_eui);
        state.queues.remove(&dev_eui);
        Ok(())
    }

    async fn get_device_activation(&self, dev_eui: Eui64) -> Result<Option<NsActivation>> {
        self.check()?;
        Ok(self.state.lock().activations.get(&dev_eui).cloned())
    }

    async fn create_device_queue_item(&self, item: &DeviceQueueItem) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let queue = state.queues.entry(item.dev_eui).or_default();
        if queue.iter().any(|i| i.f_cnt == item.f_cnt) {
            return Err(Error::AlreadyExists(format!(
                "queue item {}/{}",
                item.dev_eui, item.f_cnt
            )));
        }
        queue.push(item.clone());
        Ok(())
    }

    async fn flush_device_queue(&self, dev_eui: Eui64) -> Result<()> {
        self.check()?;
        self.state.lock().queues.remove(&dev_eui);
        Ok(())
    }

    async fn get_device_queue_items(&self, dev_eui: Eui64) -> Result<Vec<DeviceQueueItem>> {
        self.check()?;
        Ok(self.device_queue(dev_eui))
    }

    async fn create_multicast_group(&self, group: &NsMulticastGroup) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.members.entry(group.id).or_default();
        state.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn update_multicast_group(&self, group: &NsMulticastGroup) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        match state.groups.get_mut(&group.id) {
            Some(g) => {
                *g = group.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!("multicast-group {}", group.id))),
        }
    }

    async fn delete_multicast_group(&self, id: Uuid) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.groups.remove(&id);
        state.members.remove(&id);
        state.multicast_queues.remove(&id);
        Ok(())
    }

    async fn add_device_to_multicast_group(&self, id: Uuid, dev_eui: Eui64) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .members
            .entry(id)
            .or_default()
            .insert(dev_eui);
        Ok(())
    }

    async fn remove_device_from_multicast_group(&self, id: Uuid, dev_eui: Eui64) -> Result<()> {
        self.check()?;
        if let Some(m) = self.state.lock().members.get_mut(&id) {
            m.remove(&dev_eui);
        }
        Ok(())
    }

    async fn enqueue_multicast_queue_item(&self, item: &MulticastQueueItem) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .multicast_queues
            .entry(item.multicast_group_id)
            .or_default()
            .push(item.clone());
        Ok(())
    }

    async fn flush_multicast_queue(&self, id: Uuid) -> Result<()> {
        self.check()?;
        self.state.lock().multicast_queues.remove(&id);
        Ok(())
    }

    async fn get_multicast_queue_items(&self, id: Uuid) -> Result<Vec<MulticastQueueItem>> {
        self.check()?;
        Ok(self.multicast_queue(id))
    }

    async fn get_random_dev_addr(&self) -> Result<DevAddr> {
        self.check()?;
        let random = Uuid::new_v4();
        let b = random.as_bytes();
        Ok(DevAddr([b[0], b[1], b[2], b[3]]).with_net_id_prefix(self.net_id))
    }

    async fn stream_frame_logs(&self, dev_eui: Eui64) -> Result<mpsc::Receiver<FrameLog>> {
        self.check()?;
        let (tx, rx) = mpsc::channel(FRAME_LOG_BUFFER);
        self.state
            .lock()
            .subscribers
            .entry(dev_eui)
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
