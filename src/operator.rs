//! Operator service
//!
//! Everything the UI / CLI may do to a device or multicast-group. Each call is
//! authorized against the caller's [`Identity`] before it touches state; the work
//! itself is delegated to the pipelines.

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{require, Action, Identity, Target};
use crate::context::AppContext;
use crate::downlink::{DownlinkPipeline, Enqueue, QueueItem};
use crate::error::{Error, Result};
use crate::fcnt::FrameCounters;
use crate::framelog::{EventEntry, FrameEntry};
use crate::lorawan::keys::SessionKeys;
use crate::lorawan::{DevAddr, Eui64};
use crate::metrics::MetricsSnapshot;
use crate::multicast::{MulticastEngine, MulticastQueueEntry};
use crate::ns::{NsActivation, NsDevice};
use crate::storage::{Device, DeviceActivation, DeviceKeys, MulticastGroup};

/// ABP activation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateDevice {
    #[serde(default)]
    pub dev_eui: Eui64,
    /// Assigned by the network-server when absent.
    #[serde(default)]
    pub dev_addr: Option<DevAddr>,
    #[serde(flatten)]
    pub keys: SessionKeys,
    #[serde(flatten)]
    pub counters: FrameCounters,
    #[serde(default)]
    pub skip_fcnt_check: bool,
}

/// Per-field maximum; the network-server sees downlinks and uplinks the core does not.
fn merge_counters(stored: FrameCounters, ns: FrameCounters) -> FrameCounters {
    FrameCounters {
        f_cnt_up: stored.f_cnt_up.max(ns.f_cnt_up),
        n_f_cnt_down: stored.n_f_cnt_down.max(ns.n_f_cnt_down),
        a_f_cnt_down: stored.a_f_cnt_down.max(ns.a_f_cnt_down),
    }
}

fn ignore_missing(res: Result<()>) -> Result<()> {
    match res {
        Err(Error::NotFound(_)) | Err(Error::UnknownDevice(_)) => Ok(()),
        other => other,
    }
}

pub struct Operator {
    ctx: AppContext,
    downlink: DownlinkPipeline,
    multicast: MulticastEngine,
}

impl Operator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            downlink: DownlinkPipeline::new(ctx.clone()),
            multicast: MulticastEngine::new(ctx.clone()),
            ctx,
        }
    }

    async fn authorize(&self, identity: &Identity, action: Action, target: Target) -> Result<()> {
        require(&*self.ctx.authorizer, identity, action, target).await
    }

    fn ns_device(device: &Device, service_profile_id: Uuid) -> NsDevice {
        NsDevice {
            dev_eui: device.dev_eui,
            device_profile_id: device.device_profile_id,
            service_profile_id,
            skip_fcnt_check: device.skip_fcnt_check,
        }
    }

    /// Create the device locally and on the network-server of its device-profile.
    pub async fn create_device(&self, identity: &Identity, mut device: Device) -> Result<Device> {
        self.authorize(identity, Action::Create, Target::Application(device.application_id))
            .await?;
        let app = self.ctx.inventory.application(device.application_id).await?;
        let dp = self
            .ctx
            .inventory
            .device_profile(device.device_profile_id)
            .await?;
        let ns = self.ctx.network_server(dp.network_server_id).await?;

        let now = Utc::now();
        device.created_at = now;
        device.updated_at = now;
        device.last_seen_at = None;
        device.battery = None;
        device.margin = None;
        self.ctx.devices.create(device.clone()).await?;

        if let Err(e) = ns
            .create_device(&Self::ns_device(&device, app.service_profile_id))
            .await
        {
            warn!(dev_eui = %device.dev_eui, "network-server create failed, rolling back: {}", e);
            self.ctx.devices.delete(device.dev_eui).await?;
            return Err(e);
        }
        info!(dev_eui = %device.dev_eui, application_id = device.application_id, "device created");
        Ok(device)
    }

    pub async fn get_device(&self, identity: &Identity, dev_eui: Eui64) -> Result<Device> {
        self.authorize(identity, Action::Read, Target::Device(dev_eui))
            .await?;
        self.ctx.devices.get(dev_eui).await
    }

    /// Update name, description, profile and counter policy. Status fields are kept.
    pub async fn update_device(&self, identity: &Identity, device: Device) -> Result<Device> {
        self.authorize(identity, Action::Update, Target::Device(device.dev_eui))
            .await?;
        let existing = self.ctx.devices.get(device.dev_eui).await?;
        if existing.application_id != device.application_id {
            return Err(Error::InvalidArgument(
                "a device can not be moved to another application".into(),
            ));
        }
        let app = self.ctx.inventory.application(device.application_id).await?;
        let dp = self
            .ctx
            .inventory
            .device_profile(device.device_profile_id)
            .await?;
        let ns = self.ctx.network_server(dp.network_server_id).await?;

        let updated = Device {
            created_at: existing.created_at,
            last_seen_at: existing.last_seen_at,
            battery: existing.battery,
            margin: existing.margin,
            updated_at: Utc::now(),
            ..device
        };
        let _guard = self.ctx.device_locks.lock(&updated.dev_eui).await;
        ns.update_device(&Self::ns_device(&updated, app.service_profile_id))
            .await?;
        self.ctx.devices.update(updated.clone()).await?;
        info!(dev_eui = %updated.dev_eui, "device updated");
        Ok(updated)
    }

    /// Remove the device from the network-server, then everything held for it locally.
    pub async fn delete_device(&self, identity: &Identity, dev_eui: Eui64) -> Result<()> {
        self.authorize(identity, Action::Delete, Target::Device(dev_eui))
            .await?;
        let device = self.ctx.devices.get(dev_eui).await?;
        let ns = self.ctx.network_server_for_device(&device).await?;

        {
            let _guard = self.ctx.device_locks.lock(&dev_eui).await;
            ignore_missing(ns.delete_device(dev_eui).await)?;
            self.ctx.devices.delete(dev_eui).await?;
        }
        self.ctx.frame_log.remove(dev_eui);
        self.ctx.event_log().remove(dev_eui);
        self.ctx.device_locks.remove(&dev_eui);
        info!(dev_eui = %dev_eui, "device deleted");
        Ok(())
    }

    /// ABP: provision a session directly. Pending downlink mappings of the previous
    /// session are dropped.
    pub async fn activate_device(
        &self,
        identity: &Identity,
        req: ActivateDevice,
    ) -> Result<DeviceActivation> {
        self.authorize(identity, Action::Activate, Target::Device(req.dev_eui))
            .await?;
        let device = self.ctx.devices.get(req.dev_eui).await?;
        let dp = self
            .ctx
            .inventory
            .device_profile(device.device_profile_id)
            .await?;
        let ns = self.ctx.network_server(dp.network_server_id).await?;

        let dev_addr = match req.dev_addr {
            Some(addr) => addr,
            None => ns.get_random_dev_addr().await?,
        };

        let _guard = self.ctx.device_locks.lock(&req.dev_eui).await;
        ignore_missing(ns.deactivate_device(req.dev_eui).await)?;
        ns.activate_device(&NsActivation {
            dev_eui: req.dev_eui,
            dev_addr,
            mac_version: dp.mac_version,
            keys: req.keys.clone(),
            counters: req.counters,
            skip_fcnt_check: req.skip_fcnt_check,
        })
        .await?;

        let activation = self
            .ctx
            .activations
            .commit_activation(
                DeviceActivation {
                    id: 0,
                    dev_eui: req.dev_eui,
                    dev_addr,
                    keys: req.keys,
                    join_type: None,
                    join_eui: None,
                    dev_nonce: None,
                    join_nonce: None,
                    counters: req.counters,
                    created_at: Utc::now(),
                },
                req.skip_fcnt_check,
            )
            .await?;
        info!(
            dev_eui = %activation.dev_eui,
            dev_addr = %activation.dev_addr,
            "device activated (ABP)"
        );
        Ok(activation)
    }

    /// Latest activation, with frame-counters refreshed from the network-server when
    /// it can be reached.
    pub async fn get_activation(
        &self,
        identity: &Identity,
        dev_eui: Eui64,
    ) -> Result<DeviceActivation> {
        self.authorize(identity, Action::Read, Target::Device(dev_eui))
            .await?;
        let device = self.ctx.devices.get(dev_eui).await?;
        let mut activation = self
            .ctx
            .activations
            .latest_for(dev_eui)
            .await?
            .ok_or(Error::NoActivation(dev_eui))?;

        let remote = match self.ctx.network_server_for_device(&device).await {
            Ok(ns) => ns.get_device_activation(dev_eui).await,
            Err(e) => Err(e),
        };
        match remote {
            Ok(Some(ns)) if ns.dev_addr == activation.dev_addr => {
                activation.counters = merge_counters(activation.counters, ns.counters);
            }
            Ok(_) => {}
            Err(e) => warn!(dev_eui = %dev_eui, "using stored frame-counters: {}", e),
        }
        Ok(activation)
    }

    pub async fn get_keys(&self, identity: &Identity, dev_eui: Eui64) -> Result<DeviceKeys> {
        self.authorize(identity, Action::ReadKeys, Target::Device(dev_eui))
            .await?;
        self.ctx.keys.load(dev_eui).await
    }

    pub async fn update_keys(&self, identity: &Identity, keys: DeviceKeys) -> Result<()> {
        self.authorize(identity, Action::UpdateKeys, Target::Device(keys.dev_eui))
            .await?;
        self.ctx.devices.get(keys.dev_eui).await?;
        let dev_eui = keys.dev_eui;
        self.ctx.keys.provision(keys).await?;
        info!(dev_eui = %dev_eui, "device keys updated");
        Ok(())
    }

    pub async fn enqueue(&self, identity: &Identity, req: Enqueue) -> Result<u32> {
        self.authorize(identity, Action::Enqueue, Target::Device(req.dev_eui))
            .await?;
        self.downlink.enqueue(req).await
    }

    pub async fn flush_queue(&self, identity: &Identity, dev_eui: Eui64) -> Result<usize> {
        self.authorize(identity, Action::Flush, Target::Device(dev_eui))
            .await?;
        self.downlink.flush(dev_eui).await
    }

    pub async fn list_queue(&self, identity: &Identity, dev_eui: Eui64) -> Result<Vec<QueueItem>> {
        self.authorize(identity, Action::Read, Target::Device(dev_eui))
            .await?;
        self.downlink.list(dev_eui).await
    }

    pub async fn create_multicast_group(
        &self,
        identity: &Identity,
        group: MulticastGroup,
    ) -> Result<MulticastGroup> {
        let sp = self
            .ctx
            .inventory
            .service_profile(group.service_profile_id)
            .await?;
        self.authorize(identity, Action::Create, Target::Organization(sp.organization_id))
            .await?;
        self.multicast.create(group).await
    }

    pub async fn get_multicast_group(&self, identity: &Identity, id: Uuid) -> Result<MulticastGroup> {
        self.authorize(identity, Action::Read, Target::MulticastGroup(id))
            .await?;
        self.multicast.get(id).await
    }

    pub async fn update_multicast_group(
        &self,
        identity: &Identity,
        group: MulticastGroup,
    ) -> Result<MulticastGroup> {
        self.authorize(identity, Action::Update, Target::MulticastGroup(group.id))
            .await?;
        self.multicast.update(group).await
    }

    pub async fn delete_multicast_group(&self, identity: &Identity, id: Uuid) -> Result<()> {
        self.authorize(identity, Action::Delete, Target::MulticastGroup(id))
            .await?;
        self.multicast.delete(id).await
    }

    pub async fn add_device_to_multicast_group(
        &self,
        identity: &Identity,
        id: Uuid,
        dev_eui: Eui64,
    ) -> Result<()> {
        self.authorize(identity, Action::Update, Target::MulticastGroup(id))
            .await?;
        self.authorize(identity, Action::Read, Target::Device(dev_eui))
            .await?;
        self.multicast.add_device(id, dev_eui).await
    }

    pub async fn remove_device_from_multicast_group(
        &self,
        identity: &Identity,
        id: Uuid,
        dev_eui: Eui64,
    ) -> Result<()> {
        self.authorize(identity, Action::Update, Target::MulticastGroup(id))
            .await?;
        self.multicast.remove_device(id, dev_eui).await
    }

    pub async fn list_multicast_group_devices(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> Result<Vec<Eui64>> {
        self.authorize(identity, Action::Read, Target::MulticastGroup(id))
            .await?;
        self.multicast.list_devices(id).await
    }

    pub async fn enqueue_multicast(
        &self,
        identity: &Identity,
        id: Uuid,
        f_port: u8,
        data: &[u8],
    ) -> Result<u32> {
        self.authorize(identity, Action::Enqueue, Target::MulticastGroup(id))
            .await?;
        self.multicast.enqueue(id, f_port, data).await
    }

    pub async fn flush_multicast_queue(&self, identity: &Identity, id: Uuid) -> Result<()> {
        self.authorize(identity, Action::Flush, Target::MulticastGroup(id))
            .await?;
        self.multicast.flush_queue(id).await
    }

    pub async fn list_multicast_queue(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> Result<Vec<MulticastQueueEntry>> {
        self.authorize(identity, Action::Read, Target::MulticastGroup(id))
            .await?;
        self.multicast.list_queue(id).await
    }

    /// Frames seen by the pipelines merged with the network-server's raw frames.
    ///
    /// Falls back to the local log alone when the network-server stream can not be
    /// opened. Dropping the stream unsubscribes from both.
    pub async fn stream_frame_logs(
        &self,
        identity: &Identity,
        dev_eui: Eui64,
    ) -> Result<BoxStream<'static, FrameEntry>> {
        self.authorize(identity, Action::StreamLogs, Target::Device(dev_eui))
            .await?;
        let device = self.ctx.devices.get(dev_eui).await?;
        let local = self.ctx.frame_log.subscribe(dev_eui).into_stream();

        let remote = match self.ctx.network_server_for_device(&device).await {
            Ok(ns) => ns.stream_frame_logs(dev_eui).await,
            Err(e) => Err(e),
        };
        match remote {
            Ok(rx) => {
                let remote = ReceiverStream::new(rx).map(FrameEntry::from);
                Ok(futures::stream::select(local, remote).boxed())
            }
            Err(e) => {
                warn!(dev_eui = %dev_eui, "network-server frame stream unavailable: {}", e);
                Ok(local.boxed())
            }
        }
    }

    pub async fn stream_event_logs(
        &self,
        identity: &Identity,
        dev_eui: Eui64,
    ) -> Result<BoxStream<'static, EventEntry>> {
        self.authorize(identity, Action::StreamLogs, Target::Device(dev_eui))
            .await?;
        self.ctx.devices.get(dev_eui).await?;
        Ok(self.ctx.event_log().subscribe(dev_eui).into_stream().boxed())
    }

    pub async fn metrics(&self, identity: &Identity) -> Result<MetricsSnapshot> {
        self.authorize(identity, Action::Read, Target::Internal)
            .await?;
        Ok(self.ctx.metrics.snapshot())
    }
}
