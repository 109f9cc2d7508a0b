//! Network-server client port
//!
//! The core reaches network-servers only through [`NetworkServer`]. Clients are
//! obtained from a [`pool::NetworkServerPool`]; the JSON/HTTP client lives in
//! [`http`], a recording in-memory implementation in [`memory`].

#[cfg(feature = "ns-http")]
pub mod http;
pub mod memory;
pub mod pool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::encoding::base64_bytes;
use crate::error::Result;
use crate::fcnt::FrameCounters;
use crate::lorawan::keys::SessionKeys;
use crate::lorawan::{Aes128Key, DevAddr, Eui64, MacVersion};
use crate::storage::MulticastGroupType;

/// Device as known by the network-server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NsDevice {
    pub dev_eui: Eui64,
    pub device_profile_id: Uuid,
    pub service_profile_id: Uuid,
    pub skip_fcnt_check: bool,
}

/// Session state pushed to (or read back from) the network-server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NsActivation {
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub mac_version: MacVersion,
    #[serde(flatten)]
    pub keys: SessionKeys,
    #[serde(flatten)]
    pub counters: FrameCounters,
    pub skip_fcnt_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceQueueItem {
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    /// Encrypted FRMPayload.
    #[serde(with = "base64_bytes")]
    pub frm_payload: Vec<u8>,
    pub f_cnt: u32,
    pub f_port: u8,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NsMulticastGroup {
    pub id: Uuid,
    pub service_profile_id: Uuid,
    pub mc_addr: DevAddr,
    pub mc_nwk_s_key: Aes128Key,
    pub f_cnt: u32,
    pub group_type: MulticastGroupType,
    pub dr: u8,
    pub frequency: u32,
    pub ping_slot_period: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastQueueItem {
    pub multicast_group_id: Uuid,
    #[serde(with = "base64_bytes")]
    pub frm_payload: Vec<u8>,
    pub f_cnt: u32,
    pub f_port: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDirection {
    Uplink,
    Downlink,
}

/// A raw frame as observed by the network-server, for live debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameLog {
    pub dev_eui: Eui64,
    pub direction: FrameDirection,
    #[serde(with = "base64_bytes")]
    pub phy_payload: Vec<u8>,
    #[serde(default)]
    pub tx_info: serde_json::Value,
    #[serde(default)]
    pub rx_info: Vec<serde_json::Value>,
    pub observed_at: DateTime<Utc>,
}

#[async_trait]
pub trait NetworkServer: Send + Sync {
    async fn create_device(&self, device: &NsDevice) -> Result<()>;
    async fn update_device(&self, device: &NsDevice) -> Result<()>;
    async fn delete_device(&self, dev_eui: Eui64) -> Result<()>;

    async fn activate_device(&self, activation: &NsActivation) -> Result<()>;
    async fn deactivate_device(&self, dev_eui: Eui64) -> Result<()>;
    /// `None` when the network-server holds no session for the device.
    async fn get_device_activation(&self, dev_eui: Eui64) -> Result<Option<NsActivation>>;

    async fn create_device_queue_item(&self, item: &DeviceQueueItem) -> Result<()>;
    async fn flush_device_queue(&self, dev_eui: Eui64) -> Result<()>;
    async fn get_device_queue_items(&self, dev_eui: Eui64) -> Result<Vec<DeviceQueueItem>>;

    async fn create_multicast_group(&self, group: &NsMulticastGroup) -> Result<()>;
    async fn update_multicast_group(&self, group: &NsMulticastGroup) -> Result<()>;
    async fn delete_multicast_group(&self, id: Uuid) -> Result<()>;
    async fn add_device_to_multicast_group(&self, id: Uuid, dev_eui: Eui64) -> Result<()>;
    async fn remove_device_from_multicast_group(&self, id: Uuid, dev_eui: Eui64) -> Result<()>;
    async fn enqueue_multicast_queue_item(&self, item: &MulticastQueueItem) -> Result<()>;
    async fn flush_multicast_queue(&self, id: Uuid) -> Result<()>;
    async fn get_multicast_queue_items(&self, id: Uuid) -> Result<Vec<MulticastQueueItem>>;

    /// A DevAddr carrying the network-server's NwkID prefix.
    async fn get_random_dev_addr(&self) -> Result<DevAddr>;

    /// Frames for one device, until the receiver is dropped.
    async fn stream_frame_logs(&self, dev_eui: Eui64) -> Result<mpsc::Receiver<FrameLog>>;
}
