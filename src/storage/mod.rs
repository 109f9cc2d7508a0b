//! Inventory model and the repository ports the core reads and writes.
//!
//! Entities reference each other by id only (`application_id`, `device_profile_id`,
//! ...); cross references are resolved through the repositories when needed.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::codec::PayloadCodec;
use crate::error::Result;
use crate::fcnt::FrameCounters;
use crate::lorawan::keys::SessionKeys;
use crate::lorawan::{Aes128Key, DevAddr, Eui64, JoinType, MacVersion};

/// Battery / margin value meaning "not available".
pub const STATUS_UNKNOWN: u32 = 256;

/// Map the 256 sentinel used on the wire to `None`.
pub fn from_status_sentinel(v: u32) -> Option<u32> {
    (v < STATUS_UNKNOWN).then_some(v)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub dev_eui: Eui64,
    pub application_id: i64,
    pub device_profile_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub skip_fcnt_check: bool,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// 0 external power, 1..=254 level, 255 not measurable; `None` unknown
    #[serde(default)]
    pub battery: Option<u32>,
    #[serde(default)]
    pub margin: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status fields refreshed by every uplink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceStatusUpdate {
    pub last_seen_at: DateTime<Utc>,
    pub battery: Option<u32>,
    pub margin: Option<i32>,
}

/// A `(JoinEUI, DevNonce)` pair already consumed by a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsedDevNonce {
    pub join_eui: Eui64,
    pub dev_nonce: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeys {
    pub dev_eui: Eui64,
    /// Root network key; also the AppKey of 1.0.x devices.
    pub nwk_key: Aes128Key,
    /// Distinct application root key (1.1 only).
    #[serde(default)]
    pub app_key: Option<Aes128Key>,
    /// Last JoinNonce handed out.
    #[serde(default)]
    pub join_nonce: u32,
    /// Recently consumed dev-nonces, oldest first.
    #[serde(default)]
    pub dev_nonces: VecDeque<UsedDevNonce>,
    #[serde(default)]
    pub rj_count0: Option<u16>,
    #[serde(default)]
    pub rj_count1: Option<u16>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceKeys {
    pub fn new(dev_eui: Eui64, nwk_key: Aes128Key, app_key: Option<Aes128Key>) -> Self {
        Self {
            dev_eui,
            nwk_key,
            app_key,
            join_nonce: 0,
            dev_nonces: VecDeque::new(),
            rj_count0: None,
            rj_count1: None,
            updated_at: Utc::now(),
        }
    }

    /// AppKey of a 1.1 device, falling back to the NwkKey.
    pub fn app_root_key(&self) -> Aes128Key {
        self.app_key.unwrap_or(self.nwk_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceActivation {
    /// Insertion order per store; later activations have larger ids.
    pub id: u64,
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    #[serde(flatten)]
    pub keys: SessionKeys,
    /// `None` for ABP.
    pub join_type: Option<JoinType>,
    pub join_eui: Option<Eui64>,
    pub dev_nonce: Option<u16>,
    pub join_nonce: Option<u32>,
    #[serde(flatten)]
    pub counters: FrameCounters,
    pub created_at: DateTime<Utc>,
}

/// Correlates a network-server downlink ACK with the enqueue that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceQueueMapping {
    pub dev_eui: Eui64,
    pub f_cnt: u32,
    pub reference: String,
    pub f_port: u8,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub organization_id: i64,
    pub service_profile_id: Uuid,
    #[serde(default)]
    pub payload_codec: PayloadCodec,
    #[serde(default)]
    pub payload_encoder_script: String,
    #[serde(default)]
    pub payload_decoder_script: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub id: Uuid,
    pub name: String,
    pub network_server_id: i64,
    pub mac_version: MacVersion,
    #[serde(default = "default_true")]
    pub supports_join: bool,
    #[serde(default)]
    pub supports_class_b: bool,
    #[serde(default)]
    pub supports_class_c: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProfile {
    pub id: Uuid,
    pub name: String,
    pub organization_id: i64,
    pub network_server_id: i64,
}

/// A network-server this application-server talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkServerProfile {
    pub id: i64,
    pub name: String,
    pub server: String,
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MulticastGroupType {
    #[serde(rename = "CLASS_B")]
    ClassB,
    #[serde(rename = "CLASS_C")]
    ClassC,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastGroup {
    pub id: Uuid,
    pub name: String,
    pub service_profile_id: Uuid,
    pub mc_addr: DevAddr,
    pub mc_nwk_s_key: Aes128Key,
    pub mc_app_s_key: Aes128Key,
    /// Next frame-counter to allocate.
    pub f_cnt: u32,
    pub group_type: MulticastGroupType,
    pub dr: u8,
    pub frequency: u32,
    #[serde(default)]
    pub ping_slot_period: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeviceRepo: Send + Sync {
    async fn create(&self, device: Device) -> Result<()>;
    /// `UnknownDevice` when missing.
    async fn get(&self, dev_eui: Eui64) -> Result<Device>;
    async fn update(&self, device: Device) -> Result<()>;
    async fn update_status(&self, dev_eui: Eui64, status: DeviceStatusUpdate) -> Result<()>;
    /// Removes the device together with its keys, activations, queue mappings and
    /// multicast memberships.
    async fn delete(&self, dev_eui: Eui64) -> Result<()>;
    async fn list_for_application(&self, application_id: i64) -> Result<Vec<Device>>;
}

#[async_trait]
pub trait ActivationRepo: Send + Sync {
    async fn latest_for(&self, dev_eui: Eui64) -> Result<Option<DeviceActivation>>;
    /// Oldest first.
    async fn list_for(&self, dev_eui: Eui64) -> Result<Vec<DeviceActivation>>;
    /// Stores the activation and returns it with its assigned id.
    async fn append(&self, activation: DeviceActivation) -> Result<DeviceActivation>;
    async fn update_counters(&self, dev_eui: Eui64, id: u64, counters: FrameCounters)
        -> Result<()>;
    async fn delete_all_for(&self, dev_eui: Eui64) -> Result<()>;
    /// Start an ABP session in one write: drop the device's queue mappings, store
    /// `skip_fcnt_check` on the device and append the activation.
    async fn commit_activation(
        &self,
        activation: DeviceActivation,
        skip_fcnt_check: bool,
    ) -> Result<DeviceActivation>;
}

#[async_trait]
pub trait KeysRepo: Send + Sync {
    /// `NoDeviceKeys` when missing.
    async fn load(&self, dev_eui: Eui64) -> Result<DeviceKeys>;
    /// Create or replace the keys of an existing device.
    async fn store(&self, keys: DeviceKeys) -> Result<()>;
    async fn update_nonces(&self, keys: &DeviceKeys) -> Result<()>;
    /// Persist the nonce state and the new activation atomically. Queue mappings of
    /// the replaced session are dropped in the same write, since its frame-counters
    /// start over.
    async fn commit_join(
        &self,
        keys: &DeviceKeys,
        activation: DeviceActivation,
    ) -> Result<DeviceActivation>;
    async fn delete(&self, dev_eui: Eui64) -> Result<()>;
}

#[async_trait]
pub trait QueueRepo: Send + Sync {
    /// `AlreadyExists` when `(DevEUI, FCnt)` is mapped already.
    async fn insert(&self, mapping: DeviceQueueMapping) -> Result<()>;
    /// Insert the mapping and store the advanced counters of activation
    /// `activation_id` in one write. Fails without changes when the activation is no
    /// longer the latest or the mapping exists.
    async fn reserve(
        &self,
        mapping: DeviceQueueMapping,
        activation_id: u64,
        counters: FrameCounters,
    ) -> Result<()>;
    async fn delete_by_fcnt(&self, dev_eui: Eui64, f_cnt: u32)
        -> Result<Option<DeviceQueueMapping>>;
    async fn delete_all_for(&self, dev_eui: Eui64) -> Result<usize>;
    async fn list_for(&self, dev_eui: Eui64) -> Result<Vec<DeviceQueueMapping>>;
}

#[async_trait]
pub trait MulticastRepo: Send + Sync {
    async fn create(&self, group: MulticastGroup) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<MulticastGroup>;
    async fn update(&self, group: MulticastGroup) -> Result<()>;
    async fn update_f_cnt(&self, id: Uuid, f_cnt: u32) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn add_device(&self, id: Uuid, dev_eui: Eui64) -> Result<()>;
    async fn remove_device(&self, id: Uuid, dev_eui: Eui64) -> Result<()>;
    async fn list_devices(&self, id: Uuid) -> Result<Vec<Eui64>>;
}

/// Read access to the CRUD-managed inventory the core depends on.
#[async_trait]
pub trait InventoryRepo: Send + Sync {
    async fn application(&self, id: i64) -> Result<Application>;
    async fn device_profile(&self, id: Uuid) -> Result<DeviceProfile>;
    async fn service_profile(&self, id: Uuid) -> Result<ServiceProfile>;
    async fn network_server(&self, id: i64) -> Result<NetworkServerProfile>;
}
