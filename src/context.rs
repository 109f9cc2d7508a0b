//! Handles every pipeline needs, passed explicitly instead of living in globals.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::Authorizer;
use crate::devkeys::{DevNoncePolicy, DeviceKeysStore};
use crate::error::Result;
use crate::framelog::{EventLogBus, FrameLogBus, DEFAULT_LOG_SIZE};
use crate::integration::{Integration, IntegrationHub};
use crate::lock::KeyedLocks;
use crate::lorawan::Eui64;
use crate::metrics::Metrics;
use crate::ns::pool::{Connector, NetworkServerPool};
use crate::ns::NetworkServer;
use crate::storage::{
    ActivationRepo, Device, DeviceRepo, InventoryRepo, KeysRepo, MulticastRepo, QueueRepo,
};

/// Repository ports.
#[derive(Clone)]
pub struct Ports {
    pub devices: Arc<dyn DeviceRepo>,
    pub activations: Arc<dyn ActivationRepo>,
    pub keys: Arc<dyn KeysRepo>,
    pub queue: Arc<dyn QueueRepo>,
    pub multicast: Arc<dyn MulticastRepo>,
    pub inventory: Arc<dyn InventoryRepo>,
}

impl Ports {
    /// All ports served by one store.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: DeviceRepo + ActivationRepo + KeysRepo + QueueRepo + MulticastRepo + InventoryRepo,
        S: 'static,
    {
        Self {
            devices: store.clone(),
            activations: store.clone(),
            keys: store.clone(),
            queue: store.clone(),
            multicast: store.clone(),
            inventory: store,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoreSettings {
    pub dev_nonce: DevNoncePolicy,
    pub frame_log_size: usize,
    pub ns_idle_timeout: Duration,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            dev_nonce: DevNoncePolicy::default(),
            frame_log_size: DEFAULT_LOG_SIZE,
            ns_idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct AppContext {
    pub devices: Arc<dyn DeviceRepo>,
    pub activations: Arc<dyn ActivationRepo>,
    pub keys: Arc<DeviceKeysStore>,
    pub queue: Arc<dyn QueueRepo>,
    pub multicast: Arc<dyn MulticastRepo>,
    pub inventory: Arc<dyn InventoryRepo>,
    pub authorizer: Arc<dyn Authorizer>,
    pub ns_pool: Arc<NetworkServerPool>,
    pub integration: Arc<IntegrationHub>,
    pub frame_log: Arc<FrameLogBus>,
    /// Serializes every activation, nonce and counter mutation of one device.
    pub device_locks: Arc<KeyedLocks<Eui64>>,
    pub group_locks: Arc<KeyedLocks<Uuid>>,
    pub metrics: Arc<Metrics>,
}

impl AppContext {
    pub fn new(
        ports: Ports,
        authorizer: Arc<dyn Authorizer>,
        connector: Arc<dyn Connector>,
        sinks: Vec<Arc<dyn Integration>>,
        settings: CoreSettings,
    ) -> Self {
        let device_locks = Arc::new(KeyedLocks::new());
        let event_log = Arc::new(EventLogBus::new(settings.frame_log_size));
        Self {
            keys: Arc::new(DeviceKeysStore::new(
                ports.keys,
                device_locks.clone(),
                settings.dev_nonce,
            )),
            devices: ports.devices,
            activations: ports.activations,
            queue: ports.queue,
            multicast: ports.multicast,
            inventory: ports.inventory,
            authorizer,
            ns_pool: Arc::new(NetworkServerPool::new(connector, settings.ns_idle_timeout)),
            integration: Arc::new(IntegrationHub::new(sinks, event_log)),
            frame_log: Arc::new(FrameLogBus::new(settings.frame_log_size)),
            device_locks,
            group_locks: Arc::new(KeyedLocks::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn event_log(&self) -> &Arc<EventLogBus> {
        self.integration.event_log()
    }

    /// Application name for event payloads; empty when the application is gone.
    pub async fn application_name(&self, application_id: i64) -> String {
        match self.inventory.application(application_id).await {
            Ok(app) => app.name,
            Err(_) => String::new(),
        }
    }

    pub async fn network_server(&self, network_server_id: i64) -> Result<Arc<dyn NetworkServer>> {
        let profile = self.inventory.network_server(network_server_id).await?;
        self.ns_pool.get(&profile)
    }

    /// The network-server a device is provisioned on, via its device-profile.
    pub async fn network_server_for_device(
        &self,
        device: &Device,
    ) -> Result<Arc<dyn NetworkServer>> {
        let dp = self.inventory.device_profile(device.device_profile_id).await?;
        self.network_server(dp.network_server_id).await
    }

    pub async fn network_server_for_service_profile(
        &self,
        service_profile_id: Uuid,
    ) -> Result<Arc<dyn NetworkServer>> {
        let sp = self.inventory.service_profile(service_profile_id).await?;
        self.network_server(sp.network_server_id).await
    }
}
