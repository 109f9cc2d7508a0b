//! In-memory repository adapter.
//!
//! Every table sits behind one `RwLock`, so each repository call (a join commit or a
//! cascading delete included) applies atomically and no guard lives across an await.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use super::*;
use crate::error::Error;

#[derive(Default)]
struct Tables {
    devices: HashMap<Eui64, Device>,
    keys: HashMap<Eui64, DeviceKeys>,
    activations: HashMap<Eui64, Vec<DeviceActivation>>,
    next_activation_id: u64,
    queue: HashMap<Eui64, BTreeMap<u32, DeviceQueueMapping>>,
    groups: HashMap<Uuid, MulticastGroup>,
    members: HashMap<Uuid, BTreeSet<Eui64>>,
    applications: HashMap<i64, Application>,
    device_profiles: HashMap<Uuid, DeviceProfile>,
    service_profiles: HashMap<Uuid, ServiceProfile>,
    network_servers: HashMap<i64, NetworkServerProfile>,
}

impl Tables {
    fn push_activation(&mut self, mut activation: DeviceActivation) -> DeviceActivation {
        self.next_activation_id += 1;
        activation.id = self.next_activation_id;
        self.activations
            .entry(activation.dev_eui)
            .or_default()
            .push(activation.clone());
        activation
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_application(&self, app: Application) {
        self.tables.write().applications.insert(app.id, app);
    }

    pub fn insert_device_profile(&self, dp: DeviceProfile) {
        self.tables.write().device_profiles.insert(dp.id, dp);
    }

    pub fn insert_service_profile(&self, sp: ServiceProfile) {
        self.tables.write().service_profiles.insert(sp.id, sp);
    }

    pub fn insert_network_server(&self, ns: NetworkServerProfile) {
        self.tables.write().network_servers.insert(ns.id, ns);
    }
}

#[async_trait]
impl DeviceRepo for MemoryStore {
    async fn create(&self, device: Device) -> Result<()> {
        let mut t = self.tables.write();
        if t.devices.contains_key(&device.dev_eui) {
            return Err(Error::AlreadyExists(format!("device {}", device.dev_eui)));
        }
        t.devices.insert(device.dev_eui, device);
        Ok(())
    }

    async fn get(&self, dev_eui: Eui64) -> Result<Device> {
        self.tables
            .read()
            .devices
            .get(&dev_eui)
            .cloned()
            .ok_or(Error::UnknownDevice(dev_eui))
    }

    async fn update(&self, device: Device) -> Result<()> {
        let mut t = self.tables.write();
        match t.devices.get_mut(&device.dev_eui) {
            Some(d) => {
                *d = device;
                Ok(())
            }
            None => Err(Error::UnknownDevice(device.dev_eui)),
        }
    }

    async fn update_status(&self, dev_eui: Eui64, status: DeviceStatusUpdate) -> Result<()> {
        let mut t = self.tables.write();
        let d = t
            .devices
            .get_mut(&dev_eui)
            .ok_or(Error::UnknownDevice(dev_eui))?;
        d.last_seen_at = Some(status.last_seen_at);
        // unknown values leave the last known reading in place
        if status.battery.is_some() {
            d.battery = status.battery;
        }
        if status.margin.is_some() {
            d.margin = status.margin;
        }
        Ok(())
    }

    async fn delete(&self, dev_eui: Eui64) -> Result<()> {
        let mut t = self.tables.write();
        if t.devices.remove(&dev_eui).is_none() {
            return Err(Error::UnknownDevice(dev_eui));
        }
        t.keys.remove(&dev_eui);
        t.activations.remove(&dev_eui);
        t.queue.remove(&dev_eui);
        for members in t.members.values_mut() {
            members.remove(&dev_eui);
        }
        Ok(())
    }

    async fn list_for_application(&self, application_id: i64) -> Result<Vec<Device>> {
        let t = self.tables.read();
        let mut out: Vec<Device> = t
            .devices
            .values()
            .filter(|d| d.application_id == application_id)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.dev_eui);
        Ok(out)
    }
}

#[async_trait]
impl ActivationRepo for MemoryStore {
    async fn latest_for(&self, dev_eui: Eui64) -> Result<Option<DeviceActivation>> {
        Ok(self
            .tables
            .read()
            .activations
            .get(&dev_eui)
            .and_then(|a| a.last().cloned()))
    }

    async fn list_for(&self, dev_eui: Eui64) -> Result<Vec<DeviceActivation>> {
        Ok(self
            .tables
            .read()
            .activations
            .get(&dev_eui)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, activation: DeviceActivation) -> Result<DeviceActivation> {
        let mut t = self.tables.write();
        if !t.devices.contains_key(&activation.dev_eui) {
            return Err(Error::UnknownDevice(activation.dev_eui));
        }
        Ok(t.push_activation(activation))
    }

    async fn update_counters(
        &self,
        dev_eui: Eui64,
        id: u64,
        counters: FrameCounters,
    ) -> Result<()> {
        let mut t = self.tables.write();
        let activation = t
            .activations
            .get_mut(&dev_eui)
            .and_then(|list| list.iter_mut().find(|a| a.id == id))
            .ok_or(Error::NoActivation(dev_eui))?;
        activation.counters = counters;
        Ok(())
    }

    async fn delete_all_for(&self, dev_eui: Eui64) -> Result<()> {
        self.tables.write().activations.remove(&dev_eui);
        Ok(())
    }

    async fn commit_activation(
        &self,
        activation: DeviceActivation,
        skip_fcnt_check: bool,
    ) -> Result<DeviceActivation> {
        let mut t = self.tables.write();
        let device = t
            .devices
            .get_mut(&activation.dev_eui)
            .ok_or(Error::UnknownDevice(activation.dev_eui))?;
        if device.skip_fcnt_check != skip_fcnt_check {
            device.skip_fcnt_check = skip_fcnt_check;
            device.updated_at = chrono::Utc::now();
        }
        t.queue.remove(&activation.dev_eui);
        Ok(t.push_activation(activation))
    }
}

#[async_trait]
impl KeysRepo for MemoryStore {
    async fn load(&self, dev_eui: Eui64) -> Result<DeviceKeys> {
        self.tables
            .read()
            .keys
            .get(&dev_eui)
            .cloned()
            .ok_or(Error::NoDeviceKeys(dev_eui))
    }

    async fn store(&self, keys: DeviceKeys) -> Result<()> {
        let mut t = self.tables.write();
        if !t.devices.contains_key(&keys.dev_eui) {
            return Err(Error::UnknownDevice(keys.dev_eui));
        }
        t.keys.insert(keys.dev_eui, keys);
        Ok(())
    }

    async fn update_nonces(&self, keys: &DeviceKeys) -> Result<()> {
        let mut t = self.tables.write();
        let stored = t
            .keys
            .get_mut(&keys.dev_eui)
            .ok_or(Error::NoDeviceKeys(keys.dev_eui))?;
        stored.join_nonce = keys.join_nonce;
        stored.dev_nonces = keys.dev_nonces.clone();
        stored.rj_count0 = keys.rj_count0;
        stored.rj_count1 = keys.rj_count1;
        stored.updated_at = keys.updated_at;
        Ok(())
    }

    async fn commit_join(
        &self,
        keys: &DeviceKeys,
        activation: DeviceActivation,
    ) -> Result<DeviceActivation> {
        let mut t = self.tables.write();
        if !t.devices.contains_key(&activation.dev_eui) {
            return Err(Error::UnknownDevice(activation.dev_eui));
        }

        // (JoinEUI, DevNonce) must never repeat across join activations, even after the
        // nonce has left the bounded recent-set.
        if let (Some(join_eui), Some(dev_nonce), Some(JoinType::Join)) =
            (activation.join_eui, activation.dev_nonce, activation.join_type)
        {
            let reused = t
                .activations
                .get(&activation.dev_eui)
                .map(|list| {
                    list.iter().any(|a| {
                        a.join_type == Some(JoinType::Join)
                            && a.join_eui == Some(join_eui)
                            && a.dev_nonce == Some(dev_nonce)
                    })
                })
                .unwrap_or(false);
            if reused {
                return Err(Error::DevNonceReused {
                    dev_eui: activation.dev_eui,
                    dev_nonce,
                });
            }
        }

        let stored = t
            .keys
            .get_mut(&keys.dev_eui)
            .ok_or(Error::NoDeviceKeys(keys.dev_eui))?;
        stored.join_nonce = keys.join_nonce;
        stored.dev_nonces = keys.dev_nonces.clone();
        stored.rj_count0 = keys.rj_count0;
        stored.rj_count1 = keys.rj_count1;
        stored.updated_at = keys.updated_at;

        t.queue.remove(&activation.dev_eui);
        Ok(t.push_activation(activation))
    }

    async fn delete(&self, dev_eui: Eui64) -> Result<()> {
        self.tables
            .write()
            .keys
            .remove(&dev_eui)
            .map(|_| ())
            .ok_or(Error::NoDeviceKeys(dev_eui))
    }
}

#[async_trait]
impl QueueRepo for MemoryStore {
    async fn insert(&self, mapping: DeviceQueueMapping) -> Result<()> {
        let mut t = self.tables.write();
        let per_device = t.queue.entry(mapping.dev_eui).or_default();
        if per_device.contains_key(&mapping.f_cnt) {
            return Err(Error::AlreadyExists(format!(
                "queue mapping {}/{}",
                mapping.dev_eui, mapping.f_cnt
            )));
        }
        per_device.insert(mapping.f_cnt, mapping);
        Ok(())
    }

    async fn reserve(
        &self,
        mapping: DeviceQueueMapping,
        activation_id: u64,
        counters: FrameCounters,
    ) -> Result<()> {
        let mut t = self.tables.write();
        let dev_eui = mapping.dev_eui;
        let latest = t
            .activations
            .get(&dev_eui)
            .and_then(|list| list.last())
            .map(|a| a.id);
        if latest != Some(activation_id) {
            return Err(Error::NoActivation(dev_eui));
        }
        if t.queue
            .get(&dev_eui)
            .map_or(false, |q| q.contains_key(&mapping.f_cnt))
        {
            return Err(Error::AlreadyExists(format!(
                "queue mapping {}/{}",
                dev_eui, mapping.f_cnt
            )));
        }

        if let Some(activation) = t
            .activations
            .get_mut(&dev_eui)
            .and_then(|list| list.last_mut())
        {
            activation.counters = counters;
        }
        t.queue
            .entry(dev_eui)
            .or_default()
            .insert(mapping.f_cnt, mapping);
        Ok(())
    }

    async fn delete_by_fcnt(
        &self,
        dev_eui: Eui64,
        f_cnt: u32,
    ) -> Result<Option<DeviceQueueMapping>> {
        let mut t = self.tables.write();
        Ok(t.queue.get_mut(&dev_eui).and_then(|q| q.remove(&f_cnt)))
    }

    async fn delete_all_for(&self, dev_eui: Eui64) -> Result<usize> {
        Ok(self
            .tables
            .write()
            .queue
            .remove(&dev_eui)
            .map(|q| q.len())
            .unwrap_or(0))
    }

    async fn list_for(&self, dev_eui: Eui64) -> Result<Vec<DeviceQueueMapping>> {
        Ok(self
            .tables
            .read()
            .queue
            .get(&dev_eui)
            .map(|q| q.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MulticastRepo for MemoryStore {
    async fn create(&self, group: MulticastGroup) -> Result<()> {
        let mut t = self.tables.write();
        if t.groups.contains_key(&group.id) {
            return Err(Error::AlreadyExists(format!("multicast-group {}", group.id)));
        }
        t.members.insert(group.id, BTreeSet::new());
        t.groups.insert(group.id, group);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<MulticastGroup> {
        self.tables
            .read()
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("multicast-group {}", id)))
    }

    async fn update(&self, group: MulticastGroup) -> Result<()> {
        let mut t = self.tables.write();
        match t.groups.get_mut(&group.id) {
            Some(g) => {
                *g = group;
                Ok(())
            }
            None => Err(Error::not_found(format!("multicast-group {}", group.id))),
        }
    }

    async fn update_f_cnt(&self, id: Uuid, f_cnt: u32) -> Result<()> {
        let mut t = self.tables.write();
        let g = t
            .groups
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("multicast-group {}", id)))?;
        if f_cnt < g.f_cnt {
            return Err(Error::Internal(format!(
                "multicast-group {} frame-counter would decrease from {} to {}",
                id, g.f_cnt, f_cnt
            )));
        }
        g.f_cnt = f_cnt;
        g.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut t = self.tables.write();
        t.members.remove(&id);
        t.groups
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("multicast-group {}", id)))
    }

    async fn add_device(&self, id: Uuid, dev_eui: Eui64) -> Result<()> {
        let mut t = self.tables.write();
        if !t.devices.contains_key(&dev_eui) {
            return Err(Error::UnknownDevice(dev_eui));
        }
        let members = t
            .members
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("multicast-group {}", id)))?;
        if !members.insert(dev_eui) {
            return Err(Error::AlreadyExists(format!(
                "device {} in multicast-group {}",
                dev_eui, id
            )));
        }
        Ok(())
    }

    async fn remove_device(&self, id: Uuid, dev_eui: Eui64) -> Result<()> {
        let mut t = self.tables.write();
        let members = t
            .members
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("multicast-group {}", id)))?;
        if !members.remove(&dev_eui) {
            return Err(Error::not_found(format!(
                "device {} in multicast-group {}",
                dev_eui, id
            )));
        }
        Ok(())
    }

    async fn list_devices(&self, id: Uuid) -> Result<Vec<Eui64>> {
        self.tables
            .read()
            .members
            .get(&id)
            .map(|m| m.iter().copied().collect())
            .ok_or_else(|| Error::not_found(format!("multicast-group {}", id)))
    }
}

#[async_trait]
impl InventoryRepo for MemoryStore {
    async fn application(&self, id: i64) -> Result<Application> {
        self.tables
            .read()
            .applications
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("application {}", id)))
    }

    async fn device_profile(&self, id: Uuid) -> Result<DeviceProfile> {
        self.tables
            .read()
            .device_profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("device-profile {}", id)))
    }

    async fn service_profile(&self, id: Uuid) -> Result<ServiceProfile> {
        self.tables
            .read()
            .service_profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("service-profile {}", id)))
    }

    async fn network_server(&self, id: i64) -> Result<NetworkServerProfile> {
        self.tables
            .read()
            .network_servers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("network-server {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    fn device(eui: &str) -> Device {
        Device {
            dev_eui: eui.parse().unwrap(),
            application_id: 1,
            device_profile_id: Uuid::nil(),
            name: "dev".into(),
            description: String::new(),
            skip_fcnt_check: false,
            last_seen_at: None,
            battery: None,
            margin: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn activation(dev_eui: Eui64, dev_nonce: u16) -> DeviceActivation {
        let key: Aes128Key = "01020304050607080102030405060708".parse().unwrap();
        DeviceActivation {
            id: 0,
            dev_eui,
            dev_addr: DevAddr([1, 2, 3, 4]),
            keys: SessionKeys::legacy(key, key),
            join_type: Some(JoinType::Join),
            join_eui: Some(Eui64::default()),
            dev_nonce: Some(dev_nonce),
            join_nonce: Some(1),
            counters: FrameCounters::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = MemoryStore::new();
        let d = device("0102030405060708");
        let eui = d.dev_eui;
        assert_ok!(DeviceRepo::create(&store, d).await);
        let key: Aes128Key = "01020304050607080102030405060708".parse().unwrap();
        assert_ok!(store.store(DeviceKeys::new(eui, key, None)).await);
        assert_ok!(store.append(activation(eui, 1)).await);
        assert_ok!(
            QueueRepo::insert(
                &store,
                DeviceQueueMapping {
                    dev_eui: eui,
                    f_cnt: 1,
                    reference: "r".into(),
                    f_port: 1,
                    confirmed: false,
                    created_at: Utc::now(),
                }
            )
            .await
        );

        assert_ok!(DeviceRepo::delete(&store, eui).await);
        assert_err!(DeviceRepo::get(&store, eui).await);
        assert_eq!(KeysRepo::load(&store, eui).await, Err(Error::NoDeviceKeys(eui)));
        assert_eq!(store.latest_for(eui).await.unwrap(), None);
        assert!(QueueRepo::list_for(&store, eui).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activation_ids_are_ordered() {
        let store = MemoryStore::new();
        let d = device("0102030405060708");
        let eui = d.dev_eui;
        DeviceRepo::create(&store, d).await.unwrap();

        let a = store.append(activation(eui, 1)).await.unwrap();
        let b = store.append(activation(eui, 2)).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(store.latest_for(eui).await.unwrap().unwrap().id, b.id);
        assert_eq!(ActivationRepo::list_for(&store, eui).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_join_rejects_reused_nonce() {
        let store = MemoryStore::new();
        let d = device("0102030405060708");
        let eui = d.dev_eui;
        DeviceRepo::create(&store, d).await.unwrap();
        let key: Aes128Key = "01020304050607080102030405060708".parse().unwrap();
        let keys = DeviceKeys::new(eui, key, None);
        store.store(keys.clone()).await.unwrap();

        assert_ok!(store.commit_join(&keys, activation(eui, 7)).await);
        assert_eq!(
            store.commit_join(&keys, activation(eui, 7)).await,
            Err(Error::DevNonceReused {
                dev_eui: eui,
                dev_nonce: 7
            })
        );
    }

    fn mapping(dev_eui: Eui64, f_cnt: u32, reference: &str) -> DeviceQueueMapping {
        DeviceQueueMapping {
            dev_eui,
            f_cnt,
            reference: reference.into(),
            f_port: 1,
            confirmed: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_join_drops_queue_mappings() {
        let store = MemoryStore::new();
        let d = device("0102030405060708");
        let eui = d.dev_eui;
        DeviceRepo::create(&store, d).await.unwrap();
        let key: Aes128Key = "01020304050607080102030405060708".parse().unwrap();
        let keys = DeviceKeys::new(eui, key, None);
        store.store(keys.clone()).await.unwrap();

        assert_ok!(store.commit_join(&keys, activation(eui, 1)).await);
        assert_ok!(QueueRepo::insert(&store, mapping(eui, 0, "old")).await);
        assert_ok!(store.commit_join(&keys, activation(eui, 2)).await);
        assert!(QueueRepo::list_for(&store, eui).await.unwrap().is_empty());
        assert_ok!(QueueRepo::insert(&store, mapping(eui, 0, "new")).await);
    }

    #[tokio::test]
    async fn test_reserve_advances_counters_with_mapping() {
        let store = MemoryStore::new();
        let d = device("0102030405060708");
        let eui = d.dev_eui;
        DeviceRepo::create(&store, d).await.unwrap();
        let first = store.append(activation(eui, 1)).await.unwrap();
        let advanced = FrameCounters {
            f_cnt_up: None,
            n_f_cnt_down: 1,
            a_f_cnt_down: 0,
        };

        assert_ok!(store.reserve(mapping(eui, 0, "a"), first.id, advanced).await);
        assert_eq!(store.latest_for(eui).await.unwrap().unwrap().counters, advanced);

        // taken counter: nothing changes
        let skipped = FrameCounters {
            n_f_cnt_down: 9,
            ..advanced
        };
        assert_err!(store.reserve(mapping(eui, 0, "b"), first.id, skipped).await);
        assert_eq!(store.latest_for(eui).await.unwrap().unwrap().counters, advanced);

        // superseded session
        let second = store.append(activation(eui, 2)).await.unwrap();
        assert_eq!(
            store.reserve(mapping(eui, 1, "c"), first.id, skipped).await,
            Err(Error::NoActivation(eui))
        );
        assert_eq!(
            store.latest_for(eui).await.unwrap().unwrap().counters,
            FrameCounters::default()
        );
        assert_eq!(store.latest_for(eui).await.unwrap().unwrap().id, second.id);
        assert_eq!(QueueRepo::list_for(&store, eui).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_activation() {
        let store = MemoryStore::new();
        let d = device("0102030405060708");
        let eui = d.dev_eui;
        DeviceRepo::create(&store, d).await.unwrap();
        assert_ok!(QueueRepo::insert(&store, mapping(eui, 4, "old")).await);

        let a = store.commit_activation(activation(eui, 1), true).await.unwrap();
        assert_eq!(store.latest_for(eui).await.unwrap().unwrap().id, a.id);
        assert!(DeviceRepo::get(&store, eui).await.unwrap().skip_fcnt_check);
        assert!(QueueRepo::list_for(&store, eui).await.unwrap().is_empty());

        let unknown: Eui64 = "0807060504030201".parse().unwrap();
        assert_eq!(
            store.commit_activation(activation(unknown, 1), false).await,
            Err(Error::UnknownDevice(unknown))
        );
    }

    #[tokio::test]
    async fn test_queue_mapping_unique() {
        let store = MemoryStore::new();
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        let m = DeviceQueueMapping {
            dev_eui: eui,
            f_cnt: 12,
            reference: "r1".into(),
            f_port: 10,
            confirmed: true,
            created_at: Utc::now(),
        };
        assert_ok!(QueueRepo::insert(&store, m.clone()).await);
        assert_err!(QueueRepo::insert(&store, m.clone()).await);
        assert_eq!(store.delete_by_fcnt(eui, 12).await.unwrap(), Some(m));
        assert_eq!(store.delete_by_fcnt(eui, 12).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multicast_fcnt_never_decreases() {
        let store = MemoryStore::new();
        let key: Aes128Key = "01020304050607080102030405060708".parse().unwrap();
        let id = Uuid::new_v4();
        MulticastRepo::create(
            &store,
            MulticastGroup {
                id,
                name: "g".into(),
                service_profile_id: Uuid::nil(),
                mc_addr: DevAddr([1, 2, 3, 4]),
                mc_nwk_s_key: key,
                mc_app_s_key: key,
                f_cnt: 10,
                group_type: MulticastGroupType::ClassC,
                dr: 0,
                frequency: 869_525_000,
                ping_slot_period: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        assert_ok!(store.update_f_cnt(id, 11).await);
        assert_err!(store.update_f_cnt(id, 3).await);
        assert_eq!(MulticastRepo::get(&store, id).await.unwrap().f_cnt, 11);
    }
}
