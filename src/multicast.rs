//! Multicast groups
//!
//! Groups carry their own session (McAddr, McNwkSKey, McAppSKey) and frame-counter.
//! Every mutation is mirrored to the network-server of the group's service-profile;
//! enqueues are serialized per group.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::downlink::check_f_port;
use crate::encoding::base64_bytes;
use crate::error::{Error, Result};
use crate::lorawan::crypto::encrypt_frm_payload;
use crate::lorawan::{Direction, Eui64};
use crate::ns::{MulticastQueueItem, NsMulticastGroup};
use crate::storage::MulticastGroup;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastQueueEntry {
    pub f_cnt: u32,
    pub f_port: u8,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

fn ns_group(group: &MulticastGroup) -> NsMulticastGroup {
    NsMulticastGroup {
        id: group.id,
        service_profile_id: group.service_profile_id,
        mc_addr: group.mc_addr,
        mc_nwk_s_key: group.mc_nwk_s_key,
        f_cnt: group.f_cnt,
        group_type: group.group_type,
        dr: group.dr,
        frequency: group.frequency,
        ping_slot_period: group.ping_slot_period,
    }
}

pub struct MulticastEngine {
    ctx: AppContext,
}

impl MulticastEngine {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn create(&self, mut group: MulticastGroup) -> Result<MulticastGroup> {
        if group.id.is_nil() {
            group.id = Uuid::new_v4();
        }
        let now = Utc::now();
        group.created_at = now;
        group.updated_at = now;

        let ns = self
            .ctx
            .network_server_for_service_profile(group.service_profile_id)
            .await?;
        ns.create_multicast_group(&ns_group(&group)).await?;
        if let Err(e) = self.ctx.multicast.create(group.clone()).await {
            // keep the network-server free of groups we do not know about
            if let Err(undo) = ns.delete_multicast_group(group.id).await {
                warn!(group_id = %group.id, "rollback of network-server group failed: {}", undo);
            }
            return Err(e);
        }
        info!(group_id = %group.id, mc_addr = %group.mc_addr, "multicast-group created");
        Ok(group)
    }

    pub async fn get(&self, id: Uuid) -> Result<MulticastGroup> {
        self.ctx.multicast.get(id).await
    }

    /// The frame-counter is owned by [`MulticastEngine::enqueue`] and kept as stored.
    pub async fn update(&self, mut group: MulticastGroup) -> Result<MulticastGroup> {
        let _guard = self.ctx.group_locks.lock(&group.id).await;
        let existing = self.ctx.multicast.get(group.id).await?;
        if existing.service_profile_id != group.service_profile_id {
            return Err(Error::InvalidArgument(
                "the service-profile of a multicast-group can not be changed".into(),
            ));
        }
        group.f_cnt = existing.f_cnt;
        group.created_at = existing.created_at;
        group.updated_at = Utc::now();

        let ns = self
            .ctx
            .network_server_for_service_profile(group.service_profile_id)
            .await?;
        ns.update_multicast_group(&ns_group(&group)).await?;
        self.ctx.multicast.update(group.clone()).await?;
        info!(group_id = %group.id, "multicast-group updated");
        Ok(group)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let group = self.ctx.multicast.get(id).await?;
        let ns = self
            .ctx
            .network_server_for_service_profile(group.service_profile_id)
            .await?;
        {
            let _guard = self.ctx.group_locks.lock(&id).await;
            ns.delete_multicast_group(id).await?;
            self.ctx.multicast.delete(id).await?;
        }
        self.ctx.group_locks.remove(&id);
        info!(group_id = %id, "multicast-group deleted");
        Ok(())
    }

    pub async fn add_device(&self, id: Uuid, dev_eui: Eui64) -> Result<()> {
        let group = self.ctx.multicast.get(id).await?;
        let device = self.ctx.devices.get(dev_eui).await?;
        let app = self.ctx.inventory.application(device.application_id).await?;
        if app.service_profile_id != group.service_profile_id {
            return Err(Error::ServiceProfileMismatch {
                dev_eui,
                group: id.to_string(),
            });
        }

        let dp = self
            .ctx
            .inventory
            .device_profile(device.device_profile_id)
            .await?;
        let sp = self
            .ctx
            .inventory
            .service_profile(group.service_profile_id)
            .await?;
        if dp.network_server_id != sp.network_server_id {
            return Err(Error::InvalidArgument(format!(
                "device {} and multicast-group {} are on different network-servers",
                dev_eui, id
            )));
        }

        let ns = self.ctx.network_server(sp.network_server_id).await?;
        ns.add_device_to_multicast_group(id, dev_eui).await?;
        self.ctx.multicast.add_device(id, dev_eui).await?;
        info!(group_id = %id, dev_eui = %dev_eui, "device added to multicast-group");
        Ok(())
    }

    pub async fn remove_device(&self, id: Uuid, dev_eui: Eui64) -> Result<()> {
        let group = self.ctx.multicast.get(id).await?;
        let ns = self
            .ctx
            .network_server_for_service_profile(group.service_profile_id)
            .await?;
        ns.remove_device_from_multicast_group(id, dev_eui).await?;
        self.ctx.multicast.remove_device(id, dev_eui).await?;
        info!(group_id = %id, dev_eui = %dev_eui, "device removed from multicast-group");
        Ok(())
    }

    pub async fn list_devices(&self, id: Uuid) -> Result<Vec<Eui64>> {
        self.ctx.multicast.list_devices(id).await
    }

    /// Returns the allocated group frame-counter.
    pub async fn enqueue(&self, id: Uuid, f_port: u8, data: &[u8]) -> Result<u32> {
        check_f_port(f_port)?;
        let _guard = self.ctx.group_locks.lock(&id).await;
        let group = self.ctx.multicast.get(id).await?;

        let f_cnt = group.f_cnt;
        let next = f_cnt.checked_add(1).ok_or(Error::CounterExhausted)?;
        let frm_payload = encrypt_frm_payload(
            &group.mc_app_s_key,
            Direction::Downlink,
            group.mc_addr,
            f_cnt,
            data,
        );

        let ns = self
            .ctx
            .network_server_for_service_profile(group.service_profile_id)
            .await?;
        // stored before the hand-off; a failed forward burns the counter
        self.ctx.multicast.update_f_cnt(id, next).await?;
        ns.enqueue_multicast_queue_item(&MulticastQueueItem {
            multicast_group_id: id,
            frm_payload,
            f_cnt,
            f_port,
        })
        .await
        .map_err(|e| {
            self.ctx.metrics.record_error(&e);
            e
        })?;

        self.ctx.metrics.incr(|m| &m.multicast_enqueued);
        info!(group_id = %id, f_cnt, f_port, "multicast downlink enqueued");
        Ok(f_cnt)
    }

    pub async fn flush_queue(&self, id: Uuid) -> Result<()> {
        let group = self.ctx.multicast.get(id).await?;
        let ns = self
            .ctx
            .network_server_for_service_profile(group.service_profile_id)
            .await?;
        let _guard = self.ctx.group_locks.lock(&id).await;
        ns.flush_multicast_queue(id).await?;
        info!(group_id = %id, "multicast queue flushed");
        Ok(())
    }

    pub async fn list_queue(&self, id: Uuid) -> Result<Vec<MulticastQueueEntry>> {
        let group = self.ctx.multicast.get(id).await?;
        let ns = self
            .ctx
            .network_server_for_service_profile(group.service_profile_id)
            .await?;
        let items = ns.get_multicast_queue_items(id).await?;
        Ok(items
            .into_iter()
            .map(|item| MulticastQueueEntry {
                f_cnt: item.f_cnt,
                f_port: item.f_port,
                data: encrypt_frm_payload(
                    &group.mc_app_s_key,
                    Direction::Downlink,
                    group.mc_addr,
                    item.f_cnt,
                    &item.frm_payload,
                ),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PayloadCodec;
    use crate::context::fixtures::{fixture, key, Fixture, DEV_ADDR, DEV_EUI};
    use crate::lorawan::MacVersion;
    use crate::storage::{Application, MulticastGroupType};
    use tokio_test::assert_ok;

    fn group(fx: &Fixture, f_cnt: u32) -> MulticastGroup {
        MulticastGroup {
            id: Uuid::nil(),
            name: "lamps".into(),
            service_profile_id: fx.service_profile_id,
            mc_addr: DEV_ADDR,
            mc_nwk_s_key: key(),
            mc_app_s_key: key(),
            f_cnt,
            group_type: MulticastGroupType::ClassC,
            dr: 5,
            frequency: 869_525_000,
            ping_slot_period: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_encrypts_and_advances() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        let engine = MulticastEngine::new(fx.ctx.clone());
        let g = engine.create(group(&fx, 12)).await.unwrap();
        assert!(fx.ns.multicast_group(g.id).is_some());

        assert_eq!(engine.enqueue(g.id, 10, &[1, 2, 3, 4]).await.unwrap(), 12);
        let queued = fx.ns.multicast_queue(g.id);
        assert_eq!(queued[0].frm_payload, vec![0xa6, 0x9d, 0x43, 0xcf]);
        assert_eq!(engine.get(g.id).await.unwrap().f_cnt, 13);

        let listed = engine.list_queue(g.id).await.unwrap();
        assert_eq!(listed[0].data, vec![1, 2, 3, 4]);

        assert_ok!(engine.flush_queue(g.id).await);
        assert!(fx.ns.multicast_queue(g.id).is_empty());
    }

    #[tokio::test]
    async fn test_network_server_failure_burns_counter() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        let engine = MulticastEngine::new(fx.ctx.clone());
        let g = engine.create(group(&fx, 4)).await.unwrap();

        fx.ns.set_unavailable(true);
        assert!(engine.enqueue(g.id, 1, &[1]).await.is_err());
        assert_eq!(engine.get(g.id).await.unwrap().f_cnt, 5);

        fx.ns.set_unavailable(false);
        assert_eq!(engine.enqueue(g.id, 1, &[1]).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_counter_exhausted() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        let engine = MulticastEngine::new(fx.ctx.clone());
        let g = engine.create(group(&fx, u32::MAX)).await.unwrap();
        assert_eq!(
            engine.enqueue(g.id, 1, &[1]).await,
            Err(Error::CounterExhausted)
        );
        assert!(fx.ns.multicast_queue(g.id).is_empty());
    }

    #[tokio::test]
    async fn test_membership_requires_service_profile() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        let engine = MulticastEngine::new(fx.ctx.clone());
        let g = engine.create(group(&fx, 0)).await.unwrap();

        assert_ok!(engine.add_device(g.id, DEV_EUI).await);
        assert_eq!(fx.ns.multicast_members(g.id), vec![DEV_EUI]);
        assert_eq!(engine.list_devices(g.id).await.unwrap(), vec![DEV_EUI]);
        assert_ok!(engine.remove_device(g.id, DEV_EUI).await);
        assert!(fx.ns.multicast_members(g.id).is_empty());

        // move the device's application to another service-profile
        fx.store.insert_application(Application {
            id: 1,
            name: "app".into(),
            organization_id: 1,
            service_profile_id: Uuid::new_v4(),
            payload_codec: PayloadCodec::None,
            payload_encoder_script: String::new(),
            payload_decoder_script: String::new(),
        });
        assert!(matches!(
            engine.add_device(g.id, DEV_EUI).await,
            Err(Error::ServiceProfileMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_counter_and_delete() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        let engine = MulticastEngine::new(fx.ctx.clone());
        let g = engine.create(group(&fx, 7)).await.unwrap();

        let mut changed = g.clone();
        changed.name = "street lamps".into();
        changed.f_cnt = 0;
        let updated = engine.update(changed).await.unwrap();
        assert_eq!(updated.f_cnt, 7);
        assert_eq!(engine.get(g.id).await.unwrap().name, "street lamps");

        assert_ok!(engine.delete(g.id).await);
        assert!(fx.ns.multicast_group(g.id).is_none());
        assert!(matches!(engine.get(g.id).await, Err(Error::NotFound(_))));
    }
}
