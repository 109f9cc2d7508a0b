//! Downlink pipeline
//!
//! Enqueue allocates the frame-counter, encrypts with the AppSKey and forwards the
//! item to the network-server while the device lock is held. The counter advance and
//! the queue mapping are stored together before the hand-off, so a counter is never
//! reused; a failed forward burns it and drops only the mapping.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::encoding::base64_bytes;
use crate::error::{Error, Result};
use crate::framelog::FrameEntry;
use crate::integration::{AckEvent, Event};
use crate::lorawan::crypto::encrypt_frm_payload;
use crate::lorawan::{Direction, Eui64};
use crate::ns::{DeviceQueueItem, FrameDirection};
use crate::storage::DeviceQueueMapping;

/// Application FPorts; 0 carries MAC commands and 224+ are reserved.
pub const MIN_F_PORT: u8 = 1;
pub const MAX_F_PORT: u8 = 223;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    /// Structured object, run through the application's encoder.
    Object(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enqueue {
    pub dev_eui: Eui64,
    pub f_port: u8,
    pub confirmed: bool,
    pub payload: Payload,
    pub reference: String,
}

/// `HandleDownlinkACK` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkAck {
    pub dev_eui: Eui64,
    pub f_cnt: u32,
    pub acknowledged: bool,
}

/// A pending downlink as the network-server holds it, decrypted for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub f_cnt: u32,
    pub f_port: u8,
    pub confirmed: bool,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub reference: Option<String>,
}

pub fn check_f_port(f_port: u8) -> Result<()> {
    if (MIN_F_PORT..=MAX_F_PORT).contains(&f_port) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "fPort must be in {}..={}, got {}",
            MIN_F_PORT, MAX_F_PORT, f_port
        )))
    }
}

pub struct DownlinkPipeline {
    ctx: AppContext,
}

impl DownlinkPipeline {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Returns the allocated frame-counter.
    pub async fn enqueue(&self, req: Enqueue) -> Result<u32> {
        check_f_port(req.f_port)?;
        let device = self.ctx.devices.get(req.dev_eui).await?;
        if self.ctx.activations.latest_for(req.dev_eui).await?.is_none() {
            return Err(Error::NoActivation(req.dev_eui));
        }

        let data = match req.payload {
            Payload::Bytes(b) => b,
            Payload::Object(object) => {
                let app = self.ctx.inventory.application(device.application_id).await?;
                app.payload_codec.encode(req.f_port, &object).map_err(|e| {
                    self.ctx.metrics.record_error(&e);
                    e
                })?
            }
        };

        let profile = self
            .ctx
            .inventory
            .device_profile(device.device_profile_id)
            .await?;
        let ns = self.ctx.network_server(profile.network_server_id).await?;

        let _guard = self.ctx.device_locks.lock(&req.dev_eui).await;
        // reload under the lock; a join may have replaced the session meanwhile
        let mut activation = self
            .ctx
            .activations
            .latest_for(req.dev_eui)
            .await?
            .ok_or(Error::NoActivation(req.dev_eui))?;

        let (f_cnt, counter) = activation
            .counters
            .allocate_downlink(profile.mac_version, req.f_port)?;
        let frm_payload = encrypt_frm_payload(
            &activation.keys.app_s_key,
            Direction::Downlink,
            activation.dev_addr,
            f_cnt,
            &data,
        );

        self.ctx
            .queue
            .reserve(
                DeviceQueueMapping {
                    dev_eui: req.dev_eui,
                    f_cnt,
                    reference: req.reference.clone(),
                    f_port: req.f_port,
                    confirmed: req.confirmed,
                    created_at: Utc::now(),
                },
                activation.id,
                activation.counters,
            )
            .await?;

        let item = DeviceQueueItem {
            dev_eui: req.dev_eui,
            dev_addr: activation.dev_addr,
            frm_payload: frm_payload.clone(),
            f_cnt,
            f_port: req.f_port,
            confirmed: req.confirmed,
        };
        if let Err(e) = ns.create_device_queue_item(&item).await {
            warn!(dev_eui = %req.dev_eui, f_cnt, "network-server rejected queue item: {}", e);
            self.ctx.metrics.record_error(&e);
            self.ctx.queue.delete_by_fcnt(req.dev_eui, f_cnt).await?;
            return Err(e);
        }

        self.ctx.frame_log.publish(
            req.dev_eui,
            FrameEntry {
                dev_eui: req.dev_eui,
                direction: FrameDirection::Downlink,
                dev_addr: Some(activation.dev_addr),
                f_cnt: Some(f_cnt),
                f_port: Some(req.f_port),
                payload: frm_payload,
                tx_info: serde_json::Value::Null,
                rx_info: Vec::new(),
                at: Utc::now(),
            },
        );
        self.ctx.metrics.incr(|m| &m.downlinks_enqueued);
        info!(
            dev_eui = %req.dev_eui,
            f_cnt,
            f_port = req.f_port,
            ?counter,
            confirmed = req.confirmed,
            reference = %req.reference,
            "downlink enqueued"
        );
        Ok(f_cnt)
    }

    /// Correlate an ACK with its enqueue. Unknown counters are ignored.
    pub async fn handle_ack(&self, ack: DownlinkAck) -> Result<()> {
        let Some(mapping) = self.ctx.queue.delete_by_fcnt(ack.dev_eui, ack.f_cnt).await? else {
            debug!(dev_eui = %ack.dev_eui, f_cnt = ack.f_cnt, "ACK without queue mapping");
            return Ok(());
        };

        let device = self.ctx.devices.get(ack.dev_eui).await?;
        let application_name = self.ctx.application_name(device.application_id).await;
        self.ctx.metrics.incr(|m| &m.downlink_acks);
        info!(
            dev_eui = %ack.dev_eui,
            f_cnt = ack.f_cnt,
            acknowledged = ack.acknowledged,
            reference = %mapping.reference,
            "downlink ACK"
        );
        self.ctx
            .integration
            .emit(Event::Ack(AckEvent {
                application_id: device.application_id,
                application_name,
                device_name: device.name,
                dev_eui: device.dev_eui,
                reference: mapping.reference,
                acknowledged: ack.acknowledged,
                f_cnt: ack.f_cnt,
                published_at: Utc::now(),
            }))
            .await;
        Ok(())
    }

    /// Flush the network-server queue, then drop every local mapping.
    pub async fn flush(&self, dev_eui: Eui64) -> Result<usize> {
        let device = self.ctx.devices.get(dev_eui).await?;
        let ns = self.ctx.network_server_for_device(&device).await?;

        let _guard = self.ctx.device_locks.lock(&dev_eui).await;
        ns.flush_device_queue(dev_eui).await?;
        let dropped = self.ctx.queue.delete_all_for(dev_eui).await?;
        info!(dev_eui = %dev_eui, dropped, "device queue flushed");
        Ok(dropped)
    }

    pub async fn list(&self, dev_eui: Eui64) -> Result<Vec<QueueItem>> {
        let device = self.ctx.devices.get(dev_eui).await?;
        let Some(activation) = self.ctx.activations.latest_for(dev_eui).await? else {
            return Ok(Vec::new());
        };
        let ns = self.ctx.network_server_for_device(&device).await?;
        let items = ns.get_device_queue_items(dev_eui).await?;
        let mappings = self.ctx.queue.list_for(dev_eui).await?;

        Ok(items
            .into_iter()
            .map(|item| QueueItem {
                f_cnt: item.f_cnt,
                f_port: item.f_port,
                confirmed: item.confirmed,
                data: encrypt_frm_payload(
                    &activation.keys.app_s_key,
                    Direction::Downlink,
                    item.dev_addr,
                    item.f_cnt,
                    &item.frm_payload,
                ),
                reference: mappings
                    .iter()
                    .find(|m| m.f_cnt == item.f_cnt)
                    .map(|m| m.reference.clone()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PayloadCodec;
    use crate::context::fixtures::{activate, fixture, DEV_ADDR, DEV_EUI};
    use crate::fcnt::FrameCounters;
    use crate::lorawan::MacVersion;
    use tokio_test::assert_ok;

    fn enqueue(f_port: u8, payload: Payload, reference: &str) -> Enqueue {
        Enqueue {
            dev_eui: DEV_EUI,
            f_port,
            confirmed: true,
            payload,
            reference: reference.into(),
        }
    }

    fn counters(down: u32) -> FrameCounters {
        FrameCounters {
            f_cnt_up: None,
            n_f_cnt_down: down,
            a_f_cnt_down: down,
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_ack() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        activate(&fx, DEV_ADDR, counters(12)).await;
        let pipeline = DownlinkPipeline::new(fx.ctx.clone());

        let f_cnt = pipeline
            .enqueue(enqueue(10, Payload::Bytes(vec![1, 2, 3, 4]), "r1"))
            .await
            .unwrap();
        assert_eq!(f_cnt, 12);

        let queued = fx.ns.device_queue(DEV_EUI);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].f_cnt, 12);
        assert_eq!(queued[0].frm_payload, vec![0xa6, 0x9d, 0x43, 0xcf]);

        let latest = fx.ctx.activations.latest_for(DEV_EUI).await.unwrap().unwrap();
        assert_eq!(latest.counters.n_f_cnt_down, 13);

        let ack = DownlinkAck {
            dev_eui: DEV_EUI,
            f_cnt: 12,
            acknowledged: true,
        };
        assert_ok!(pipeline.handle_ack(ack).await);
        assert_ok!(pipeline.handle_ack(ack).await);

        let acks: Vec<_> = fx
            .ctx
            .event_log()
            .recent(DEV_EUI)
            .into_iter()
            .filter(|e| e.event_type == "ack")
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].payload["reference"], "r1");
        assert_eq!(acks[0].payload["acknowledged"], true);
        assert!(fx.ctx.queue.list_for(DEV_EUI).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_1_1_uses_app_counter() {
        let fx = fixture(MacVersion::V1_1_0, PayloadCodec::None).await;
        activate(
            &fx,
            DEV_ADDR,
            FrameCounters {
                f_cnt_up: None,
                n_f_cnt_down: 3,
                a_f_cnt_down: 40,
            },
        )
        .await;
        let pipeline = DownlinkPipeline::new(fx.ctx.clone());
        assert_eq!(
            pipeline
                .enqueue(enqueue(1, Payload::Bytes(vec![0]), "a"))
                .await
                .unwrap(),
            40
        );
        let latest = fx.ctx.activations.latest_for(DEV_EUI).await.unwrap().unwrap();
        assert_eq!((latest.counters.n_f_cnt_down, latest.counters.a_f_cnt_down), (3, 41));
    }

    #[tokio::test]
    async fn test_invalid_port_and_no_activation() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        let pipeline = DownlinkPipeline::new(fx.ctx.clone());
        assert!(matches!(
            pipeline.enqueue(enqueue(0, Payload::Bytes(vec![]), "")).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            pipeline.enqueue(enqueue(224, Payload::Bytes(vec![]), "")).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(
            pipeline.enqueue(enqueue(1, Payload::Bytes(vec![]), "")).await,
            Err(Error::NoActivation(DEV_EUI))
        );
    }

    #[tokio::test]
    async fn test_network_server_failure_burns_counter() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        activate(&fx, DEV_ADDR, counters(5)).await;
        let pipeline = DownlinkPipeline::new(fx.ctx.clone());

        fx.ns.set_unavailable(true);
        assert!(matches!(
            pipeline.enqueue(enqueue(1, Payload::Bytes(vec![1]), "x")).await,
            Err(Error::NetworkServerUnavailable(_))
        ));
        assert!(fx.ctx.queue.list_for(DEV_EUI).await.unwrap().is_empty());
        let latest = fx.ctx.activations.latest_for(DEV_EUI).await.unwrap().unwrap();
        assert_eq!(latest.counters.n_f_cnt_down, 6);

        fx.ns.set_unavailable(false);
        assert_eq!(
            pipeline
                .enqueue(enqueue(1, Payload::Bytes(vec![1]), "x"))
                .await
                .unwrap(),
            6
        );
    }

    #[tokio::test]
    async fn test_object_payload_uses_codec() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::CayenneLpp).await;
        activate(&fx, DEV_ADDR, counters(0)).await;
        let pipeline = DownlinkPipeline::new(fx.ctx.clone());

        let object = serde_json::json!({"digitalOutput": {"3": 1}});
        assert_ok!(pipeline.enqueue(enqueue(2, Payload::Object(object), "o")).await);

        let items = pipeline.list(DEV_EUI).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data, vec![3, 1, 1]);
        assert_eq!(items[0].reference.as_deref(), Some("o"));

        let no_codec = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        activate(&no_codec, DEV_ADDR, counters(0)).await;
        let pipeline = DownlinkPipeline::new(no_codec.ctx.clone());
        assert!(matches!(
            pipeline
                .enqueue(enqueue(2, Payload::Object(serde_json::json!({})), "o"))
                .await,
            Err(Error::CodecFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_flush() {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        activate(&fx, DEV_ADDR, counters(0)).await;
        let pipeline = DownlinkPipeline::new(fx.ctx.clone());
        for _ in 0..3 {
            assert_ok!(pipeline.enqueue(enqueue(1, Payload::Bytes(vec![1]), "")).await);
        }
        assert_eq!(pipeline.flush(DEV_EUI).await.unwrap(), 3);
        assert!(fx.ns.device_queue(DEV_EUI).is_empty());
        assert!(pipeline.list(DEV_EUI).await.unwrap().is_empty());
    }
}
