//! Uplink pipeline
//!
//! Network-server ingress for data uplinks, errors and proprietary frames. The
//! activation lookup and frame-counter update run under the device lock; decoding
//! and event delivery happen after it is released and never fail the call.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::context::AppContext;
use crate::encoding::base64_bytes;
use crate::error::{Error, Result};
use crate::fcnt;
use crate::framelog::FrameEntry;
use crate::integration::{ErrorEvent, Event, LocationEvent, StatusEvent, UplinkEvent};
use crate::lorawan::crypto::encrypt_frm_payload;
use crate::lorawan::{DevAddr, Direction, Eui64};
use crate::ns::FrameDirection;
use crate::storage::{from_status_sentinel, Device, DeviceActivation, DeviceStatusUpdate};

fn status_unknown() -> u32 {
    crate::storage::STATUS_UNKNOWN
}

fn margin_unknown() -> i32 {
    crate::storage::STATUS_UNKNOWN as i32
}

/// `HandleUplinkData` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkData {
    pub dev_eui: Eui64,
    /// DevAddr of the frame, when the network-server reports it.
    #[serde(default)]
    pub dev_addr: Option<DevAddr>,
    pub f_cnt: u32,
    pub f_port: u8,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub tx_info: serde_json::Value,
    #[serde(default)]
    pub rx_info: Vec<serde_json::Value>,
    /// 256 when unknown.
    #[serde(default = "status_unknown")]
    pub device_status_battery: u32,
    /// 256 when unknown.
    #[serde(default = "margin_unknown")]
    pub device_status_margin: i32,
}

/// `HandleError` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkError {
    pub dev_eui: Eui64,
    #[serde(rename = "type")]
    pub error_type: String,
    pub error: String,
    #[serde(default)]
    pub f_cnt: u32,
}

/// `HandleProprietaryUplink` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProprietaryUplink {
    #[serde(with = "base64_bytes")]
    pub mac_payload: Vec<u8>,
    #[serde(default)]
    pub tx_info: serde_json::Value,
    #[serde(default)]
    pub rx_info: Vec<serde_json::Value>,
}

/// Pick the activation a frame belongs to.
///
/// With a DevAddr: the newest activation on that address whose counter plausibly
/// precedes `f_cnt`, else the newest on that address. Without: the latest.
pub fn select_activation(
    activations: &[DeviceActivation],
    dev_addr: Option<DevAddr>,
    f_cnt: u32,
) -> Option<&DeviceActivation> {
    let Some(dev_addr) = dev_addr else {
        return activations.last();
    };
    let mut on_addr = activations.iter().rev().filter(|a| a.dev_addr == dev_addr);
    let newest = on_addr.clone().next();
    on_addr
        .find(|a| fcnt::is_plausible(a.counters.f_cnt_up, f_cnt))
        .or(newest)
}

pub struct UplinkPipeline {
    ctx: AppContext,
}

impl UplinkPipeline {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn handle_uplink(&self, req: UplinkData) -> Result<()> {
        match self.uplink(req).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.ctx.metrics.incr(|m| &m.uplinks_dropped);
                self.ctx.metrics.record_error(&e);
                Err(e)
            }
        }
    }

    async fn uplink(&self, req: UplinkData) -> Result<()> {
        let device = self.ctx.devices.get(req.dev_eui).await?;

        let battery = from_status_sentinel(req.device_status_battery);
        let margin = (req.device_status_margin != margin_unknown()).then_some(req.device_status_margin);
        self.ctx
            .devices
            .update_status(
                req.dev_eui,
                DeviceStatusUpdate {
                    last_seen_at: Utc::now(),
                    battery,
                    margin,
                },
            )
            .await?;

        let (activation, f_cnt) = {
            let _guard = self.ctx.device_locks.lock(&req.dev_eui).await;
            let activations = self.ctx.activations.list_for(req.dev_eui).await?;
            let mut activation = select_activation(&activations, req.dev_addr, req.f_cnt)
                .cloned()
                .ok_or(Error::NoActivation(req.dev_eui))?;

            let f_cnt = match fcnt::validate_uplink(
                activation.dev_addr,
                activation.counters.f_cnt_up,
                req.f_cnt,
                device.skip_fcnt_check,
            ) {
                Ok(f_cnt) => f_cnt,
                Err(e) => {
                    warn!(
                        dev_eui = %req.dev_eui,
                        dev_addr = %activation.dev_addr,
                        f_cnt = req.f_cnt,
                        "uplink dropped: {}",
                        e
                    );
                    return Err(e);
                }
            };
            // never move the stored counter backwards, even when the check is skipped
            let highest = activation.counters.f_cnt_up.map_or(f_cnt, |last| last.max(f_cnt));
            activation.counters.f_cnt_up = Some(highest);
            self.ctx
                .activations
                .update_counters(req.dev_eui, activation.id, activation.counters)
                .await?;
            (activation, f_cnt)
        };

        debug!(
            dev_eui = %req.dev_eui,
            dev_addr = %activation.dev_addr,
            f_cnt,
            f_port = req.f_port,
            "uplink accepted"
        );

        self.ctx.frame_log.publish(
            req.dev_eui,
            FrameEntry {
                dev_eui: req.dev_eui,
                direction: FrameDirection::Uplink,
                dev_addr: Some(activation.dev_addr),
                f_cnt: Some(f_cnt),
                f_port: Some(req.f_port),
                payload: req.data.clone(),
                tx_info: req.tx_info.clone(),
                rx_info: req.rx_info.clone(),
                at: Utc::now(),
            },
        );

        let application_name = self.ctx.application_name(device.application_id).await;

        if battery.is_some() || margin.is_some() {
            let (external_power_source, battery_level_unavailable, battery_level) =
                StatusEvent::battery_fields(battery);
            self.ctx
                .integration
                .emit(Event::Status(StatusEvent {
                    application_id: device.application_id,
                    application_name: application_name.clone(),
                    device_name: device.name.clone(),
                    dev_eui: device.dev_eui,
                    margin,
                    external_power_source,
                    battery_level_unavailable,
                    battery_level,
                    published_at: Utc::now(),
                }))
                .await;
        }

        if req.f_port == 0 {
            debug!(dev_eui = %req.dev_eui, f_cnt, "MAC-only uplink, not delivered");
            return Ok(());
        }

        let data = encrypt_frm_payload(
            &activation.keys.app_s_key,
            Direction::Uplink,
            activation.dev_addr,
            f_cnt,
            &req.data,
        );
        let object = self.decode(&device, req.f_port, &data).await;

        let location = object.as_ref().and_then(codec::location);
        self.ctx
            .integration
            .emit(Event::Uplink(UplinkEvent {
                application_id: device.application_id,
                application_name: application_name.clone(),
                device_name: device.name.clone(),
                dev_eui: device.dev_eui,
                dev_addr: activation.dev_addr,
                f_cnt,
                f_port: req.f_port,
                data,
                object,
                tx_info: req.tx_info,
                rx_info: req.rx_info,
                published_at: Utc::now(),
            }))
            .await;

        if let Some(location) = location {
            self.ctx
                .integration
                .emit(Event::Location(LocationEvent {
                    application_id: device.application_id,
                    application_name,
                    device_name: device.name.clone(),
                    dev_eui: device.dev_eui,
                    location,
                    f_cnt,
                    published_at: Utc::now(),
                }))
                .await;
        }

        self.ctx.metrics.incr(|m| &m.uplinks_delivered);
        info!(dev_eui = %device.dev_eui, f_cnt, f_port = req.f_port, "uplink delivered");
        Ok(())
    }

    /// Run the application codec; failures are logged and the raw bytes still flow.
    async fn decode(&self, device: &Device, f_port: u8, data: &[u8]) -> Option<serde_json::Value> {
        let app = match self.ctx.inventory.application(device.application_id).await {
            Ok(app) => app,
            Err(e) => {
                warn!(dev_eui = %device.dev_eui, "application lookup failed: {}", e);
                return None;
            }
        };
        match app.payload_codec.decode(f_port, data) {
            Ok(object) => object,
            Err(e) => {
                self.ctx.metrics.incr(|m| &m.codec_errors);
                warn!(
                    dev_eui = %device.dev_eui,
                    codec = ?app.payload_codec,
                    f_port,
                    "payload decode failed: {}",
                    e
                );
                None
            }
        }
    }

    pub async fn handle_error(&self, req: UplinkError) -> Result<()> {
        let device = self.ctx.devices.get(req.dev_eui).await?;
        warn!(
            dev_eui = %req.dev_eui,
            error_type = %req.error_type,
            f_cnt = req.f_cnt,
            "network-server reported error: {}",
            req.error
        );
        let application_name = self.ctx.application_name(device.application_id).await;
        self.ctx
            .integration
            .emit(Event::Error(ErrorEvent {
                application_id: device.application_id,
                application_name,
                device_name: device.name,
                dev_eui: device.dev_eui,
                error_type: req.error_type,
                error: req.error,
                f_cnt: req.f_cnt,
                published_at: Utc::now(),
            }))
            .await;
        Ok(())
    }

    /// Proprietary frames carry no device identity; they are only logged and counted.
    pub async fn handle_proprietary(&self, req: ProprietaryUplink) -> Result<()> {
        self.ctx.metrics.incr(|m| &m.proprietary_uplinks);
        info!(
            bytes = req.mac_payload.len(),
            gateways = req.rx_info.len(),
            "proprietary uplink: {}",
            hex::encode(&req.mac_payload)
        );
        Ok(())
    }
}
