//! Join engine
//!
//! Completes OTAA joins and 1.1 rejoins:
//!
//! ```text
//! parse -> device lookup -> nonce / counter check -> MIC check -> allocate JoinNonce
//!       -> derive session keys -> build + encrypt accept -> commit activation
//! ```
//!
//! The device lock is held from the nonce check to the commit. Nonce state and the
//! activation are committed together; any earlier failure leaves the stored state
//! untouched, so a rejected request never consumes a dev-nonce.

pub mod backend;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::fcnt::FrameCounters;
use crate::integration::{Event, JoinEvent};
use crate::lorawan::crypto;
use crate::lorawan::encoder::{AcceptKeys, DlSettings, JoinAcceptBuilder};
use crate::lorawan::keys::SessionKeys;
use crate::lorawan::{
    decode_phy_payload, DevAddr, Eui64, JoinType, LoRaWANFrame, MacVersion, NetId, RejoinRequest,
};
use crate::storage::{Device, DeviceActivation, DeviceProfile};

/// What the network-server supplies with a join- or rejoin-request.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub phy_payload: Vec<u8>,
    /// DevEUI the network-server resolved, checked against the frame.
    pub dev_eui: Option<Eui64>,
    pub dev_addr: DevAddr,
    pub net_id: NetId,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
    pub cf_list: Option<[u8; 16]>,
}

#[derive(Debug, Clone)]
pub struct JoinAnswer {
    pub phy_payload: Vec<u8>,
    pub mac_version: MacVersion,
    pub session_keys: SessionKeys,
    pub activation: DeviceActivation,
}

pub struct JoinEngine {
    ctx: AppContext,
}

impl JoinEngine {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn handle_join(&self, req: JoinRequest) -> Result<JoinAnswer> {
        let result = self.join(req).await;
        self.record(&result);
        result
    }

    pub async fn handle_rejoin(&self, req: JoinRequest) -> Result<JoinAnswer> {
        let result = self.rejoin(req).await;
        self.record(&result);
        result
    }

    fn record(&self, result: &Result<JoinAnswer>) {
        match result {
            Ok(_) => self.ctx.metrics.incr(|m| &m.joins_accepted),
            Err(e) => {
                self.ctx.metrics.incr(|m| &m.joins_rejected);
                self.ctx.metrics.record_error(e);
            }
        }
    }

    async fn lookup(&self, dev_eui: Eui64) -> Result<(Device, DeviceProfile)> {
        let device = self.ctx.devices.get(dev_eui).await?;
        let profile = self
            .ctx
            .inventory
            .device_profile(device.device_profile_id)
            .await?;
        if !profile.supports_join {
            return Err(Error::InvalidArgument(format!(
                "device-profile {} does not support OTAA",
                profile.id
            )));
        }
        Ok((device, profile))
    }

    async fn join(&self, req: JoinRequest) -> Result<JoinAnswer> {
        let (join_eui, dev_eui, dev_nonce) = match decode_phy_payload(&req.phy_payload)? {
            LoRaWANFrame::JoinRequest {
                join_eui,
                dev_eui,
                dev_nonce,
                ..
            } => (join_eui, dev_eui, dev_nonce),
            other => {
                return Err(Error::InvalidFrame(format!(
                    "expected join-request, got {}",
                    other
                )))
            }
        };
        check_dev_eui(&req, dev_eui)?;
        debug!(dev_eui = %dev_eui, join_eui = %join_eui, dev_nonce, "join-request");

        // unknown devices are rejected before any key material is touched
        let (device, profile) = self.lookup(dev_eui).await?;
        let mac_version = profile.mac_version;

        let mut txn = self.ctx.keys.begin(dev_eui).await?;
        txn.check_dev_nonce(join_eui, dev_nonce, mac_version)?;

        let nwk_key = txn.keys().nwk_key;
        if !crypto::validate_request_mic(&nwk_key, &req.phy_payload) {
            warn!(dev_eui = %dev_eui, dev_nonce, "join-request MIC mismatch");
            return Err(Error::MicFailed);
        }

        txn.consume_dev_nonce(join_eui, dev_nonce);
        let join_nonce = txn.next_join_nonce()?;

        let mut builder = JoinAcceptBuilder {
            join_nonce,
            net_id: req.net_id,
            dev_addr: req.dev_addr,
            dl_settings: req.dl_settings,
            rx_delay: req.rx_delay,
            cf_list: req.cf_list,
        };

        let (session_keys, accept_keys) = if mac_version.is_legacy() {
            builder.dl_settings.opt_neg = false;
            (
                crypto::derive_session_keys_legacy(&nwk_key, join_nonce, req.net_id, dev_nonce),
                AcceptKeys::Legacy { nwk_key },
            )
        } else {
            builder.dl_settings.opt_neg = true;
            let app_key = txn.keys().app_root_key();
            (
                crypto::derive_session_keys_1_1(&nwk_key, &app_key, join_nonce, join_eui, dev_nonce),
                AcceptKeys::V1_1 {
                    js_int_key: crypto::derive_js_int_key(&nwk_key, dev_eui),
                    enc_key: nwk_key,
                    join_type: JoinType::Join,
                    join_eui,
                    dev_nonce,
                },
            )
        };
        let phy_payload = builder.build(&accept_keys);

        let activation = txn
            .commit(DeviceActivation {
                id: 0,
                dev_eui,
                dev_addr: req.dev_addr,
                keys: session_keys.clone(),
                join_type: Some(JoinType::Join),
                join_eui: Some(join_eui),
                dev_nonce: Some(dev_nonce),
                join_nonce: Some(join_nonce),
                counters: FrameCounters::default(),
                created_at: Utc::now(),
            })
            .await?;

        info!(
            dev_eui = %dev_eui,
            dev_addr = %req.dev_addr,
            join_nonce,
            mac_version = ?mac_version,
            "device joined"
        );
        self.emit_join(&device, &activation, JoinType::Join).await;

        Ok(JoinAnswer {
            phy_payload,
            mac_version,
            session_keys,
            activation,
        })
    }

    async fn rejoin(&self, req: JoinRequest) -> Result<JoinAnswer> {
        let request = match decode_phy_payload(&req.phy_payload)? {
            LoRaWANFrame::RejoinRequest { request, .. } => request,
            other => {
                return Err(Error::InvalidFrame(format!(
                    "expected rejoin-request, got {}",
                    other
                )))
            }
        };
        let dev_eui = request.dev_eui();
        let join_type = request.join_type();
        let rj_count = request.rj_count();
        check_dev_eui(&req, dev_eui)?;
        debug!(dev_eui = %dev_eui, ?join_type, rj_count, "rejoin-request");

        let (device, profile) = self.lookup(dev_eui).await?;
        if profile.mac_version.is_legacy() {
            return Err(Error::InvalidFrame(format!(
                "rejoin-request from LoRaWAN {:?} device {}",
                profile.mac_version, dev_eui
            )));
        }

        let mut txn = self.ctx.keys.begin(dev_eui).await?;
        txn.check_rejoin_counter(join_type, rj_count)?;

        let nwk_key = txn.keys().nwk_key;
        let (mic_key, join_eui) = match &request {
            RejoinRequest::Type1 { join_eui, .. } => {
                (crypto::derive_js_int_key(&nwk_key, dev_eui), *join_eui)
            }
            RejoinRequest::Type0Or2 { .. } => {
                // MIC'd with the current session; the JoinEUI comes from the last join
                let current = self
                    .ctx
                    .activations
                    .latest_for(dev_eui)
                    .await?
                    .ok_or(Error::NoActivation(dev_eui))?;
                let join_eui = current.join_eui.ok_or_else(|| {
                    Error::InvalidArgument(format!("device {} was never joined", dev_eui))
                })?;
                (current.keys.s_nwk_s_int_key, join_eui)
            }
        };
        if !crypto::validate_request_mic(&mic_key, &req.phy_payload) {
            warn!(dev_eui = %dev_eui, rj_count, "rejoin-request MIC mismatch");
            return Err(Error::MicFailed);
        }

        txn.record_rejoin_counter(join_type, rj_count);
        let join_nonce = txn.next_join_nonce()?;

        let app_key = txn.keys().app_root_key();
        // RJcount takes the place of the DevNonce
        let session_keys =
            crypto::derive_session_keys_1_1(&nwk_key, &app_key, join_nonce, join_eui, rj_count);

        let mut builder = JoinAcceptBuilder {
            join_nonce,
            net_id: req.net_id,
            dev_addr: req.dev_addr,
            dl_settings: req.dl_settings,
            rx_delay: req.rx_delay,
            cf_list: req.cf_list,
        };
        builder.dl_settings.opt_neg = true;
        let phy_payload = builder.build(&AcceptKeys::V1_1 {
            js_int_key: crypto::derive_js_int_key(&nwk_key, dev_eui),
            enc_key: crypto::derive_js_enc_key(&nwk_key, dev_eui),
            join_type,
            join_eui,
            dev_nonce: rj_count,
        });

        let activation = txn
            .commit(DeviceActivation {
                id: 0,
                dev_eui,
                dev_addr: req.dev_addr,
                keys: session_keys.clone(),
                join_type: Some(join_type),
                join_eui: Some(join_eui),
                dev_nonce: None,
                join_nonce: Some(join_nonce),
                counters: FrameCounters::default(),
                created_at: Utc::now(),
            })
            .await?;

        info!(
            dev_eui = %dev_eui,
            dev_addr = %req.dev_addr,
            join_nonce,
            ?join_type,
            "device rejoined"
        );
        self.emit_join(&device, &activation, join_type).await;

        Ok(JoinAnswer {
            phy_payload,
            mac_version: profile.mac_version,
            session_keys,
            activation,
        })
    }

    async fn emit_join(&self, device: &Device, activation: &DeviceActivation, join_type: JoinType) {
        let application_name = self.ctx.application_name(device.application_id).await;
        self.ctx
            .integration
            .emit(Event::Join(JoinEvent {
                application_id: device.application_id,
                application_name,
                device_name: device.name.clone(),
                dev_eui: device.dev_eui,
                dev_addr: activation.dev_addr,
                join_type,
                published_at: Utc::now(),
            }))
            .await;
    }
}

fn check_dev_eui(req: &JoinRequest, in_frame: Eui64) -> Result<()> {
    match req.dev_eui {
        Some(expected) if expected != in_frame => Err(Error::InvalidFrame(format!(
            "DevEUI {} in request does not match {} in frame",
            expected, in_frame
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::context::{CoreSettings, Ports};
    use crate::lorawan::Aes128Key;
    use crate::ns::memory::InMemoryNetworkServer;
    use crate::ns::pool::StaticConnector;
    use crate::storage::memory::MemoryStore;
    use crate::storage::{Application, DeviceKeys, DeviceRepo, KeysRepo};
    use std::sync::Arc;
    use uuid::Uuid;

    const DEV_EUI: Eui64 = Eui64([1, 2, 3, 4, 5, 6, 7, 8]);
    const JOIN_EUI: Eui64 = Eui64([8, 7, 6, 5, 4, 3, 2, 1]);

    fn nwk_key() -> Aes128Key {
        "01020304050607080102030405060708".parse().unwrap()
    }

    async fn engine(mac_version: MacVersion, join_nonce: u32) -> (JoinEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dp = Uuid::new_v4();
        store.insert_device_profile(DeviceProfile {
            id: dp,
            name: "dp".into(),
            network_server_id: 1,
            mac_version,
            supports_join: true,
            supports_class_b: false,
            supports_class_c: false,
        });
        store.insert_application(Application {
            id: 1,
            name: "app".into(),
            organization_id: 1,
            service_profile_id: Uuid::nil(),
            payload_codec: Default::default(),
            payload_encoder_script: String::new(),
            payload_decoder_script: String::new(),
        });
        DeviceRepo::create(
            store.as_ref(),
            Device {
                dev_eui: DEV_EUI,
                application_id: 1,
                device_profile_id: dp,
                name: "dev".into(),
                description: String::new(),
                skip_fcnt_check: false,
                last_seen_at: None,
                battery: None,
                margin: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        let mut keys = DeviceKeys::new(DEV_EUI, nwk_key(), None);
        keys.join_nonce = join_nonce;
        store.store(keys).await.unwrap();

        let ns = Arc::new(InMemoryNetworkServer::new(NetId::default()));
        let ctx = AppContext::new(
            Ports::from_store(store.clone()),
            Arc::new(AllowAll),
            Arc::new(StaticConnector(ns)),
            vec![],
            CoreSettings::default(),
        );
        (JoinEngine::new(ctx), store)
    }

    fn join_request_phy(key: &Aes128Key, dev_nonce: u16) -> Vec<u8> {
        let mut phy = vec![0x00];
        phy.extend_from_slice(&JOIN_EUI.to_le_bytes());
        phy.extend_from_slice(&DEV_EUI.to_le_bytes());
        phy.extend_from_slice(&dev_nonce.to_le_bytes());
        let mic = crypto::cmac_mic(key, &phy);
        phy.extend_from_slice(&mic);
        phy
    }

    fn request(phy: Vec<u8>) -> JoinRequest {
        JoinRequest {
            phy_payload: phy,
            dev_eui: Some(DEV_EUI),
            dev_addr: "01020304".parse().unwrap(),
            net_id: "010203".parse().unwrap(),
            dl_settings: DlSettings {
                opt_neg: false,
                rx1_dr_offset: 1,
                rx2_dr: 5,
            },
            rx_delay: 1,
            cf_list: None,
        }
    }

    #[tokio::test]
    async fn test_join_accept_decrypts_and_verifies() {
        let (engine, store) = engine(MacVersion::V1_0_3, 65535).await;
        let ans = engine
            .handle_join(request(join_request_phy(&nwk_key(), 258)))
            .await
            .unwrap();

        assert_eq!(ans.activation.join_nonce, Some(65536));
        assert_eq!(
            ans.session_keys.nwk_s_key().to_string(),
            "df53c35f3034ccced0ff354c70de04df"
        );

        // device side: decrypt with NwkKey and verify the MIC
        let clear = crypto::decrypt_join_accept(&nwk_key(), &ans.phy_payload[1..]);
        let (body, mic) = clear.split_at(clear.len() - 4);
        let mut msg = vec![ans.phy_payload[0]];
        msg.extend_from_slice(body);
        assert_eq!(crypto::join_accept_mic_legacy(&nwk_key(), &msg), mic);

        assert_eq!(KeysRepo::load(store.as_ref(), DEV_EUI).await.unwrap().join_nonce, 65536);
    }

    #[tokio::test]
    async fn test_bad_mic_releases_nonce() {
        let (engine, store) = engine(MacVersion::V1_0_3, 0).await;
        let wrong: Aes128Key = "0f0e0d0c0b0a09080706050403020100".parse().unwrap();
        assert_eq!(
            engine.handle_join(request(join_request_phy(&wrong, 7))).await.unwrap_err(),
            Error::MicFailed
        );
        let keys = KeysRepo::load(store.as_ref(), DEV_EUI).await.unwrap();
        assert!(keys.dev_nonces.is_empty());
        assert_eq!(keys.join_nonce, 0);

        // a legitimate retry with the same nonce still succeeds
        assert!(engine.handle_join(request(join_request_phy(&nwk_key(), 7))).await.is_ok());
        assert_eq!(engine.ctx.metrics.snapshot().mic_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (engine, _) = engine(MacVersion::V1_0_3, 0).await;
        let mut req = request(join_request_phy(&nwk_key(), 1));
        req.phy_payload[9] ^= 0xFF; // DevEUI byte
        req.dev_eui = None;
        assert!(matches!(
            engine.handle_join(req).await,
            Err(Error::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_1_1_join_sets_opt_neg() {
        let (engine, _) = engine(MacVersion::V1_1_0, 0).await;
        let ans = engine
            .handle_join(request(join_request_phy(&nwk_key(), 1)))
            .await
            .unwrap();
        let clear = crypto::decrypt_join_accept(&nwk_key(), &ans.phy_payload[1..]);
        // DLSettings follows JoinNonce(3) NetID(3) DevAddr(4)
        assert_eq!(clear[10] & 0x80, 0x80);

        let (body, mic) = clear.split_at(clear.len() - 4);
        let mut msg = vec![ans.phy_payload[0]];
        msg.extend_from_slice(body);
        let js_int_key = crypto::derive_js_int_key(&nwk_key(), DEV_EUI);
        assert_eq!(
            crypto::join_accept_mic_1_1(&js_int_key, JoinType::Join, JOIN_EUI, 1, &msg),
            mic
        );
        assert_ne!(ans.session_keys.f_nwk_s_int_key, ans.session_keys.s_nwk_s_int_key);
    }

    fn rejoin_type1_phy(key: &Aes128Key, rj_count1: u16) -> Vec<u8> {
        let mut phy = vec![0xC0, 0x01];
        phy.extend_from_slice(&JOIN_EUI.to_le_bytes());
        phy.extend_from_slice(&DEV_EUI.to_le_bytes());
        phy.extend_from_slice(&rj_count1.to_le_bytes());
        let mic = crypto::cmac_mic(key, &phy);
        phy.extend_from_slice(&mic);
        phy
    }

    #[tokio::test]
    async fn test_rejoin_type1() {
        let (engine, _) = engine(MacVersion::V1_1_0, 10).await;
        let js_int_key = crypto::derive_js_int_key(&nwk_key(), DEV_EUI);

        let ans = engine
            .handle_rejoin(request(rejoin_type1_phy(&js_int_key, 3)))
            .await
            .unwrap();
        assert_eq!(ans.activation.join_type, Some(JoinType::RejoinType1));
        assert_eq!(ans.activation.join_nonce, Some(11));

        // accept is encrypted with JSEncKey
        let js_enc_key = crypto::derive_js_enc_key(&nwk_key(), DEV_EUI);
        let clear = crypto::decrypt_join_accept(&js_enc_key, &ans.phy_payload[1..]);
        assert_eq!(&clear[..3], &11u32.to_le_bytes()[..3]);

        // replayed counter
        assert!(matches!(
            engine.handle_rejoin(request(rejoin_type1_phy(&js_int_key, 3))).await,
            Err(Error::RejoinCounterReplay { counter: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_rejoin_rejected_for_legacy_device() {
        let (engine, _) = engine(MacVersion::V1_0_3, 0).await;
        let js_int_key = crypto::derive_js_int_key(&nwk_key(), DEV_EUI);
        assert!(matches!(
            engine.handle_rejoin(request(rejoin_type1_phy(&js_int_key, 1))).await,
            Err(Error::InvalidFrame(_))
        ));
    }
}
