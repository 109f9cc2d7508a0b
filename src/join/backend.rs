//! LoRaWAN Backend Interfaces join messages (JoinReq / RejoinReq and their answers).
//!
//! Field names follow the Backend Interfaces JSON encoding (PascalCase, hex byte
//! strings). Errors from the join engine become `Result.ResultCode` values; only
//! internal failures escape as `Err`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{JoinAnswer, JoinEngine, JoinRequest};
use crate::encoding::hex_bytes;
use crate::error::{Error, Result};
use crate::lorawan::encoder::DlSettings;
use crate::lorawan::keys::SessionKeys;
use crate::lorawan::{Aes128Key, DevAddr, Eui64, NetId};

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    JoinReq,
    JoinAns,
    RejoinReq,
    RejoinAns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    MICFailed,
    JoinReqFailed,
    NoRoamingAgreement,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BasePayload {
    pub protocol_version: String,
    #[serde(rename = "SenderID")]
    pub sender_id: String,
    #[serde(rename = "ReceiverID")]
    pub receiver_id: String,
    #[serde(rename = "TransactionID")]
    pub transaction_id: u32,
    pub message_type: MessageType,
}

/// JoinReq and RejoinReq share one layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinReqPayload {
    #[serde(flatten)]
    pub base: BasePayload,
    #[serde(rename = "MACVersion", default)]
    pub mac_version: String,
    #[serde(rename = "PHYPayload", with = "hex_bytes")]
    pub phy_payload: Vec<u8>,
    #[serde(rename = "DevEUI", default)]
    pub dev_eui: Option<Eui64>,
    pub dev_addr: DevAddr,
    #[serde(rename = "DLSettings", with = "hex_bytes")]
    pub dl_settings: Vec<u8>,
    pub rx_delay: u8,
    #[serde(rename = "CFList", default, skip_serializing_if = "Option::is_none")]
    pub cf_list: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultPayload {
    pub result_code: ResultCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Session key, optionally wrapped under a key-encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    #[serde(rename = "KEKLabel", default)]
    pub kek_label: String,
    #[serde(rename = "AESKey")]
    pub aes_key: Aes128Key,
}

impl KeyEnvelope {
    /// Key in the clear (no KEK configured).
    pub fn plain(key: Aes128Key) -> Self {
        Self {
            kek_label: String::new(),
            aes_key: key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinAnsPayload {
    #[serde(flatten)]
    pub base: BasePayload,
    pub result: ResultPayload,
    #[serde(
        rename = "PHYPayload",
        with = "hex_bytes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub phy_payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_key: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_enc_key: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<KeyEnvelope>,
}

impl JoinAnsPayload {
    fn failed(base: BasePayload, code: ResultCode, description: String) -> Self {
        Self {
            base,
            result: ResultPayload {
                result_code: code,
                description,
            },
            phy_payload: Vec::new(),
            nwk_s_key: None,
            s_nwk_s_int_key: None,
            f_nwk_s_int_key: None,
            nwk_s_enc_key: None,
            app_s_key: None,
        }
    }

    fn success(base: BasePayload, answer: &JoinAnswer) -> Self {
        let mut ans = Self::failed(base, ResultCode::Success, String::new());
        ans.phy_payload = answer.phy_payload.clone();
        set_keys(&mut ans, &answer.session_keys, answer.mac_version.is_legacy());
        ans
    }
}

fn set_keys(ans: &mut JoinAnsPayload, keys: &SessionKeys, legacy: bool) {
    if legacy {
        ans.nwk_s_key = Some(KeyEnvelope::plain(keys.nwk_s_key()));
    } else {
        ans.s_nwk_s_int_key = Some(KeyEnvelope::plain(keys.s_nwk_s_int_key));
        ans.f_nwk_s_int_key = Some(KeyEnvelope::plain(keys.f_nwk_s_int_key));
        ans.nwk_s_enc_key = Some(KeyEnvelope::plain(keys.nwk_s_enc_key));
    }
    ans.app_s_key = Some(KeyEnvelope::plain(keys.app_s_key));
}

/// Result code for a failed join; `None` for internal failures.
pub fn result_code(err: &Error) -> Option<ResultCode> {
    match err {
        Error::MicFailed => Some(ResultCode::MICFailed),
        Error::UnknownDevice(_)
        | Error::NoDeviceKeys(_)
        | Error::NoActivation(_)
        | Error::InvalidFrame(_)
        | Error::DevNonceReused { .. }
        | Error::RejoinCounterReplay { .. }
        | Error::JoinNonceExhausted(_) => Some(ResultCode::JoinReqFailed),
        Error::Internal(_) => None,
        _ => Some(ResultCode::Other),
    }
}

/// Join-server front: validates the Backend Interfaces envelope and runs the engine.
pub struct JoinServer {
    engine: JoinEngine,
    net_id: NetId,
    join_eui_filter: Vec<Eui64>,
}

impl JoinServer {
    pub fn new(engine: JoinEngine, net_id: NetId, join_eui_filter: Vec<Eui64>) -> Self {
        Self {
            engine,
            net_id,
            join_eui_filter,
        }
    }

    pub async fn handle(&self, req: JoinReqPayload) -> Result<JoinAnsPayload> {
        let (ans_type, rejoin) = match req.base.message_type {
            MessageType::JoinReq => (MessageType::JoinAns, false),
            MessageType::RejoinReq => (MessageType::RejoinAns, true),
            other => {
                let base = answer_base(&req.base, other);
                return Ok(JoinAnsPayload::failed(
                    base,
                    ResultCode::Other,
                    format!("unexpected MessageType {:?}", other),
                ));
            }
        };
        let base = answer_base(&req.base, ans_type);

        if !self.join_eui_filter.is_empty() {
            let allowed = req
                .base
                .receiver_id
                .parse::<Eui64>()
                .map(|eui| self.join_eui_filter.contains(&eui))
                .unwrap_or(false);
            if !allowed {
                warn!(receiver_id = %req.base.receiver_id, "JoinEUI not served here");
                return Ok(JoinAnsPayload::failed(
                    base,
                    ResultCode::NoRoamingAgreement,
                    format!("unknown ReceiverID {}", req.base.receiver_id),
                ));
            }
        }

        let request = match self.to_request(&req) {
            Ok(r) => r,
            Err(e) => {
                return Ok(JoinAnsPayload::failed(
                    base,
                    ResultCode::JoinReqFailed,
                    e.to_string(),
                ))
            }
        };

        let result = if rejoin {
            self.engine.handle_rejoin(request).await
        } else {
            self.engine.handle_join(request).await
        };

        match result {
            Ok(answer) => Ok(JoinAnsPayload::success(base, &answer)),
            Err(e) => match result_code(&e) {
                Some(code) => {
                    info!(
                        transaction_id = req.base.transaction_id,
                        result = ?code,
                        error = %e,
                        "join rejected"
                    );
                    Ok(JoinAnsPayload::failed(base, code, e.to_string()))
                }
                None => Err(e),
            },
        }
    }

    fn to_request(&self, req: &JoinReqPayload) -> Result<JoinRequest> {
        let dl_settings = match req.dl_settings.as_slice() {
            [b] => DlSettings::from_byte(*b),
            other => {
                return Err(Error::InvalidFrame(format!(
                    "DLSettings must be 1 byte, got {}",
                    other.len()
                )))
            }
        };

        let cf_list = match req.cf_list.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => {
                let b = hex::decode(s)
                    .map_err(|e| Error::InvalidFrame(format!("CFList '{}': {}", s, e)))?;
                let arr: [u8; 16] = b.as_slice().try_into().map_err(|_| {
                    Error::InvalidFrame(format!("CFList must be 16 bytes, got {}", b.len()))
                })?;
                Some(arr)
            }
        };

        // SenderID carries the network-server's NetID
        let net_id = req.base.sender_id.parse().unwrap_or(self.net_id);

        Ok(JoinRequest {
            phy_payload: req.phy_payload.clone(),
            dev_eui: req.dev_eui,
            dev_addr: req.dev_addr,
            net_id,
            dl_settings,
            rx_delay: req.rx_delay,
            cf_list,
        })
    }
}

fn answer_base(req: &BasePayload, message_type: MessageType) -> BasePayload {
    BasePayload {
        protocol_version: PROTOCOL_VERSION.to_string(),
        sender_id: req.receiver_id.clone(),
        receiver_id: req.sender_id.clone(),
        transaction_id: req.transaction_id,
        message_type,
    }
}
