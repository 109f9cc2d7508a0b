//! LoRaWAN join-accept encoder
//!
//! Cleartext layout (after the MHDR):
//!   JoinNonce(3,LE) | NetID(3,LE) | DevAddr(4,LE) | DLSettings(1) | RxDelay(1) | [CFList(16)]
//!
//! The MIC is appended to the cleartext and the whole payload (MIC included) is
//! encrypted; the MHDR stays in clear.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::crypto;
use super::{Aes128Key, DevAddr, Eui64, JoinType, MType, NetId};
use crate::error::{Error, Result};

/// DLSettings byte: OptNeg(1) | RX1DRoffset(3) | RX2DataRate(4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlSettings {
    pub opt_neg: bool,
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
}

impl DlSettings {
    pub fn to_byte(self) -> u8 {
        let mut b = (self.rx1_dr_offset & 0x07) << 4 | (self.rx2_dr & 0x0F);
        if self.opt_neg {
            b |= 0x80;
        }
        b
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            opt_neg: b & 0x80 != 0,
            rx1_dr_offset: (b >> 4) & 0x07,
            rx2_dr: b & 0x0F,
        }
    }
}

/// Build a channel-frequency CFList (type 0) from up to five frequencies in Hz.
pub fn cf_list_channels(freqs: &[u32]) -> Result<[u8; 16]> {
    if freqs.len() > 5 {
        return Err(Error::InvalidArgument(format!(
            "CFList holds at most 5 channels, got {}",
            freqs.len()
        )));
    }
    let mut out = [0u8; 16];
    for (i, f) in freqs.iter().enumerate() {
        let f = f / 100;
        if f >= 1 << 24 {
            return Err(Error::InvalidArgument(format!("frequency {} out of range", f)));
        }
        out[i * 3..i * 3 + 3].copy_from_slice(&f.to_le_bytes()[..3]);
    }
    // out[15] = CFListType 0
    Ok(out)
}

/// Parameters for a join-accept
#[derive(Debug, Clone)]
pub struct JoinAcceptBuilder {
    pub join_nonce: u32,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
    pub cf_list: Option<[u8; 16]>,
}

/// How the accept is authenticated and encrypted.
#[derive(Debug, Clone)]
pub enum AcceptKeys {
    /// 1.0.x: MIC and encryption with NwkKey.
    Legacy { nwk_key: Aes128Key },
    /// 1.1: MIC with JSIntKey; encryption with NwkKey (join) or JSEncKey (rejoin).
    V1_1 {
        js_int_key: Aes128Key,
        enc_key: Aes128Key,
        join_type: JoinType,
        join_eui: Eui64,
        dev_nonce: u16,
    },
}

impl JoinAcceptBuilder {
    /// `MHDR | cleartext accept` (no MIC)
    pub fn cleartext(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(29);
        buf.put_u8(MType::JoinAccept.mhdr());
        buf.put_slice(&self.join_nonce.to_le_bytes()[..3]);
        buf.put_slice(&self.net_id.to_le_bytes());
        buf.put_slice(&self.dev_addr.to_le_bytes());
        buf.put_u8(self.dl_settings.to_byte());
        buf.put_u8(self.rx_delay);
        if let Some(cf_list) = &self.cf_list {
            buf.put_slice(cf_list);
        }
        buf.to_vec()
    }

    /// Build the encrypted PHYPayload
    pub fn build(&self, keys: &AcceptKeys) -> Vec<u8> {
        let msg = self.cleartext();

        let (mic, enc_key) = match keys {
            AcceptKeys::Legacy { nwk_key } => {
                (crypto::join_accept_mic_legacy(nwk_key, &msg), *nwk_key)
            }
            AcceptKeys::V1_1 {
                js_int_key,
                enc_key,
                join_type,
                join_eui,
                dev_nonce,
            } => (
                crypto::join_accept_mic_1_1(js_int_key, *join_type, *join_eui, *dev_nonce, &msg),
                *enc_key,
            ),
        };

        let mut payload = msg[1..].to_vec();
        payload.extend_from_slice(&mic);

        let mut phy = Vec::with_capacity(1 + payload.len());
        phy.push(msg[0]);
        phy.extend(crypto::encrypt_join_accept(&enc_key, &payload));
        phy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_builder() -> JoinAcceptBuilder {
        JoinAcceptBuilder {
            join_nonce: 65536,
            net_id: "010203".parse().unwrap(),
            dev_addr: "01020304".parse().unwrap(),
            dl_settings: DlSettings {
                opt_neg: false,
                rx1_dr_offset: 1,
                rx2_dr: 5,
            },
            rx_delay: 1,
            cf_list: Some(cf_list_channels(&[868_700_000, 868_900_000]).unwrap()),
        }
    }

    #[test]
    fn test_legacy_join_accept_bytes() {
        let nwk_key: Aes128Key = "01020304050607080102030405060708".parse().unwrap();
        let phy = scenario_builder().build(&AcceptKeys::Legacy { nwk_key });

        let expected: Vec<u8> = vec![
            0x20, 0x26, 0xF4, 0xB2, 0x47, 0xF0, 0xA5, 0xD7, 0xE4, 0x6A, 0x72, 0x0E, 0x61, 0xC8,
            0xBC, 0xCB, 0xC5, 0x17, 0x9F, 0x45, 0x66, 0xE1, 0x85, 0xED, 0x68, 0x89, 0x58, 0x9B,
            0xB1, 0xA9, 0xC6, 0x8C, 0xC0,
        ];
        assert_eq!(phy, expected);
    }

    #[test]
    fn test_cleartext_layout() {
        let mut b = scenario_builder();
        b.cf_list = None;
        let clear = b.cleartext();
        assert_eq!(
            clear,
            vec![0x20, 0x00, 0x00, 0x01, 0x03, 0x02, 0x01, 0x04, 0x03, 0x02, 0x01, 0x15, 0x01]
        );
    }

    #[test]
    fn test_dl_settings_byte() {
        let s = DlSettings {
            opt_neg: true,
            rx1_dr_offset: 2,
            rx2_dr: 3,
        };
        assert_eq!(s.to_byte(), 0xA3);
        assert_eq!(DlSettings::from_byte(0xA3), s);
    }

    #[test]
    fn test_cf_list_channels() {
        let cf = cf_list_channels(&[868_700_000]).unwrap();
        assert_eq!(&cf[..3], &[0x98, 0x8E, 0x84]);
        assert_eq!(cf[15], 0);
        assert!(cf_list_channels(&[1; 6]).is_err());
    }
}
