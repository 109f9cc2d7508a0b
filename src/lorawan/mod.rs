pub mod crypto;
pub mod encoder;
pub mod keys;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Fixed-width identifier stored in display (big-endian) order and
/// reversed to little-endian on the air.
macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_slice(b: &[u8]) -> Result<Self> {
                let arr: [u8; $len] = b.try_into().map_err(|_| {
                    Error::InvalidArgument(format!(
                        "{} must be {} bytes, got {}",
                        stringify!($name),
                        $len,
                        b.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            /// On-air (little-endian) representation.
            pub fn to_le_bytes(&self) -> [u8; $len] {
                let mut b = self.0;
                b.reverse();
                b
            }

            pub fn from_le_bytes(mut b: [u8; $len]) -> Self {
                b.reverse();
                Self(b)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let b = hex::decode(s).map_err(|e| {
                    Error::InvalidArgument(format!("{} '{}': {}", stringify!($name), s, e))
                })?;
                Self::from_slice(&b)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// DevEUI / JoinEUI.
    Eui64,
    8
);
hex_id!(
    /// Network-assigned device address.
    DevAddr,
    4
);
hex_id!(NetId, 3);
hex_id!(Aes128Key, 16);

impl NetId {
    /// NetID type (3 MSB).
    pub fn net_type(&self) -> u8 {
        self.0[0] >> 5
    }

    /// NwkID: the LSBs of the NetID that are embedded in every DevAddr.
    pub fn nwk_id(&self) -> u32 {
        let bits = self.nwk_id_bits();
        let id = u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]]);
        id & ((1u32 << bits) - 1)
    }

    fn nwk_id_bits(&self) -> u32 {
        match self.net_type() {
            0 | 1 => 6,
            2 => 9,
            3 => 11,
            4 => 12,
            5 => 13,
            6 => 15,
            _ => 17,
        }
    }
}

impl DevAddr {
    /// Overwrite the address prefix (type prefix + NwkID) for the given NetID.
    pub fn with_net_id_prefix(self, net_id: NetId) -> Self {
        let net_type = u32::from(net_id.net_type());
        let prefix_len = net_type + 1;
        let nwk_bits = net_id.nwk_id_bits();
        // type n prefix: n ones followed by a zero
        let type_prefix = ((1u32 << net_type) - 1) << 1;
        let prefix = (type_prefix << nwk_bits) | net_id.nwk_id();
        let shift = 32 - prefix_len - nwk_bits;
        let mask = u32::MAX >> (prefix_len + nwk_bits);
        let addr = u32::from_be_bytes(self.0);
        DevAddr(((prefix << shift) | (addr & mask)).to_be_bytes())
    }
}

/// LoRaWAN MAC version of a device profile.
///
/// This is the single switch between legacy (1.0.x) and 1.1 session handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacVersion {
    #[serde(rename = "1.0.0")]
    V1_0_0,
    #[serde(rename = "1.0.1")]
    V1_0_1,
    #[serde(rename = "1.0.2")]
    V1_0_2,
    #[serde(rename = "1.0.3")]
    V1_0_3,
    #[serde(rename = "1.0.4")]
    V1_0_4,
    #[serde(rename = "1.1.0")]
    V1_1_0,
}

impl MacVersion {
    /// Single NwkSKey, NwkKey doubles as AppKey, one downlink counter.
    pub fn is_legacy(&self) -> bool {
        !matches!(self, MacVersion::V1_1_0)
    }
}

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    /// MHDR byte for this message type with Major = LoRaWAN R1.
    pub fn mhdr(self) -> u8 {
        let bits: u8 = match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }
}

impl From<u8> for MType {
    fn from(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::RejoinRequest => write!(f, "RejoinRequest"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// Frame direction, as used in the B0 / Ai blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

/// Join-request type byte of the 1.1 join-accept MIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Join,
    RejoinType0,
    RejoinType1,
    RejoinType2,
}

impl JoinType {
    pub fn to_byte(self) -> u8 {
        match self {
            JoinType::Join => 0xFF,
            JoinType::RejoinType0 => 0x00,
            JoinType::RejoinType1 => 0x01,
            JoinType::RejoinType2 => 0x02,
        }
    }
}

/// Rejoin-request body, by rejoin type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejoinRequest {
    /// Type 0 (session reset) and type 2 (rekey)
    Type0Or2 {
        rejoin_type: u8,
        net_id: NetId,
        dev_eui: Eui64,
        rj_count0: u16,
    },
    /// Type 1 (restore a lost session context)
    Type1 {
        join_eui: Eui64,
        dev_eui: Eui64,
        rj_count1: u16,
    },
}

impl RejoinRequest {
    pub fn dev_eui(&self) -> Eui64 {
        match self {
            RejoinRequest::Type0Or2 { dev_eui, .. } | RejoinRequest::Type1 { dev_eui, .. } => {
                *dev_eui
            }
        }
    }

    pub fn join_type(&self) -> JoinType {
        match self {
            RejoinRequest::Type0Or2 { rejoin_type: 2, .. } => JoinType::RejoinType2,
            RejoinRequest::Type0Or2 { .. } => JoinType::RejoinType0,
            RejoinRequest::Type1 { .. } => JoinType::RejoinType1,
        }
    }

    pub fn rj_count(&self) -> u16 {
        match self {
            RejoinRequest::Type0Or2 { rj_count0, .. } => *rj_count0,
            RejoinRequest::Type1 { rj_count1, .. } => *rj_count1,
        }
    }
}

/// Decoded LoRaWAN MAC frame
///
/// Only the join family is decoded; every other frame keeps just its message type.
#[derive(Debug, Clone)]
pub enum LoRaWANFrame {
    JoinRequest {
        join_eui: Eui64,
        dev_eui: Eui64,
        dev_nonce: u16,
        mic: [u8; 4],
    },
    RejoinRequest {
        request: RejoinRequest,
        mic: [u8; 4],
    },
    Other(MType),
}

impl fmt::Display for LoRaWANFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoRaWANFrame::JoinRequest {
                join_eui,
                dev_eui,
                dev_nonce,
                mic,
            } => {
                write!(
                    f,
                    "JoinRequest JoinEUI={} DevEUI={} DevNonce={} MIC={}",
                    join_eui,
                    dev_eui,
                    dev_nonce,
                    hex::encode(mic)
                )
            }
            LoRaWANFrame::RejoinRequest { request, mic } => {
                write!(
                    f,
                    "RejoinRequest {:?} DevEUI={} RJcount={} MIC={}",
                    request.join_type(),
                    request.dev_eui(),
                    request.rj_count(),
                    hex::encode(mic)
                )
            }
            LoRaWANFrame::Other(mtype) => write!(f, "{}", mtype),
        }
    }
}

/// Decode a LoRaWAN PHY payload
pub fn decode_phy_payload(data: &[u8]) -> Result<LoRaWANFrame> {
    if data.is_empty() {
        return Err(Error::InvalidFrame("empty PHY payload".into()));
    }

    match MType::from(data[0]) {
        MType::JoinRequest => decode_join_request(data),
        MType::RejoinRequest => decode_rejoin_request(data),
        mtype => Ok(LoRaWANFrame::Other(mtype)),
    }
}

fn mic_of(data: &[u8]) -> [u8; 4] {
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&data[data.len() - 4..]);
    mic
}

fn eui_at(data: &[u8], at: usize) -> Eui64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    Eui64::from_le_bytes(b)
}

fn decode_join_request(data: &[u8]) -> Result<LoRaWANFrame> {
    // MHDR(1) + JoinEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4) = 23 bytes
    if data.len() != 23 {
        return Err(Error::InvalidFrame(format!(
            "JoinRequest must be 23 bytes, got {}",
            data.len()
        )));
    }

    Ok(LoRaWANFrame::JoinRequest {
        join_eui: eui_at(data, 1),
        dev_eui: eui_at(data, 9),
        dev_nonce: u16::from_le_bytes([data[17], data[18]]),
        mic: mic_of(data),
    })
}

fn decode_rejoin_request(data: &[u8]) -> Result<LoRaWANFrame> {
    if data.len() < 2 {
        return Err(Error::InvalidFrame("RejoinRequest too short".into()));
    }

    let request = match data[1] {
        // MHDR(1) + Type(1) + NetID(3) + DevEUI(8) + RJcount0(2) + MIC(4)
        rejoin_type @ (0 | 2) => {
            if data.len() != 19 {
                return Err(Error::InvalidFrame(format!(
                    "RejoinRequest type {} must be 19 bytes, got {}",
                    rejoin_type,
                    data.len()
                )));
            }
            RejoinRequest::Type0Or2 {
                rejoin_type,
                net_id: NetId::from_le_bytes([data[2], data[3], data[4]]),
                dev_eui: eui_at(data, 5),
                rj_count0: u16::from_le_bytes([data[13], data[14]]),
            }
        }
        // MHDR(1) + Type(1) + JoinEUI(8) + DevEUI(8) + RJcount1(2) + MIC(4)
        1 => {
            if data.len() != 24 {
                return Err(Error::InvalidFrame(format!(
                    "RejoinRequest type 1 must be 24 bytes, got {}",
                    data.len()
                )));
            }
            RejoinRequest::Type1 {
                join_eui: eui_at(data, 2),
                dev_eui: eui_at(data, 10),
                rj_count1: u16::from_le_bytes([data[18], data[19]]),
            }
        }
        other => {
            return Err(Error::InvalidFrame(format!(
                "unknown rejoin type {}",
                other
            )))
        }
    };

    Ok(LoRaWANFrame::RejoinRequest {
        request,
        mic: mic_of(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_join_frames_keep_mtype() {
        let data: Vec<u8> = vec![
            0x40, // MHDR
            0x04, 0x03, 0x02, 0x01, // DevAddr (LE)
            0x00, // FCtrl
            0x01, 0x00, // FCnt (LE)
            0x01, // FPort
            0xAA, 0xBB, // FRMPayload
            0xEF, 0xBE, 0xAD, 0xDE, // MIC
        ];

        match decode_phy_payload(&data).unwrap() {
            LoRaWANFrame::Other(mtype) => assert_eq!(mtype, MType::UnconfirmedDataUp),
            _ => panic!("Expected data frame type"),
        }
        let frame = decode_phy_payload(&[0x20, 0x01]).unwrap();
        assert_eq!(frame.to_string(), "JoinAccept");
    }

    #[test]
    fn test_decode_join_request() {
        let data: Vec<u8> = vec![
            0x00, // MHDR (JoinRequest)
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // JoinEUI (LE)
            0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, // DevEUI (LE)
            0x42, 0x00, // DevNonce
            0xEF, 0xBE, 0xAD, 0xDE, // MIC
        ];

        match decode_phy_payload(&data).unwrap() {
            LoRaWANFrame::JoinRequest {
                join_eui,
                dev_eui,
                dev_nonce,
                ..
            } => {
                assert_eq!(join_eui.to_string(), "0807060504030201");
                assert_eq!(dev_eui.to_string(), "1817161514131211");
                assert_eq!(dev_nonce, 0x0042);
            }
            _ => panic!("Expected JoinRequest frame"),
        }
    }

    #[test]
    fn test_decode_rejoin_type1() {
        let mut data = vec![0xC0, 0x01];
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data.extend_from_slice(&[8, 7, 6, 5, 4, 3, 2, 1]);
        data.extend_from_slice(&[0x05, 0x00]);
        data.extend_from_slice(&[0, 0, 0, 0]);

        match decode_phy_payload(&data).unwrap() {
            LoRaWANFrame::RejoinRequest { request, .. } => {
                assert_eq!(request.join_type(), JoinType::RejoinType1);
                assert_eq!(request.dev_eui().to_string(), "0102030405060708");
                assert_eq!(request.rj_count(), 5);
            }
            _ => panic!("Expected RejoinRequest frame"),
        }
    }

    #[test]
    fn test_rejoin_wrong_length_fails() {
        let data = vec![0xC0, 0x00, 0x01, 0x02];
        assert!(decode_phy_payload(&data).is_err());
    }

    #[test]
    fn test_empty_payload_fails() {
        assert!(decode_phy_payload(&[]).is_err());
    }

    #[test]
    fn test_short_join_request_fails() {
        let data: Vec<u8> = vec![0x00, 0x01, 0x02, 0x03, 0x04];
        assert!(decode_phy_payload(&data).is_err());
    }

    #[test]
    fn test_identifier_hex_and_byte_order() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(eui.to_le_bytes(), [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(Eui64::from_le_bytes(eui.to_le_bytes()), eui);
        assert!("0102".parse::<Eui64>().is_err());
        assert!("zz".parse::<DevAddr>().is_err());

        let json = serde_json::to_string(&eui).unwrap();
        assert_eq!(json, "\"0102030405060708\"");
        let back: Eui64 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, eui);
    }

    #[test]
    fn test_dev_addr_prefix_type0() {
        // NetID 000001: type 0, NwkID 0b000001 -> DevAddr prefix 0|000001
        let net_id: NetId = "000001".parse().unwrap();
        let addr = DevAddr([0xFF, 0xFF, 0xFF, 0xFF]).with_net_id_prefix(net_id);
        assert_eq!(addr.0[0] >> 1, 0b000_0001);
        assert_eq!(&addr.0[1..], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_mhdr_roundtrip() {
        for mtype in [
            MType::JoinRequest,
            MType::JoinAccept,
            MType::ConfirmedDataDown,
            MType::Proprietary,
        ] {
            assert_eq!(MType::from(mtype.mhdr()), mtype);
        }
        assert_eq!(MType::JoinAccept.mhdr(), 0x20);
    }

    #[test]
    fn test_mac_version_switch() {
        assert!(MacVersion::V1_0_3.is_legacy());
        assert!(!MacVersion::V1_1_0.is_legacy());
        let v: MacVersion = serde_json::from_str("\"1.1.0\"").unwrap();
        assert_eq!(v, MacVersion::V1_1_0);
    }
}
