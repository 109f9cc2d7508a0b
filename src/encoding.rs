//! Serde helpers for byte fields on the JSON transports.

/// `Vec<u8>` as a standard base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// `Vec<u8>` as a hex string (Backend Interfaces messages).
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Frame {
        #[serde(with = "super::base64_bytes")]
        data: Vec<u8>,
        #[serde(with = "super::hex_bytes")]
        phy: Vec<u8>,
    }

    #[test]
    fn test_byte_fields() {
        let f = Frame {
            data: vec![1, 2, 3, 4],
            phy: vec![0x20, 0xAB],
        };
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, r#"{"data":"AQIDBA==","phy":"20AB"}"#);
        let back: Frame = serde_json::from_str(r#"{"data":"AQIDBA==","phy":"20ab"}"#).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_invalid_base64() {
        assert!(serde_json::from_str::<Frame>(r#"{"data":"!!","phy":""}"#).is_err());
    }
}
