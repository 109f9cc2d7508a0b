//! LoRaWAN session keys
//!
//! - 1.0.x: a single NwkSKey (MIC + MAC command encryption) and the AppSKey
//! - 1.1: FNwkSIntKey, SNwkSIntKey, NwkSEncKey and the AppSKey

use serde::{Deserialize, Serialize};

use super::Aes128Key;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKeys {
    pub f_nwk_s_int_key: Aes128Key,
    pub s_nwk_s_int_key: Aes128Key,
    pub nwk_s_enc_key: Aes128Key,
    pub app_s_key: Aes128Key,
}

impl SessionKeys {
    /// 1.0.x session: the NwkSKey fills every network-key slot.
    pub fn legacy(nwk_s_key: Aes128Key, app_s_key: Aes128Key) -> Self {
        Self {
            f_nwk_s_int_key: nwk_s_key,
            s_nwk_s_int_key: nwk_s_key,
            nwk_s_enc_key: nwk_s_key,
            app_s_key,
        }
    }

    /// The 1.0.x NwkSKey.
    pub fn nwk_s_key(&self) -> Aes128Key {
        self.f_nwk_s_int_key
    }
}
