//! LoRaWAN cryptographic operations
//!
//! - join-request / rejoin-request MIC verification
//! - join-accept MIC and encryption
//! - session-key derivation (1.0.x and 1.1)
//! - FRMPayload encryption / decryption
//!
//! Everything is AES-128 over 16-byte blocks; there is no branching on key material
//! above the block cipher.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use super::keys::SessionKeys;
use super::{Aes128Key, DevAddr, Direction, Eui64, JoinType, NetId};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

const BLOCK_SIZE: usize = 16;

fn cipher(key: &Aes128Key) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

fn aes_encrypt(key: &Aes128Key, mut block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    cipher(key).encrypt_block((&mut block).into());
    block
}

/// AES-CMAC truncated to the 4-byte MIC.
pub fn cmac_mic(key: &Aes128Key, data: &[u8]) -> [u8; MIC_SIZE] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key.as_bytes()));
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// Compare two MICs without an early exit.
fn mic_eq(a: &[u8; MIC_SIZE], b: &[u8]) -> bool {
    if b.len() != MIC_SIZE {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify the MIC of a join-request or type 1 rejoin-request.
///
/// `phy` is the complete PHYPayload; the MIC covers everything but the last 4 bytes.
pub fn validate_request_mic(key: &Aes128Key, phy: &[u8]) -> bool {
    if phy.len() <= MIC_SIZE {
        return false;
    }
    let (msg, mic) = phy.split_at(phy.len() - MIC_SIZE);
    mic_eq(&cmac_mic(key, msg), mic)
}

/// Join-accept MIC for LoRaWAN 1.0.x (and 1.1 with OptNeg unset).
///
/// `msg` is `MHDR | JoinNonce | NetID | DevAddr | DLSettings | RxDelay | CFList`.
pub fn join_accept_mic_legacy(nwk_key: &Aes128Key, msg: &[u8]) -> [u8; MIC_SIZE] {
    cmac_mic(nwk_key, msg)
}

/// Join-accept MIC for LoRaWAN 1.1 (OptNeg set), computed with JSIntKey.
pub fn join_accept_mic_1_1(
    js_int_key: &Aes128Key,
    join_type: JoinType,
    join_eui: Eui64,
    dev_nonce: u16,
    msg: &[u8],
) -> [u8; MIC_SIZE] {
    let mut b = Vec::with_capacity(11 + msg.len());
    b.push(join_type.to_byte());
    b.extend_from_slice(&join_eui.to_le_bytes());
    b.extend_from_slice(&dev_nonce.to_le_bytes());
    b.extend_from_slice(msg);
    cmac_mic(js_int_key, &b)
}

/// Encrypt a join-accept: `payload` is everything after the MHDR, MIC included.
///
/// The device decrypts the accept with an AES *encrypt* so the server applies AES
/// *decrypt* block by block.
pub fn encrypt_join_accept(key: &Aes128Key, payload: &[u8]) -> Vec<u8> {
    let aes = cipher(key);
    let mut out = Vec::with_capacity(payload.len());
    for chunk in payload.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        aes.decrypt_block((&mut block).into());
        out.extend_from_slice(&block[..chunk.len()]);
    }
    out
}

/// Device-side inverse of [`encrypt_join_accept`].
pub fn decrypt_join_accept(key: &Aes128Key, payload: &[u8]) -> Vec<u8> {
    let aes = cipher(key);
    let mut out = Vec::with_capacity(payload.len());
    for chunk in payload.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        aes.encrypt_block((&mut block).into());
        out.extend_from_slice(&block[..chunk.len()]);
    }
    out
}

fn key_block(type_byte: u8, join_nonce: u32, middle: &[u8], dev_nonce: u16) -> [u8; BLOCK_SIZE] {
    let mut b = [0u8; BLOCK_SIZE];
    b[0] = type_byte;
    b[1..4].copy_from_slice(&join_nonce.to_le_bytes()[..3]);
    let end = 4 + middle.len();
    b[4..end].copy_from_slice(middle);
    b[end..end + 2].copy_from_slice(&dev_nonce.to_le_bytes());
    b
}

/// Session keys for LoRaWAN 1.0.x: NwkSKey (0x01) and AppSKey (0x02) under NwkKey.
///
/// The single NwkSKey is returned in all three network-key slots.
pub fn derive_session_keys_legacy(
    nwk_key: &Aes128Key,
    join_nonce: u32,
    net_id: NetId,
    dev_nonce: u16,
) -> SessionKeys {
    let net_id = net_id.to_le_bytes();
    let nwk_s_key = Aes128Key(aes_encrypt(
        nwk_key,
        key_block(0x01, join_nonce, &net_id, dev_nonce),
    ));
    let app_s_key = Aes128Key(aes_encrypt(
        nwk_key,
        key_block(0x02, join_nonce, &net_id, dev_nonce),
    ));
    SessionKeys::legacy(nwk_s_key, app_s_key)
}

/// Session keys for LoRaWAN 1.1 (OptNeg): network keys under NwkKey, AppSKey under AppKey.
pub fn derive_session_keys_1_1(
    nwk_key: &Aes128Key,
    app_key: &Aes128Key,
    join_nonce: u32,
    join_eui: Eui64,
    dev_nonce: u16,
) -> SessionKeys {
    let join_eui = join_eui.to_le_bytes();
    let block = |t: u8| key_block(t, join_nonce, &join_eui, dev_nonce);
    SessionKeys {
        f_nwk_s_int_key: Aes128Key(aes_encrypt(nwk_key, block(0x01))),
        app_s_key: Aes128Key(aes_encrypt(app_key, block(0x02))),
        s_nwk_s_int_key: Aes128Key(aes_encrypt(nwk_key, block(0x03))),
        nwk_s_enc_key: Aes128Key(aes_encrypt(nwk_key, block(0x04))),
    }
}

fn js_key(type_byte: u8, nwk_key: &Aes128Key, dev_eui: Eui64) -> Aes128Key {
    let mut b = [0u8; BLOCK_SIZE];
    b[0] = type_byte;
    b[1..9].copy_from_slice(&dev_eui.to_le_bytes());
    Aes128Key(aes_encrypt(nwk_key, b))
}

/// JSEncKey, encrypts join-accepts answering a rejoin-request.
pub fn derive_js_enc_key(nwk_key: &Aes128Key, dev_eui: Eui64) -> Aes128Key {
    js_key(0x05, nwk_key, dev_eui)
}

/// JSIntKey, MIC key for 1.1 join-accepts and type 1 rejoin-requests.
pub fn derive_js_int_key(nwk_key: &Aes128Key, dev_eui: Eui64) -> Aes128Key {
    js_key(0x06, nwk_key, dev_eui)
}

/// Encrypt or decrypt an FRMPayload.
///
/// Keystream blocks `Ai = AES(K, 0x01 | 0x00000000 | Dir | DevAddr | FCnt | 0x00 | i)`.
pub fn encrypt_frm_payload(
    key: &Aes128Key,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    payload: &[u8],
) -> Vec<u8> {
    let aes = cipher(key);
    let mut out = Vec::with_capacity(payload.len());

    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01;
        a[5] = dir as u8;
        a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        a[15] = (i + 1) as u8;
        aes.encrypt_block((&mut a).into());

        out.extend(chunk.iter().zip(a.iter()).map(|(p, s)| p ^ s));
    }

    out
}
