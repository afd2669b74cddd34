//! NIP-44: Versioned Encryption (version 2).
//!
//! - conversation key: `HKDF-extract(salt = "nip44-v2", ikm = ecdh_x)`
//! - per-message keys: `HKDF-expand(conversation_key, info = nonce, 76)`
//!   split into ChaCha20 key, ChaCha20 nonce and HMAC key
//! - plaintext is length-prefixed and padded before encryption
//! - payload: `base64(version || nonce || ciphertext || mac)`

use crate::keys::{KeyError, shared_secret};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const VERSION: u8 = 2;
pub const NONCE_SIZE: usize = 32;
pub const CHACHA_KEY_SIZE: usize = 32;
pub const CHACHA_NONCE_SIZE: usize = 12;
pub const HMAC_KEY_SIZE: usize = 32;
pub const MAC_SIZE: usize = 32;
pub const MIN_PLAINTEXT_LEN: usize = 1;
pub const MAX_PLAINTEXT_LEN: usize = 65535;
pub const MIN_PADDED_LEN: usize = 32;

const SALT: &[u8] = b"nip44-v2";

/// Errors that can occur during NIP-44 operations.
#[derive(Debug, Error)]
pub enum Nip44Error {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("invalid plaintext length: {0}")]
    InvalidPlaintextLength(usize),

    #[error("unsupported encryption version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid MAC")]
    InvalidMac,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Derive the long-lived conversation key between two parties.
pub fn get_conversation_key(secret_key: &[u8; 32], public_key: &str) -> Result<[u8; 32], Nip44Error> {
    let shared_x = shared_secret(secret_key, public_key)?;
    let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &shared_x);
    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    Ok(key)
}

struct MessageKeys {
    chacha_key: [u8; CHACHA_KEY_SIZE],
    chacha_nonce: [u8; CHACHA_NONCE_SIZE],
    hmac_key: [u8; HMAC_KEY_SIZE],
}

fn message_keys(conversation_key: &[u8; 32], nonce: &[u8; NONCE_SIZE]) -> Result<MessageKeys, Nip44Error> {
    let hkdf = Hkdf::<Sha256>::from_prk(conversation_key)
        .map_err(|e| Nip44Error::KeyDerivation(e.to_string()))?;
    let mut okm = [0u8; CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE + HMAC_KEY_SIZE];
    hkdf.expand(nonce, &mut okm)
        .map_err(|e| Nip44Error::KeyDerivation(e.to_string()))?;

    let mut keys = MessageKeys {
        chacha_key: [0u8; CHACHA_KEY_SIZE],
        chacha_nonce: [0u8; CHACHA_NONCE_SIZE],
        hmac_key: [0u8; HMAC_KEY_SIZE],
    };
    keys.chacha_key.copy_from_slice(&okm[..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..]);
    Ok(keys)
}

/// Padded length for a plaintext of `len` bytes.
pub fn calc_padded_len(len: usize) -> usize {
    if len <= MIN_PADDED_LEN {
        return MIN_PADDED_LEN;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &str) -> Result<Vec<u8>, Nip44Error> {
    let bytes = plaintext.as_bytes();
    let len = bytes.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(Nip44Error::InvalidPlaintextLength(len));
    }

    let mut padded = Vec::with_capacity(2 + calc_padded_len(len));
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(bytes);
    padded.resize(2 + calc_padded_len(len), 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<String, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_LEN || padded.len() != 2 + calc_padded_len(len) {
        return Err(Nip44Error::InvalidPadding);
    }
    String::from_utf8(padded[2..2 + len].to_vec()).map_err(|_| Nip44Error::InvalidPadding)
}

fn hmac_aad(key: &[u8; HMAC_KEY_SIZE], nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, Nip44Error> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Nip44Error::KeyDerivation(e.to_string()))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

/// Encrypt with an explicit conversation key and nonce.
pub fn encrypt_with_conversation_key(
    conversation_key: &[u8; 32],
    plaintext: &str,
    nonce: &[u8; NONCE_SIZE],
) -> Result<String, Nip44Error> {
    let keys = message_keys(conversation_key, nonce)?;
    let mut buffer = pad(plaintext)?;

    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    let mac = hmac_aad(&keys.hmac_key, nonce, &buffer)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + buffer.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buffer);
    payload.extend_from_slice(&mac);
    Ok(BASE64.encode(payload))
}

/// Decrypt with an explicit conversation key.
pub fn decrypt_with_conversation_key(
    conversation_key: &[u8; 32],
    payload: &str,
) -> Result<String, Nip44Error> {
    if payload.starts_with('#') {
        return Err(Nip44Error::UnsupportedVersion("#".to_string()));
    }
    if !(132..=87472).contains(&payload.len()) {
        return Err(Nip44Error::InvalidPayload(format!(
            "invalid payload size {}",
            payload.len()
        )));
    }

    let data = BASE64
        .decode(payload)
        .map_err(|e| Nip44Error::InvalidPayload(e.to_string()))?;
    if !(99..=65603).contains(&data.len()) {
        return Err(Nip44Error::InvalidPayload(format!(
            "invalid data size {}",
            data.len()
        )));
    }
    if data[0] != VERSION {
        return Err(Nip44Error::UnsupportedVersion(data[0].to_string()));
    }

    let nonce: [u8; NONCE_SIZE] = data[1..1 + NONCE_SIZE]
        .try_into()
        .map_err(|_| Nip44Error::InvalidPayload("nonce".to_string()))?;
    let ciphertext = &data[1 + NONCE_SIZE..data.len() - MAC_SIZE];
    let mac = &data[data.len() - MAC_SIZE..];

    let keys = message_keys(conversation_key, &nonce)?;
    hmac_aad(&keys.hmac_key, &nonce, ciphertext)?
        .verify_slice(mac)
        .map_err(|_| Nip44Error::InvalidMac)?;

    let mut buffer = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    unpad(&buffer)
}

/// Encrypt `plaintext` from `secret_key` to the hex `public_key`.
pub fn encrypt(secret_key: &[u8; 32], public_key: &str, plaintext: &str) -> Result<String, Nip44Error> {
    let conversation_key = get_conversation_key(secret_key, public_key)?;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_with_conversation_key(&conversation_key, plaintext, &nonce)
}

/// Decrypt a NIP-44 payload sent by `public_key` to `secret_key`.
pub fn decrypt(secret_key: &[u8; 32], public_key: &str, payload: &str) -> Result<String, Nip44Error> {
    let conversation_key = get_conversation_key(secret_key, public_key)?;
    decrypt_with_conversation_key(&conversation_key, payload)
}
