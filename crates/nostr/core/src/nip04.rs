//! NIP-04: Encrypted Direct Messages.
//!
//! AES-256-CBC keyed with the raw ECDH x coordinate. The payload format is
//! `base64(ciphertext) + "?iv=" + base64(iv)`.

use crate::keys::{KeyError, shared_secret};
use crate::nip01::EventTemplate;
use crate::validation::validate_hex_id;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Kind for NIP-04 direct messages.
pub const ENCRYPTED_DM_KIND: u16 = 4;

const IV_SEPARATOR: &str = "?iv=";

/// Errors that can occur during NIP-04 operations.
#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Encrypt `plaintext` from `secret_key` to the hex `public_key`.
pub fn encrypt(secret_key: &[u8; 32], public_key: &str, plaintext: &str) -> Result<String, Nip04Error> {
    let key = shared_secret(secret_key, public_key)?;

    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new(&key.into(), &iv.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}{}{}",
        BASE64.encode(ciphertext),
        IV_SEPARATOR,
        BASE64.encode(iv)
    ))
}

/// Decrypt a NIP-04 payload sent by `public_key` to `secret_key`.
pub fn decrypt(secret_key: &[u8; 32], public_key: &str, payload: &str) -> Result<String, Nip04Error> {
    let (ciphertext, iv) = payload
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| Nip04Error::InvalidPayload("missing ?iv= separator".to_string()))?;

    let ciphertext = BASE64
        .decode(ciphertext)
        .map_err(|e| Nip04Error::InvalidPayload(format!("ciphertext: {e}")))?;
    let iv: [u8; 16] = BASE64
        .decode(iv)
        .map_err(|e| Nip04Error::InvalidPayload(format!("iv: {e}")))?
        .try_into()
        .map_err(|_| Nip04Error::InvalidPayload("iv must be 16 bytes".to_string()))?;

    let key = shared_secret(secret_key, public_key)?;
    let cipher = Aes256CbcDec::new(&key.into(), &iv.into());
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::Decryption("bad padding".to_string()))?;

    String::from_utf8(plaintext).map_err(|e| Nip04Error::Decryption(e.to_string()))
}

/// Template for a kind 4 direct message, content encrypted to `recipient`.
pub fn direct_message(
    secret_key: &[u8; 32],
    recipient: &str,
    plaintext: &str,
    reply_to: Option<&str>,
) -> Result<EventTemplate, Nip04Error> {
    validate_hex_id("recipient", recipient)
        .map_err(|e| Nip04Error::InvalidPayload(e.to_string()))?;

    let mut tags = vec![vec!["p".to_string(), recipient.to_string()]];
    if let Some(event_id) = reply_to {
        tags.push(vec!["e".to_string(), event_id.to_string()]);
    }

    let content = encrypt(secret_key, recipient, plaintext)?;
    Ok(EventTemplate::new(ENCRYPTED_DM_KIND, tags, content))
}
