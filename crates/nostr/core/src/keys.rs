//! Key handling and the secp256k1 primitives everything else is built on.
//!
//! Public keys are 32-byte x-only keys encoded as 64 lowercase hex characters,
//! signatures are 64-byte BIP-340 Schnorr signatures (128 hex characters).

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, PublicKey, SecretKey, XOnlyPublicKey, ecdh, schnorr};
use rand::RngCore;
use thiserror::Error;

/// Errors produced by key parsing, signing and key agreement.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid message digest: {0}")]
    InvalidDigest(String),
}

/// A secret key together with its hex-encoded x-only public key.
#[derive(Clone)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        loop {
            let secret_key = generate_secret_key();
            if let Ok(keys) = Self::new(secret_key) {
                return keys;
            }
        }
    }

    /// Build from raw secret key bytes.
    pub fn new(secret_key: [u8; 32]) -> Result<Self, KeyError> {
        let public_key = get_public_key_hex(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Build from a 64-character hex secret key.
    pub fn from_hex(secret_key: &str) -> Result<Self, KeyError> {
        Self::new(parse_secret_key(secret_key)?)
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Decode a hex secret key into bytes, checking it is a valid scalar.
pub fn parse_secret_key(secret_key: &str) -> Result<[u8; 32], KeyError> {
    let bytes = hex::decode(secret_key).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KeyError::InvalidSecretKey("expected 32 bytes".to_string()))?;
    SecretKey::from_slice(&key).map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?;
    Ok(key)
}

/// Get the public key (x-only, 32 bytes) from a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], KeyError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, KeyError> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// SHA-256 digest of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(data).to_byte_array()
}

/// Produce a Schnorr signature (hex) over a 32-byte digest.
pub fn sign_schnorr(digest: &[u8; 32], secret_key: &[u8; 32]) -> Result<String, KeyError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?;
    let message =
        Message::from_digest_slice(digest).map_err(|e| KeyError::InvalidDigest(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);
    Ok(hex::encode(sig.serialize()))
}

/// Check a hex Schnorr signature over a digest against a hex x-only public key.
///
/// Malformed hex of any argument is reported as a failed verification.
pub fn verify_schnorr(sig: &str, digest: &[u8; 32], public_key: &str) -> bool {
    let secp = Secp256k1::verification_only();

    let Ok(message) = Message::from_digest_slice(digest) else {
        return false;
    };
    let Some(sig) = hex::decode(sig)
        .ok()
        .and_then(|bytes| schnorr::Signature::from_slice(&bytes).ok())
    else {
        return false;
    };
    let Ok(pubkey) = parse_xonly_public_key(public_key) else {
        return false;
    };

    secp.verify_schnorr(&sig, &message, &pubkey).is_ok()
}

/// Parse a 64-character hex x-only public key.
pub fn parse_xonly_public_key(public_key: &str) -> Result<XOnlyPublicKey, KeyError> {
    let bytes = hex::decode(public_key).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

/// ECDH shared secret: the x coordinate of `secret_key * public_key`.
///
/// Accepts either a 64-character x-only key (even parity assumed, as nostr
/// keys carry no parity) or a 66-character compressed key.
pub fn shared_secret(secret_key: &[u8; 32], public_key: &str) -> Result<[u8; 32], KeyError> {
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?;
    let bytes = hex::decode(public_key).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    let compressed = match bytes.len() {
        32 => {
            let mut full = Vec::with_capacity(33);
            full.push(0x02);
            full.extend_from_slice(&bytes);
            full
        }
        33 => bytes,
        n => {
            return Err(KeyError::InvalidPublicKey(format!(
                "expected 32 or 33 bytes, got {n}"
            )));
        }
    };
    let pk = PublicKey::from_slice(&compressed)
        .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;

    let point = ecdh::shared_secret_point(&pk, &sk);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    Ok(x)
}
