//! The two payload encryption schemes and an ordered preference between them.

use crate::nip04::{self, Nip04Error};
use crate::nip44::{self, Nip44Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Payload encryption scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionScheme {
    /// AES-256-CBC, the older scheme
    Nip04,
    /// ChaCha20 + HMAC-SHA256, versioned
    Nip44,
}

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("nip04: {0}")]
    Nip04(#[from] Nip04Error),

    #[error("nip44: {0}")]
    Nip44(#[from] Nip44Error),

    #[error("no encryption scheme could decrypt the payload ({0})")]
    AllSchemesFailed(String),
}

impl EncryptionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nip04 => "nip04",
            Self::Nip44 => "nip44",
        }
    }

    pub fn encrypt(
        &self,
        secret_key: &[u8; 32],
        public_key: &str,
        plaintext: &str,
    ) -> Result<String, EncryptionError> {
        Ok(match self {
            Self::Nip04 => nip04::encrypt(secret_key, public_key, plaintext)?,
            Self::Nip44 => nip44::encrypt(secret_key, public_key, plaintext)?,
        })
    }

    pub fn decrypt(
        &self,
        secret_key: &[u8; 32],
        public_key: &str,
        payload: &str,
    ) -> Result<String, EncryptionError> {
        Ok(match self {
            Self::Nip04 => nip04::decrypt(secret_key, public_key, payload)?,
            Self::Nip44 => nip44::decrypt(secret_key, public_key, payload)?,
        })
    }
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schemes in the order they are tried. The first entry is used for
/// outgoing payloads; a successful decrypt with a later entry moves that
/// entry to the front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemePriority {
    schemes: Vec<EncryptionScheme>,
}

impl SchemePriority {
    /// NIP-44 first, NIP-04 as fallback.
    pub fn dual() -> Self {
        Self {
            schemes: vec![EncryptionScheme::Nip44, EncryptionScheme::Nip04],
        }
    }

    /// NIP-04 first, NIP-44 as fallback.
    pub fn dual_nip04_first() -> Self {
        Self {
            schemes: vec![EncryptionScheme::Nip04, EncryptionScheme::Nip44],
        }
    }

    /// Only the older scheme.
    pub fn nip04_only() -> Self {
        Self {
            schemes: vec![EncryptionScheme::Nip04],
        }
    }

    pub fn preferred(&self) -> EncryptionScheme {
        self.schemes[0]
    }

    pub fn schemes(&self) -> &[EncryptionScheme] {
        &self.schemes
    }

    pub fn contains(&self, scheme: EncryptionScheme) -> bool {
        self.schemes.contains(&scheme)
    }

    /// Move `scheme` to the front. Schemes outside the list are ignored.
    pub fn promote(&mut self, scheme: EncryptionScheme) {
        if let Some(pos) = self.schemes.iter().position(|s| *s == scheme) {
            let entry = self.schemes.remove(pos);
            self.schemes.insert(0, entry);
        }
    }

    /// Try each scheme in order; on success promote the one that worked.
    pub fn decrypt(
        &mut self,
        secret_key: &[u8; 32],
        public_key: &str,
        payload: &str,
    ) -> Result<(String, EncryptionScheme), EncryptionError> {
        let mut failures = Vec::with_capacity(self.schemes.len());
        for scheme in self.schemes.clone() {
            match scheme.decrypt(secret_key, public_key, payload) {
                Ok(plaintext) => {
                    self.promote(scheme);
                    return Ok((plaintext, scheme));
                }
                Err(e) => failures.push(e.to_string()),
            }
        }
        Err(EncryptionError::AllSchemesFailed(failures.join("; ")))
    }
}

impl Default for SchemePriority {
    fn default() -> Self {
        Self::dual()
    }
}
