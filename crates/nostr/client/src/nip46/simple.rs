//! NIP-04-only remote signing.
//!
//! For signers and apps that predate NIP-44: both roles speak only NIP-04,
//! never issue or expect auth challenges and do not offer the `nip44_*`
//! methods.

use super::bunker::{Bunker, BunkerConfig};
use super::client::{RemoteSignerClient, RemoteSignerConfig};
use crate::error::Result;
use crate::relay::RelayConfig;
use nostr::{BunkerUrl, Event, EventTemplate, Keys, SchemePriority};

/// Bunker restricted to NIP-04.
pub struct SimpleBunker {
    bunker: Bunker,
}

impl SimpleBunker {
    pub fn new(
        transport_keys: Keys,
        user_keys: Keys,
        relays: Vec<String>,
        secret: Option<String>,
        default_permissions: Vec<String>,
    ) -> Self {
        Self::with_relay_config(
            transport_keys,
            user_keys,
            relays,
            secret,
            default_permissions,
            RelayConfig::default(),
        )
    }

    pub fn with_relay_config(
        transport_keys: Keys,
        user_keys: Keys,
        relays: Vec<String>,
        secret: Option<String>,
        default_permissions: Vec<String>,
        relay_config: RelayConfig,
    ) -> Self {
        let mut config = BunkerConfig::new(relays)
            .schemes(SchemePriority::nip04_only())
            .nip44_methods(false)
            .default_permissions(default_permissions)
            .relay_config(relay_config);
        config.secret = secret;
        Self {
            bunker: Bunker::new(transport_keys, user_keys, config),
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.bunker.start().await
    }

    pub async fn stop(&self) {
        self.bunker.stop().await;
    }

    pub fn bunker_url(&self) -> BunkerUrl {
        self.bunker.bunker_url()
    }

    pub fn public_key(&self) -> &str {
        self.bunker.public_key()
    }

    pub fn user_public_key(&self) -> &str {
        self.bunker.user_public_key()
    }

    pub fn has_session(&self, client_pubkey: &str) -> bool {
        self.bunker.has_session(client_pubkey)
    }
}

/// Remote signer client restricted to NIP-04.
pub struct SimpleRemoteSigner {
    client: RemoteSignerClient,
}

impl SimpleRemoteSigner {
    pub fn new(permissions: Vec<String>) -> Self {
        Self::with_config(RemoteSignerConfig::default().permissions(permissions))
    }

    /// Keeps the timeouts and relay settings of `config`; the scheme list is
    /// forced to NIP-04.
    pub fn with_config(config: RemoteSignerConfig) -> Self {
        Self {
            client: RemoteSignerClient::new(config.schemes(SchemePriority::nip04_only())),
        }
    }

    pub fn public_key(&self) -> &str {
        self.client.public_key()
    }

    pub async fn connect(&self, bunker: &BunkerUrl) -> Result<String> {
        self.client.connect_bunker(bunker).await
    }

    pub async fn get_public_key(&self) -> Result<String> {
        self.client.get_public_key().await
    }

    pub async fn sign_event(&self, template: &EventTemplate) -> Result<Event> {
        self.client.sign_event(template).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }

    pub async fn nip04_encrypt(&self, third_party: &str, plaintext: &str) -> Result<String> {
        self.client.nip04_encrypt(third_party, plaintext).await
    }

    pub async fn nip04_decrypt(&self, third_party: &str, ciphertext: &str) -> Result<String> {
        self.client.nip04_decrypt(third_party, ciphertext).await
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::EncryptionScheme;

    #[test]
    fn test_simple_roles_use_nip04_only() {
        let bunker = SimpleBunker::new(
            Keys::generate(),
            Keys::generate(),
            vec!["wss://relay.example.com".to_string()],
            Some("secret".to_string()),
            vec![],
        );
        let config = bunker.bunker.config();
        assert_eq!(config.schemes, SchemePriority::nip04_only());
        assert!(!config.nip44_methods);
        assert!(config.auth_challenge.is_none());
        assert_eq!(bunker.bunker_url().secret.as_deref(), Some("secret"));

        let signer = SimpleRemoteSigner::new(vec!["sign_event:1".to_string()]);
        assert_eq!(signer.client.preferred_scheme(), EncryptionScheme::Nip04);
    }
}
