//! NIP-46: Nostr Remote Signing.
//!
//! Wire-level pieces shared by both roles: the reserved event kind, the JSON
//! request/response envelopes carried (encrypted) in event content, the
//! method names, permission strings and the two connection-string formats:
//!
//! - `bunker://<signer-pubkey>?relay=<url>&relay=<url>&secret=<token>`
//! - `nostrconnect://<client-pubkey>?relay=<url>&secret=<token>&perms=<list>&name=&url=&image=`

use crate::nip01::Event;
use crate::validation::is_lower_hex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Reserved kind for remote-signing transport events.
pub const KIND_NOSTR_CONNECT: u16 = 24133;

pub const BUNKER_SCHEME: &str = "bunker";
pub const NOSTR_CONNECT_SCHEME: &str = "nostrconnect";

/// Errors that can occur during NIP-46 operations.
#[derive(Debug, Error)]
pub enum Nip46Error {
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("connection url has no relay")]
    MissingRelay,

    #[error("connection url has no secret")]
    MissingSecret,

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Methods a remote signer answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NostrConnectMethod {
    Connect,
    GetPublicKey,
    SignEvent,
    Ping,
    Nip04Encrypt,
    Nip04Decrypt,
    Nip44Encrypt,
    Nip44Decrypt,
}

impl NostrConnectMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            NostrConnectMethod::Connect => "connect",
            NostrConnectMethod::GetPublicKey => "get_public_key",
            NostrConnectMethod::SignEvent => "sign_event",
            NostrConnectMethod::Ping => "ping",
            NostrConnectMethod::Nip04Encrypt => "nip04_encrypt",
            NostrConnectMethod::Nip04Decrypt => "nip04_decrypt",
            NostrConnectMethod::Nip44Encrypt => "nip44_encrypt",
            NostrConnectMethod::Nip44Decrypt => "nip44_decrypt",
        }
    }
}

impl FromStr for NostrConnectMethod {
    type Err = Nip46Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(NostrConnectMethod::Connect),
            "get_public_key" => Ok(NostrConnectMethod::GetPublicKey),
            "sign_event" => Ok(NostrConnectMethod::SignEvent),
            "ping" => Ok(NostrConnectMethod::Ping),
            "nip04_encrypt" => Ok(NostrConnectMethod::Nip04Encrypt),
            "nip04_decrypt" => Ok(NostrConnectMethod::Nip04Decrypt),
            "nip44_encrypt" => Ok(NostrConnectMethod::Nip44Encrypt),
            "nip44_decrypt" => Ok(NostrConnectMethod::Nip44Decrypt),
            _ => Err(Nip46Error::UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for NostrConnectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Random id for a request envelope.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `{id, method, params}`; `method` stays a string so unknown methods can be
/// answered with an error instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrConnectRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl NostrConnectRequest {
    pub fn new(method: NostrConnectMethod, params: Vec<String>) -> Self {
        Self {
            id: generate_request_id(),
            method: method.as_str().to_string(),
            params,
        }
    }

    pub fn method(&self) -> Result<NostrConnectMethod, Nip46Error> {
        self.method.parse()
    }

    pub fn to_json(&self) -> Result<String, Nip46Error> {
        serde_json::to_string(self).map_err(|e| Nip46Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, Nip46Error> {
        serde_json::from_str(json).map_err(|e| Nip46Error::Serialization(e.to_string()))
    }
}

/// `{id, result?, error?, auth_url?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrConnectResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
}

impl NostrConnectResponse {
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
            auth_url: None,
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
            auth_url: None,
        }
    }

    pub fn auth_challenge(id: impl Into<String>, auth_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: None,
            auth_url: Some(auth_url.into()),
        }
    }

    /// Challenge URL, from the explicit field or the `result: "auth_url"`
    /// convention where the URL travels in `error`.
    pub fn challenge_url(&self) -> Option<&str> {
        if let Some(url) = self.auth_url.as_deref() {
            return Some(url);
        }
        match self.result.as_deref() {
            Some("auth_url") => self.error.as_deref(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, Nip46Error> {
        serde_json::to_string(self).map_err(|e| Nip46Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, Nip46Error> {
        serde_json::from_str(json).map_err(|e| Nip46Error::Serialization(e.to_string()))
    }
}

/// Whether an event is a remote-signing transport event.
pub fn is_nostr_connect_event(event: &Event) -> bool {
    event.kind == KIND_NOSTR_CONNECT
}

/// Split a comma-delimited permission list, trimming blanks.
pub fn parse_permissions(perms: &str) -> Vec<String> {
    perms
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Permission string allowing `sign_event` for one kind.
pub fn sign_event_permission(kind: u16) -> String {
    format!("sign_event:{kind}")
}

fn parse_connection_url(input: &str, scheme: &str) -> Result<(String, Url), Nip46Error> {
    let url = Url::parse(input).map_err(|e| Nip46Error::InvalidUrl(e.to_string()))?;
    if url.scheme() != scheme {
        return Err(Nip46Error::InvalidUrl(format!(
            "expected {scheme}:// but got {}://",
            url.scheme()
        )));
    }
    let pubkey = url
        .host_str()
        .ok_or_else(|| Nip46Error::InvalidPublicKey("missing".to_string()))?
        .to_lowercase();
    if !is_lower_hex(&pubkey, 64) {
        return Err(Nip46Error::InvalidPublicKey(pubkey));
    }
    Ok((pubkey, url))
}

fn query_values(url: &Url, key: &str) -> Vec<String> {
    url.query_pairs()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
        .collect()
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    query_values(url, key).into_iter().next()
}

/// `bunker://` connection string: the signer advertises itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUrl {
    pub remote_signer_pubkey: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

impl BunkerUrl {
    pub fn new(remote_signer_pubkey: impl Into<String>, relays: Vec<String>) -> Self {
        Self {
            remote_signer_pubkey: remote_signer_pubkey.into(),
            relays,
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn parse(input: &str) -> Result<Self, Nip46Error> {
        let (pubkey, url) = parse_connection_url(input, BUNKER_SCHEME)?;
        let relays = query_values(&url, "relay");
        if relays.is_empty() {
            return Err(Nip46Error::MissingRelay);
        }
        Ok(Self {
            remote_signer_pubkey: pubkey,
            relays,
            secret: query_value(&url, "secret"),
        })
    }
}

impl FromStr for BunkerUrl {
    type Err = Nip46Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BunkerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay);
        }
        if let Some(secret) = &self.secret {
            query.append_pair("secret", secret);
        }
        write!(
            f,
            "{BUNKER_SCHEME}://{}?{}",
            self.remote_signer_pubkey,
            query.finish()
        )
    }
}

/// `nostrconnect://` connection string: the client advertises itself and
/// waits for a signer to answer with the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NostrConnectUrl {
    pub client_pubkey: String,
    pub relays: Vec<String>,
    pub secret: String,
    pub perms: Vec<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub image: Option<String>,
}

impl NostrConnectUrl {
    pub fn new(client_pubkey: impl Into<String>, relays: Vec<String>, secret: impl Into<String>) -> Self {
        Self {
            client_pubkey: client_pubkey.into(),
            relays,
            secret: secret.into(),
            perms: Vec::new(),
            name: None,
            url: None,
            image: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, Nip46Error> {
        let (pubkey, url) = parse_connection_url(input, NOSTR_CONNECT_SCHEME)?;
        let relays = query_values(&url, "relay");
        if relays.is_empty() {
            return Err(Nip46Error::MissingRelay);
        }
        let secret = query_value(&url, "secret").ok_or(Nip46Error::MissingSecret)?;
        Ok(Self {
            client_pubkey: pubkey,
            relays,
            secret,
            perms: query_value(&url, "perms")
                .map(|p| parse_permissions(&p))
                .unwrap_or_default(),
            name: query_value(&url, "name"),
            url: query_value(&url, "url"),
            image: query_value(&url, "image"),
        })
    }
}

impl FromStr for NostrConnectUrl {
    type Err = Nip46Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NostrConnectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay);
        }
        query.append_pair("secret", &self.secret);
        if !self.perms.is_empty() {
            query.append_pair("perms", &self.perms.join(","));
        }
        if let Some(name) = &self.name {
            query.append_pair("name", name);
        }
        if let Some(url) = &self.url {
            query.append_pair("url", url);
        }
        if let Some(image) = &self.image {
            query.append_pair("image", image);
        }
        write!(
            f,
            "{NOSTR_CONNECT_SCHEME}://{}?{}",
            self.client_pubkey,
            query.finish()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PK: &str = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";

    #[test]
    fn test_method_names() {
        for method in [
            NostrConnectMethod::Connect,
            NostrConnectMethod::GetPublicKey,
            NostrConnectMethod::SignEvent,
            NostrConnectMethod::Ping,
            NostrConnectMethod::Nip04Encrypt,
            NostrConnectMethod::Nip04Decrypt,
            NostrConnectMethod::Nip44Encrypt,
            NostrConnectMethod::Nip44Decrypt,
        ] {
            assert_eq!(method.as_str().parse::<NostrConnectMethod>().unwrap(), method);
        }
        assert!(matches!(
            "describe".parse::<NostrConnectMethod>(),
            Err(Nip46Error::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_request_json_shape() {
        let request = NostrConnectRequest {
            id: "abc".to_string(),
            method: "sign_event".to_string(),
            params: vec!["{}".to_string()],
        };
        assert_eq!(
            request.to_json().unwrap(),
            r#"{"id":"abc","method":"sign_event","params":["{}"]}"#
        );
        assert_eq!(NostrConnectRequest::from_json(&request.to_json().unwrap()).unwrap(), request);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = NostrConnectRequest::new(NostrConnectMethod::Ping, vec![]);
        let b = NostrConnectRequest::new(NostrConnectMethod::Ping, vec![]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.method().unwrap(), NostrConnectMethod::Ping);
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(
            NostrConnectResponse::ok("1", "pong").to_json().unwrap(),
            r#"{"id":"1","result":"pong"}"#
        );
        assert_eq!(
            NostrConnectResponse::error("1", "unauthorized").to_json().unwrap(),
            r#"{"id":"1","error":"unauthorized"}"#
        );

        let challenge = NostrConnectResponse::auth_challenge("1", "https://auth.example/x");
        assert_eq!(challenge.challenge_url(), Some("https://auth.example/x"));

        let legacy = NostrConnectResponse::from_json(
            r#"{"id":"1","result":"auth_url","error":"https://auth.example/y"}"#,
        )
        .unwrap();
        assert_eq!(legacy.challenge_url(), Some("https://auth.example/y"));
        assert_eq!(NostrConnectResponse::ok("1", "ack").challenge_url(), None);
    }

    #[test]
    fn test_parse_permissions() {
        assert_eq!(
            parse_permissions(" sign_event:1, nip44_encrypt ,,ping"),
            vec!["sign_event:1", "nip44_encrypt", "ping"]
        );
        assert!(parse_permissions("").is_empty());
        assert_eq!(sign_event_permission(30023), "sign_event:30023");
    }

    #[test]
    fn test_bunker_url_parse() {
        let url = BunkerUrl::parse(&format!(
            "bunker://{PK}?relay=wss%3A%2F%2Frelay.one&relay=wss://relay.two&secret=s3cr3t"
        ))
        .unwrap();
        assert_eq!(url.remote_signer_pubkey, PK);
        assert_eq!(url.relays, vec!["wss://relay.one", "wss://relay.two"]);
        assert_eq!(url.secret.as_deref(), Some("s3cr3t"));

        let reparsed: BunkerUrl = url.to_string().parse().unwrap();
        assert_eq!(reparsed, url);
    }

    #[test]
    fn test_bunker_url_errors() {
        assert!(matches!(
            BunkerUrl::parse(&format!("bunker://{PK}")),
            Err(Nip46Error::MissingRelay)
        ));
        assert!(matches!(
            BunkerUrl::parse("bunker://nothex?relay=wss://r"),
            Err(Nip46Error::InvalidPublicKey(_))
        ));
        assert!(matches!(
            BunkerUrl::parse(&format!("nostrconnect://{PK}?relay=wss://r")),
            Err(Nip46Error::InvalidUrl(_))
        ));
        assert!(BunkerUrl::parse("not a url").is_err());
    }

    #[test]
    fn test_nostrconnect_url_roundtrip() {
        let mut url = NostrConnectUrl::new(PK, vec!["wss://relay.one".to_string()], "token");
        url.perms = vec!["sign_event:1".to_string(), "nip44_encrypt".to_string()];
        url.name = Some("My App".to_string());
        url.url = Some("https://app.example".to_string());

        let text = url.to_string();
        assert!(text.starts_with(&format!("nostrconnect://{PK}?")));

        let parsed = NostrConnectUrl::parse(&text).unwrap();
        assert_eq!(parsed, url);
    }

    #[test]
    fn test_nostrconnect_url_requires_secret() {
        assert!(matches!(
            NostrConnectUrl::parse(&format!("nostrconnect://{PK}?relay=wss://r")),
            Err(Nip46Error::MissingSecret)
        ));
    }
}
