//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical serialization for hashing
//! - Event signing and verification with Schnorr signatures
//! - Kind classification (regular, replaceable, ephemeral, addressable)
//! - The delivery order shared by relay connections and tables
//! - Template builders for common kinds

use crate::keys::{KeyError, get_public_key_hex, sha256, sign_schnorr, verify_schnorr};
use crate::validation::{ValidationError, validate_hex_id, validate_tags};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// The hashed part of the event.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Values (second element) of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// A template for creating events. The pubkey comes from the signing key and
/// `created_at` defaults to the current time when left unset.
///
/// ```
/// use nostr::{EventTemplate, KIND_SHORT_TEXT_NOTE, finalize_event, generate_secret_key};
///
/// let template = EventTemplate::new(
///     KIND_SHORT_TEXT_NOTE,
///     vec![vec!["t".to_string(), "nostr".to_string()]],
///     "Hello Nostr!",
/// );
/// let event = finalize_event(&template, &generate_secret_key()).unwrap();
/// assert_eq!(event.content, "Hello Nostr!");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    /// Unix timestamp in seconds; `None` means "now" at signing time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    #[serde(default)]
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            created_at: None,
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Pin the timestamp instead of using the signing time.
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Event kind classification according to NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Events expected to be stored by relays
    Regular,
    /// Only latest event per pubkey+kind is stored
    Replaceable,
    /// Not expected to be stored by relays
    Ephemeral,
    /// Only latest event per pubkey+kind+d-tag is stored
    Addressable,
    /// Unknown classification
    Unknown,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_RECOMMEND_RELAY: u16 = 2;
pub const KIND_CONTACTS: u16 = 3;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Validate an unsigned event before it is serialized for hashing.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> Result<(), ValidationError> {
    validate_hex_id("pubkey", &event.pubkey)?;
    validate_tags(&event.tags)
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    validate_unsigned_event(event)?;

    let serialized = serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))?;

    Ok(serialized)
}

/// Get the event hash (id) from an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(hex::encode(sha256(serialized.as_bytes())))
}

/// Sign an event template with a secret key, producing a complete signed event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    validate_tags(&template.tags)?;

    let unsigned = UnsignedEvent {
        pubkey: get_public_key_hex(secret_key)?,
        created_at: template.created_at.unwrap_or_else(unix_now),
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    let id = get_event_hash(&unsigned)?;
    let digest = decode_id(&id).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let sig = sign_schnorr(&digest, secret_key)?;

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig,
    })
}

fn decode_id(id: &str) -> Result<[u8; 32], Nip01Error> {
    let bytes = hex::decode(id).map_err(|e| Nip01Error::InvalidEvent(format!("id: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Nip01Error::InvalidEvent("id must be 32 bytes".to_string()))
}

/// Recompute the id and check the signature, explaining any failure.
pub fn verify_event_integrity(event: &Event) -> Result<(), Nip01Error> {
    let computed_id = get_event_hash(&event.unsigned())?;
    if computed_id != event.id {
        return Err(Nip01Error::InvalidEvent(format!(
            "id mismatch: expected {computed_id}, got {}",
            event.id
        )));
    }

    let digest = decode_id(&event.id)?;
    if !verify_schnorr(&event.sig, &digest, &event.pubkey) {
        return Err(Nip01Error::InvalidSignature(format!(
            "signature does not verify for event {}",
            event.id
        )));
    }

    Ok(())
}

/// Verify an event's signature and id.
pub fn verify_event(event: &Event) -> bool {
    verify_event_integrity(event).is_ok()
}

/// Classify an event kind according to NIP-01 rules.
pub fn classify_kind(kind: u16) -> KindClassification {
    let k = kind as u32;

    // Regular: 1000 <= n < 10000 || 4 <= n < 45 || n == 1 || n == 2
    if (1000..10000).contains(&k) || (4..45).contains(&k) || k == 1 || k == 2 {
        return KindClassification::Regular;
    }

    // Replaceable: 10000 <= n < 20000 || n == 0 || n == 3
    if (10000..20000).contains(&k) || k == 0 || k == 3 {
        return KindClassification::Replaceable;
    }

    // Ephemeral: 20000 <= n < 30000
    if (20000..30000).contains(&k) {
        return KindClassification::Ephemeral;
    }

    // Addressable: 30000 <= n < 40000
    if (30000..40000).contains(&k) {
        return KindClassification::Addressable;
    }

    KindClassification::Unknown
}

/// Check if a kind is regular.
pub fn is_regular_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Regular)
}

/// Check if a kind is replaceable.
pub fn is_replaceable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Replaceable)
}

/// Check if a kind is ephemeral.
pub fn is_ephemeral_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Ephemeral)
}

/// Check if a kind is addressable.
pub fn is_addressable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Addressable)
}

/// Delivery order: newest first, lower id first on equal timestamps.
pub fn compare_events(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort events in reverse-chronological order by created_at,
/// then by ascending id in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(compare_events);
}

/// Whether `candidate` replaces `current` under replaceable-event rules:
/// strictly newer, or same second with a lexically smaller id.
pub fn supersedes(candidate: &Event, current: &Event) -> bool {
    candidate.created_at > current.created_at
        || (candidate.created_at == current.created_at && candidate.id < current.id)
}

/// Template for a kind 1 text note.
pub fn text_note(content: impl Into<String>, tags: Vec<Vec<String>>) -> EventTemplate {
    EventTemplate::new(KIND_SHORT_TEXT_NOTE, tags, content)
}

/// Profile metadata carried as JSON in kind 0 content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

/// Template for a kind 0 metadata event.
pub fn metadata(metadata: &Metadata) -> Result<EventTemplate, Nip01Error> {
    let content =
        serde_json::to_string(metadata).map_err(|e| Nip01Error::Serialization(e.to_string()))?;
    Ok(EventTemplate::new(KIND_METADATA, vec![], content))
}
