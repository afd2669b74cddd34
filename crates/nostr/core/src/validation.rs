//! Structural event validation.
//!
//! This is the cheap, synchronous half of event validation: shapes, lengths,
//! timestamp window and per-tag format rules. The cryptographic half lives in
//! [`crate::nip01::verify_event`].

use crate::nip01::Event;
use crate::nip33::parse_address;
use crate::nip46::KIND_NOSTR_CONNECT;
use thiserror::Error;

/// Events may be at most this many seconds ahead of the local clock.
pub const MAX_FUTURE_SECONDS: u64 = 3600;

/// Malformed input, always naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// True if `value` is exactly `len` lowercase hex characters.
pub fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Require a 64-character lowercase hex id (event id or public key).
pub fn validate_hex_id(field: &str, value: &str) -> Result<(), ValidationError> {
    if is_lower_hex(value, 64) {
        Ok(())
    } else {
        Err(ValidationError::new(
            field,
            format!("expected 64 lowercase hex characters, got {value:?}"),
        ))
    }
}

/// Every tag must be a non-empty array whose first element names the tag.
pub fn validate_tags(tags: &[Vec<String>]) -> Result<(), ValidationError> {
    for (i, tag) in tags.iter().enumerate() {
        match tag.first() {
            None => return Err(ValidationError::new(format!("tags[{i}]"), "empty tag")),
            Some(name) if name.is_empty() => {
                return Err(ValidationError::new(format!("tags[{i}]"), "empty tag name"));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Structural checks on a received event, relative to `now` (unix seconds).
pub fn validate_event_structure(event: &Event, now: u64) -> Result<(), ValidationError> {
    validate_hex_id("id", &event.id)?;
    validate_hex_id("pubkey", &event.pubkey)?;
    if !is_lower_hex(&event.sig, 128) {
        return Err(ValidationError::new(
            "sig",
            "expected 128 lowercase hex characters",
        ));
    }

    if event.created_at > now.saturating_add(MAX_FUTURE_SECONDS) {
        return Err(ValidationError::new(
            "created_at",
            format!(
                "{} is more than {}s in the future",
                event.created_at, MAX_FUTURE_SECONDS
            ),
        ));
    }

    validate_tags(&event.tags)?;

    for (i, tag) in event.tags.iter().enumerate() {
        let Some(value) = tag.get(1) else {
            continue;
        };
        match tag[0].as_str() {
            "e" | "p" => validate_hex_id(&format!("tags[{i}]"), value)?,
            "a" => {
                parse_address(value).map_err(|e| {
                    ValidationError::new(format!("tags[{i}]"), e.to_string())
                })?;
            }
            _ => {}
        }
    }

    // Remote-signing transport: content is ciphertext, but a recipient is mandatory.
    if event.kind == KIND_NOSTR_CONNECT && !event.tags.iter().any(|t| t[0] == "p" && t.len() > 1)
    {
        return Err(ValidationError::new(
            "tags",
            format!("kind {KIND_NOSTR_CONNECT} requires a p tag"),
        ));
    }

    Ok(())
}
