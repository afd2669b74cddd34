//! NIP-33: Addressable events (formerly parameterized replaceable events).
//!
//! Events with kinds in `30000..=39999` are identified by `(kind, pubkey, d)`
//! where `d` is the value of the event's `["d", "<identifier>"]` tag. They are
//! referenced from other events with `["a", "<kind>:<pubkey>:<d>"]`.
//!
//! ```
//! use nostr::{addressable_event, create_address, parse_address};
//!
//! let template = addressable_event(30023, "my-article", "# Title", vec![]).unwrap();
//! assert_eq!(template.tags[0], vec!["d".to_string(), "my-article".to_string()]);
//!
//! let pk = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";
//! let address = create_address(30023, pk, "my-article");
//! let (kind, pubkey, d) = parse_address(&address).unwrap();
//! assert_eq!((kind, pubkey.as_str(), d.as_str()), (30023, pk, "my-article"));
//! ```

use crate::nip01::{Event, EventTemplate};
use crate::validation::{ValidationError, is_lower_hex, validate_tags};
use thiserror::Error;

/// Minimum kind for addressable events
pub const ADDRESSABLE_KIND_MIN: u16 = 30000;

/// Maximum kind for addressable events (inclusive)
pub const ADDRESSABLE_KIND_MAX: u16 = 39999;

/// Tag name for the d-identifier
pub const D_TAG: &str = "d";

/// Errors that can occur during NIP-33 operations.
#[derive(Debug, Error)]
pub enum Nip33Error {
    #[error("event is not addressable (kind must be 30000-39999)")]
    NotAddressable,

    #[error("missing required d tag")]
    MissingDTag,

    #[error("invalid address format: {0}")]
    InvalidAddress(String),
}

fn is_addressable_range(kind: u16) -> bool {
    (ADDRESSABLE_KIND_MIN..=ADDRESSABLE_KIND_MAX).contains(&kind)
}

/// Get the d tag value of an event, if any.
pub fn get_d_tag(event: &Event) -> Option<String> {
    event
        .tags
        .iter()
        .find(|tag| tag.first().map(|s| s.as_str()) == Some(D_TAG))
        .and_then(|tag| tag.get(1))
        .map(|s| s.to_string())
}

/// Format `<kind>:<pubkey>:<d-tag-value>`.
pub fn create_address(kind: u16, pubkey: &str, d_tag: &str) -> String {
    format!("{}:{}:{}", kind, pubkey, d_tag)
}

/// Split an `a` tag value into `(kind, pubkey, identifier)`.
///
/// The identifier may itself contain colons and may be empty. The kind is not
/// restricted to the addressable range since `a` tags also point at plain
/// replaceable events (with an empty identifier).
pub fn parse_address(address: &str) -> Result<(u16, String, String), Nip33Error> {
    let parts: Vec<&str> = address.splitn(3, ':').collect();

    if parts.len() != 3 {
        return Err(Nip33Error::InvalidAddress(
            "address must have format kind:pubkey:identifier".to_string(),
        ));
    }

    let kind = parts[0]
        .parse::<u16>()
        .map_err(|_| Nip33Error::InvalidAddress(format!("invalid kind {:?}", parts[0])))?;

    if !is_lower_hex(parts[1], 64) {
        return Err(Nip33Error::InvalidAddress(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    Ok((kind, parts[1].to_string(), parts[2].to_string()))
}

/// Address of an addressable event.
pub fn get_event_address(event: &Event) -> Result<String, Nip33Error> {
    if !is_addressable_range(event.kind) {
        return Err(Nip33Error::NotAddressable);
    }

    let d_tag = get_d_tag(event).ok_or(Nip33Error::MissingDTag)?;

    Ok(create_address(event.kind, &event.pubkey, &d_tag))
}

/// Template for an addressable event.
///
/// The `d` tag is always placed first; any `d` tags in `extra_tags` are
/// dropped so the identifier is unambiguous.
pub fn addressable_event(
    kind: u16,
    identifier: &str,
    content: impl Into<String>,
    extra_tags: Vec<Vec<String>>,
) -> Result<EventTemplate, ValidationError> {
    if !is_addressable_range(kind) {
        return Err(ValidationError::new(
            "kind",
            format!(
                "{kind} is outside the addressable range {ADDRESSABLE_KIND_MIN}-{ADDRESSABLE_KIND_MAX}"
            ),
        ));
    }
    validate_tags(&extra_tags)?;

    let mut tags = Vec::with_capacity(extra_tags.len() + 1);
    tags.push(vec![D_TAG.to_string(), identifier.to_string()]);
    tags.extend(extra_tags.into_iter().filter(|t| t[0] != D_TAG));

    Ok(EventTemplate::new(kind, tags, content))
}
