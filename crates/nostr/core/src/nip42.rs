//! NIP-42: Authentication of clients to relays.

use crate::nip01::EventTemplate;

/// Kind of the ephemeral event answering an AUTH challenge.
pub const AUTH_KIND: u16 = 22242;
pub const RELAY_TAG: &str = "relay";
pub const CHALLENGE_TAG: &str = "challenge";

/// Machine-readable OK/CLOSED prefix asking the client to authenticate.
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required";

/// Template answering `challenge` from the relay at `relay_url`.
pub fn create_auth_event(challenge: &str, relay_url: &str) -> EventTemplate {
    EventTemplate::new(
        AUTH_KIND,
        vec![
            vec![RELAY_TAG.to_string(), relay_url.to_string()],
            vec![CHALLENGE_TAG.to_string(), challenge.to_string()],
        ],
        "",
    )
}
