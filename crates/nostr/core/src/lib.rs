//! Nostr protocol primitives.
//!
//! This crate provides:
//! - Keys: generation, Schnorr signing/verification, ECDH
//! - NIP-01: Basic protocol (events, canonical hashing, signing, ordering)
//! - Structural event validation
//! - NIP-04: Encrypted Direct Messages
//! - NIP-33: Addressable events
//! - NIP-42: Authentication of Clients to Relays
//! - NIP-44: Versioned Encryption
//! - NIP-46: Nostr Remote Signing wire types and connection strings

mod encryption;
mod keys;
mod nip01;
mod nip04;
mod nip33;
mod nip42;
mod nip44;
mod nip46;
mod validation;


// Keys and primitive crypto
pub use keys::{
    KeyError, Keys, generate_secret_key, get_public_key, get_public_key_hex, parse_secret_key,
    parse_xonly_public_key, sha256, shared_secret, sign_schnorr, verify_schnorr,
};

// NIP-01: Basic protocol
pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_RECOMMEND_RELAY, KIND_SHORT_TEXT_NOTE,
    KindClassification, Metadata, Nip01Error, UnsignedEvent, classify_kind, compare_events,
    finalize_event, get_event_hash, is_addressable_kind, is_ephemeral_kind, is_regular_kind,
    is_replaceable_kind, metadata, serialize_event, sort_events, supersedes, text_note, unix_now,
    validate_unsigned_event, verify_event, verify_event_integrity,
};

// Structural validation
pub use validation::{
    MAX_FUTURE_SECONDS, ValidationError, is_lower_hex, validate_event_structure, validate_hex_id,
    validate_tags,
};

// NIP-04: Encrypted Direct Messages
pub use nip04::{ENCRYPTED_DM_KIND, Nip04Error, direct_message};
pub use nip04::{decrypt as nip04_decrypt, encrypt as nip04_encrypt};

// NIP-33: Addressable events
pub use nip33::{
    ADDRESSABLE_KIND_MAX, ADDRESSABLE_KIND_MIN, D_TAG, Nip33Error, addressable_event,
    create_address, get_d_tag, get_event_address, parse_address,
};

// NIP-42: Authentication of Clients to Relays
pub use nip42::{AUTH_KIND, AUTH_REQUIRED_PREFIX, CHALLENGE_TAG, RELAY_TAG, create_auth_event};

// NIP-44: Versioned Encryption
pub use nip44::{
    CHACHA_KEY_SIZE, CHACHA_NONCE_SIZE, HMAC_KEY_SIZE, MAC_SIZE, MAX_PLAINTEXT_LEN,
    MIN_PADDED_LEN, MIN_PLAINTEXT_LEN, NONCE_SIZE, Nip44Error, VERSION, calc_padded_len,
    decrypt as decrypt_v2, decrypt_with_conversation_key, encrypt as encrypt_v2,
    encrypt_with_conversation_key, get_conversation_key,
};

// Encryption scheme selection
pub use encryption::{EncryptionError, EncryptionScheme, SchemePriority};

// NIP-46: Nostr Remote Signing
pub use nip46::{
    BUNKER_SCHEME, BunkerUrl, KIND_NOSTR_CONNECT, NOSTR_CONNECT_SCHEME, Nip46Error,
    NostrConnectMethod, NostrConnectRequest, NostrConnectResponse, NostrConnectUrl,
    generate_request_id, is_nostr_connect_event, parse_permissions, sign_event_permission,
};
