//! Client error types

use crate::message::MessageError;
use nostr::{EncryptionError, Nip01Error, Nip46Error, ValidationError};
use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Malformed input, rejected before any I/O
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Wire message could not be encoded or decoded
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Event could not be built or signed
    #[error("Event error: {0}")]
    Event(#[from] Nip01Error),

    /// Remote-signing envelope or connection string error
    #[error("NIP-46 error: {0}")]
    Nip46(#[from] Nip46Error),

    /// Payload could not be encrypted or decrypted
    #[error("Crypto error: {0}")]
    Crypto(#[from] EncryptionError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// The connection or signer went away while a request was pending
    #[error("Disconnected")]
    Disconnected,

    /// Event publish failed
    #[error("Event publish failed: {0}")]
    PublishFailed(String),

    /// Remote signer answered with an error
    #[error("Rejected by remote signer: {0}")]
    Rejected(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
