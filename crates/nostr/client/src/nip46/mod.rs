//! NIP-46 remote signing over relays.
//!
//! [`Bunker`] holds the user's key and answers requests; [`RemoteSignerClient`]
//! sends them. The `Simple*` pair is the NIP-04-only subset.

mod bunker;
mod client;
mod session;
mod simple;

pub use bunker::{AuthChallengeConfig, Bunker, BunkerConfig};
pub use client::{ClientEvent, RemoteSignerClient, RemoteSignerConfig};
pub use session::{ChallengeKind, PendingChallenge, Session, WILDCARD_PERMISSION};
pub use simple::{SimpleBunker, SimpleRemoteSigner};
