//! Nostr relay client and NIP-46 remote signing.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays with two-stage event validation,
//!   ordered delivery and automatic reconnection
//! - Wire message encoding (NIP-01 relay protocol) and filters
//! - Newest-wins tables for replaceable and addressable events
//! - A relay pool fanning publishes and subscriptions out to many relays
//! - NIP-46 bunker and remote signer client roles
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr::{EventTemplate, KIND_SHORT_TEXT_NOTE, finalize_event, generate_secret_key};
//! use nostr_client::{Filter, RelayPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let pool = RelayPool::new();
//!     pool.add_relay("wss://relay.damus.io").await?;
//!     pool.add_relay("wss://nos.lol").await?;
//!     pool.connect_all().await;
//!
//!     let filter = Filter::new().kinds(vec![KIND_SHORT_TEXT_NOTE]).limit(10);
//!     pool.subscribe(
//!         vec![filter],
//!         Arc::new(|event| println!("Received event: {}", event.id)),
//!         Some(Arc::new(|| println!("Got all stored events"))),
//!     )
//!     .await?;
//!
//!     let template = EventTemplate::new(KIND_SHORT_TEXT_NOTE, vec![], "hello");
//!     let event = finalize_event(&template, &generate_secret_key())?;
//!     let result = pool.publish_event(&event).await;
//!     println!("accepted by any relay: {}", result.success);
//!     Ok(())
//! }
//! ```

mod cache;
mod error;
mod message;
mod nip46;
mod pool;
mod recovery;
mod relay;
mod subscription;

pub use cache::{IndexOutcome, ReplaceableIndex};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, OkPrefix, RelayMessage};
pub use nip46::{
    AuthChallengeConfig, Bunker, BunkerConfig, ChallengeKind, ClientEvent, PendingChallenge,
    RemoteSignerClient, RemoteSignerConfig, Session, SimpleBunker, SimpleRemoteSigner,
    WILDCARD_PERMISSION,
};
pub use pool::{
    PoolEvent, PoolPublishResult, PoolSubscription, PublishDetails, RelayPool, RelayPublishResult,
};
pub use recovery::{ExponentialBackoff, JITTER_FRACTION};
pub use relay::{
    ConnectionState, PublishConfirmation, PublishOptions, RelayConfig, RelayConnection,
    RelayErrorKind, RelayEvent,
};
pub use subscription::{
    EoseCallback, EventCallback, Subscription, SubscriptionOptions, generate_subscription_id,
};
