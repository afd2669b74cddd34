//! In-memory Nostr relay for tests.
//!
//! Speaks enough of NIP-01 and NIP-42 to drive a real client end to end:
//! - EVENT with structural, id and signature checks
//! - REQ with stored matches, EOSE and live fan-out
//! - CLOSE
//! - AUTH when `auth_required` is set
//!
//! Replaceable and addressable events keep only their newest version;
//! ephemeral events are forwarded but never stored.
//!
//! ```no_run
//! # async fn demo() -> nostr_relay::Result<()> {
//! use nostr_relay::{TestRelay, TestRelayConfig};
//!
//! let relay = TestRelay::start(TestRelayConfig::default()).await?;
//! println!("listening on {}", relay.url());
//! # Ok(())
//! # }
//! ```

mod error;
mod server;
mod store;
mod subscription;


pub use error::{RelayError, Result};
pub use server::{TestRelay, TestRelayConfig};
pub use store::{EventStore, StoreOutcome};
pub use subscription::{
    Filter, MAX_LIMIT, MAX_SUBSCRIPTION_ID_LENGTH, Subscription, SubscriptionManager,
    validate_subscription_id,
};
