//! Bunker-side bookkeeping: granted sessions and outstanding auth challenges.

use nostr::{EncryptionScheme, NostrConnectRequest, SchemePriority, sign_event_permission};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Grants every permission.
pub const WILDCARD_PERMISSION: &str = "*";

/// A client the bunker has accepted.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_pubkey: String,
    pub permissions: HashSet<String>,
    pub last_seen: Instant,
    /// Scheme order for this client; follows whatever it last spoke
    pub schemes: SchemePriority,
}

impl Session {
    pub fn new(
        client_pubkey: impl Into<String>,
        permissions: impl IntoIterator<Item = String>,
        schemes: SchemePriority,
    ) -> Self {
        Self {
            client_pubkey: client_pubkey.into(),
            permissions: permissions.into_iter().collect(),
            last_seen: Instant::now(),
            schemes,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Whether `permission` (a method name, or `sign_event:<kind>`) is granted.
    pub fn allows(&self, permission: &str) -> bool {
        self.permissions.contains(WILDCARD_PERMISSION) || self.permissions.contains(permission)
    }

    /// `sign_event:<kind>`, bare `sign_event` or `*`.
    pub fn allows_sign(&self, kind: u16) -> bool {
        self.allows("sign_event") || self.allows(&sign_event_permission(kind))
    }

    pub fn grant(&mut self, permission: impl Into<String>) {
        self.permissions.insert(permission.into());
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// What resolving a challenge unlocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    /// A `connect` held back until the user approves
    Connect { permissions: Vec<String> },
    /// A request denied for lack of `permission`, replayed once granted
    Permission {
        permission: String,
        request: NostrConnectRequest,
    },
}

/// An auth challenge waiting for [`crate::Bunker::resolve_auth_challenge`].
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub client_pubkey: String,
    pub request_id: String,
    /// Scheme the challenged request arrived under
    pub scheme: EncryptionScheme,
    pub created: Instant,
    pub kind: ChallengeKind,
}

impl PendingChallenge {
    pub fn new(
        client_pubkey: impl Into<String>,
        request_id: impl Into<String>,
        scheme: EncryptionScheme,
        kind: ChallengeKind,
    ) -> Self {
        Self {
            client_pubkey: client_pubkey.into(),
            request_id: request_id.into(),
            scheme,
            created: Instant::now(),
            kind,
        }
    }

    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        now.saturating_duration_since(self.created) > expiry
    }
}
