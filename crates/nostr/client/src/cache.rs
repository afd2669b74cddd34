//! Newest-wins tables for replaceable (NIP-16) and addressable (NIP-33) events.

use nostr::{Event, get_d_tag, is_addressable_kind, is_replaceable_kind, supersedes};
use std::collections::HashMap;

/// Outcome of offering an event to a [`ReplaceableIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Kind is neither replaceable nor addressable
    Untracked,
    /// First event for its key
    Stored,
    /// Replaced an older entry
    Replaced,
    /// An equal or newer entry is already stored
    Ignored,
}

/// Keeps only the newest event per `(pubkey, kind)` for replaceable kinds and
/// per `(kind, pubkey, d)` for addressable kinds. No eviction.
#[derive(Debug, Default, Clone)]
pub struct ReplaceableIndex {
    replaceable: HashMap<(String, u16), Event>,
    addressable: HashMap<(u16, String, String), Event>,
}

fn offer<K: Eq + std::hash::Hash>(table: &mut HashMap<K, Event>, key: K, event: &Event) -> IndexOutcome {
    match table.get(&key) {
        None => {
            table.insert(key, event.clone());
            IndexOutcome::Stored
        }
        Some(current) if supersedes(event, current) => {
            table.insert(key, event.clone());
            IndexOutcome::Replaced
        }
        Some(_) => IndexOutcome::Ignored,
    }
}

impl ReplaceableIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an event. Ingesting the same event twice is a no-op.
    pub fn insert(&mut self, event: &Event) -> IndexOutcome {
        if is_replaceable_kind(event.kind) {
            let key = (event.pubkey.clone(), event.kind);
            offer(&mut self.replaceable, key, event)
        } else if is_addressable_kind(event.kind) {
            let d_tag = get_d_tag(event).unwrap_or_default();
            let key = (event.kind, event.pubkey.clone(), d_tag);
            offer(&mut self.addressable, key, event)
        } else {
            IndexOutcome::Untracked
        }
    }

    /// Newest replaceable event for an author and kind.
    pub fn replaceable(&self, pubkey: &str, kind: u16) -> Option<&Event> {
        self.replaceable.get(&(pubkey.to_string(), kind))
    }

    /// Newest addressable event for `kind:pubkey:d_tag`.
    pub fn addressable(&self, kind: u16, pubkey: &str, d_tag: &str) -> Option<&Event> {
        self.addressable
            .get(&(kind, pubkey.to_string(), d_tag.to_string()))
    }

    pub fn len(&self) -> usize {
        self.replaceable.len() + self.addressable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replaceable.is_empty() && self.addressable.is_empty()
    }

    pub fn clear(&mut self) {
        self.replaceable.clear();
        self.addressable.clear();
    }
}
