//! In-memory event storage.
//!
//! Regular events are kept as-is, replaceable and addressable events keep
//! only the newest version per key, ephemeral events are never stored.

use crate::subscription::Filter;
use nostr::{
    Event, KindClassification, classify_kind, get_d_tag, sort_events, supersedes,
};
use std::collections::HashMap;

/// Result of offering an event to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// Same id already stored
    Duplicate,
    /// A newer replaceable or addressable version is already stored
    Stale,
    /// Ephemeral kind, broadcast only
    NotStored,
}

#[derive(Debug, Default)]
pub struct EventStore {
    events: HashMap<String, Event>,
    /// replaceable key `kind:pubkey` / addressable key `kind:pubkey:d` -> id
    latest: HashMap<String, String>,
}

fn replacement_key(event: &Event) -> Option<String> {
    match classify_kind(event.kind) {
        KindClassification::Replaceable => Some(format!("{}:{}", event.kind, event.pubkey)),
        KindClassification::Addressable => Some(format!(
            "{}:{}:{}",
            event.kind,
            event.pubkey,
            get_d_tag(event).unwrap_or_default()
        )),
        _ => None,
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, event: &Event) -> StoreOutcome {
        if classify_kind(event.kind) == KindClassification::Ephemeral {
            return StoreOutcome::NotStored;
        }
        if self.events.contains_key(&event.id) {
            return StoreOutcome::Duplicate;
        }

        if let Some(key) = replacement_key(event) {
            if let Some(current_id) = self.latest.get(&key)
                && let Some(current) = self.events.get(current_id)
            {
                if !supersedes(event, current) {
                    return StoreOutcome::Stale;
                }
                let old = current_id.clone();
                self.events.remove(&old);
            }
            self.latest.insert(key, event.id.clone());
        }

        self.events.insert(event.id.clone(), event.clone());
        StoreOutcome::Stored
    }

    /// Matching events, newest first, cut to the filter's limit.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        sort_events(&mut events);
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        events
    }

    pub fn all(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.events.values().cloned().collect();
        sort_events(&mut events);
        events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
