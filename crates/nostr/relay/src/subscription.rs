//! Subscription bookkeeping and filter matching.
//!
//! Filters support ids, authors, kinds, `#<letter>` tags, since, until and
//! limit. Values within a field are OR-ed, fields are AND-ed, and a
//! subscription matches when any of its filters does.

use crate::error::{RelayError, Result};
use nostr::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Largest `limit` a filter may ask for.
pub const MAX_LIMIT: usize = 5000;

/// Longest subscription id accepted.
pub const MAX_SUBSCRIPTION_ID_LENGTH: usize = 64;

/// Nostr subscription filter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// `#e`, `#p`, ... keyed with the leading `#`
    #[serde(flatten)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, Vec<String>>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids
            && !ids.contains(&event.id)
        {
            return false;
        }

        if let Some(ref authors) = self.authors
            && !authors.contains(&event.pubkey)
        {
            return false;
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        if let Some(ref tag_filters) = self.tags {
            for (key, wanted) in tag_filters {
                let Some(name) = key.strip_prefix('#') else {
                    continue;
                };
                let hit = event
                    .tag_values(name)
                    .any(|value| wanted.iter().any(|w| w == value));
                if !hit {
                    return false;
                }
            }
        }

        true
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.limit
            && limit > MAX_LIMIT
        {
            return Err(RelayError::Subscription(format!(
                "invalid: limit too large (max {MAX_LIMIT})"
            )));
        }
        Ok(())
    }
}

/// Reject empty or oversized subscription ids.
pub fn validate_subscription_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_SUBSCRIPTION_ID_LENGTH {
        return Err(RelayError::Subscription(format!(
            "invalid: subscription id must be 1-{MAX_SUBSCRIPTION_ID_LENGTH} characters"
        )));
    }
    Ok(())
}

/// A client subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    pub fn new(id: String, filters: Vec<Filter>) -> Self {
        Self { id, filters }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|filter| filter.matches(event))
    }
}

/// Subscriptions of one connection
#[derive(Debug, Default, Clone)]
pub struct SubscriptionManager {
    subscriptions: HashMap<String, Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription, replacing one with the same id.
    pub fn add(&mut self, subscription: Subscription) {
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn remove(&mut self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    pub fn get(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subscriptions.get(subscription_id)
    }

    /// Ids of the subscriptions `event` matches.
    pub fn matches_any(&self, event: &Event) -> Vec<String> {
        self.subscriptions
            .values()
            .filter(|sub| sub.matches(event))
            .map(|sub| sub.id.clone())
            .collect()
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
