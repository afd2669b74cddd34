//! Per-connection subscription state.
//!
//! A [`Subscription`] owns its callbacks, the buffer of validated events that
//! have not been delivered yet, and the optional EOSE timer.

use crate::message::Filter;
use nostr::{Event, sort_events};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Receives each delivered event.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Invoked once the relay has sent all stored events.
pub type EoseCallback = Arc<dyn Fn() + Send + Sync>;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// How a subscription ends on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Unsubscribe right after EOSE (or the EOSE timeout)
    pub auto_close: bool,
    /// Unsubscribe if the relay has not sent EOSE within this window
    pub eose_timeout: Option<Duration>,
}

impl SubscriptionOptions {
    /// Fetch stored events and close.
    pub fn close_on_eose() -> Self {
        Self {
            auto_close: true,
            eose_timeout: None,
        }
    }

    pub fn eose_timeout(mut self, timeout: Duration) -> Self {
        self.eose_timeout = Some(timeout);
        self
    }
}

pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
    pub options: SubscriptionOptions,
    pub(crate) on_event: EventCallback,
    pub(crate) on_eose: Option<EoseCallback>,
    pub(crate) eose_received: bool,
    pub(crate) eose_timer: Option<JoinHandle<()>>,
    buffer: Vec<Event>,
}

impl Subscription {
    pub fn new(
        id: String,
        filters: Vec<Filter>,
        on_event: EventCallback,
        on_eose: Option<EoseCallback>,
        options: SubscriptionOptions,
    ) -> Self {
        Self {
            id,
            filters,
            options,
            on_event,
            on_eose,
            eose_received: false,
            eose_timer: None,
            buffer: Vec::new(),
        }
    }

    /// Queue a validated event for the next flush.
    pub fn buffer_event(&mut self, event: Event) {
        self.buffer.push(event);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn eose_received(&self) -> bool {
        self.eose_received
    }

    /// Drain the buffer in delivery order.
    pub fn take_sorted(&mut self) -> Vec<Event> {
        let mut events = std::mem::take(&mut self.buffer);
        sort_events(&mut events);
        events
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.eose_timer.take() {
            timer.abort();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filters", &self.filters)
            .field("options", &self.options)
            .field("eose_received", &self.eose_received)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
