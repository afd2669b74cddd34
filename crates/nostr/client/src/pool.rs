//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool fans publish and subscribe calls out to every relay it holds and
//! merges their notifications into one stream tagged with the relay URL.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::relay::{
    ConnectionState, PublishConfirmation, PublishOptions, RelayConfig, RelayConnection, RelayEvent,
};
use crate::subscription::{EoseCallback, EventCallback, SubscriptionOptions};
use futures::future::join_all;
use nostr::Event;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A relay notification tagged with the relay it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEvent {
    pub relay_url: String,
    pub event: RelayEvent,
}

/// Outcome of publishing to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPublishResult {
    pub accepted: bool,
    pub message: String,
}

impl From<Result<PublishConfirmation>> for RelayPublishResult {
    fn from(result: Result<PublishConfirmation>) -> Self {
        match result {
            Ok(confirmation) => Self {
                accepted: confirmation.accepted,
                message: confirmation.message,
            },
            Err(e) => Self {
                accepted: false,
                message: e.to_string(),
            },
        }
    }
}

/// Result of publishing one event to the whole pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPublishResult {
    pub event_id: String,
    /// At least one relay accepted the event
    pub success: bool,
    pub results: HashMap<String, RelayPublishResult>,
}

/// [`PoolPublishResult`] with tallies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDetails {
    pub result: PoolPublishResult,
    pub success_count: usize,
    pub failure_count: usize,
}

/// A subscription registered on one relay of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolSubscription {
    pub relay_url: String,
    pub subscription_id: String,
}

/// Fires the pool-wide EOSE callback once every relay is done with its
/// stored events.
struct EoseLatch {
    remaining: AtomicUsize,
    on_eose: EoseCallback,
}

/// One relay's share of an [`EoseLatch`]. A relay is done on EOSE, on
/// CLOSED, or when its EOSE timeout expires, whichever comes first.
struct RelayEose {
    latch: Arc<EoseLatch>,
    done: AtomicBool,
}

impl RelayEose {
    fn new(latch: &Arc<EoseLatch>) -> Arc<Self> {
        Arc::new(Self {
            latch: Arc::clone(latch),
            done: AtomicBool::new(false),
        })
    }

    fn finish(&self) {
        if !self.done.swap(true, Ordering::SeqCst)
            && self.latch.remaining.fetch_sub(1, Ordering::SeqCst) == 1
        {
            (self.latch.on_eose)();
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

type EoseWaiters = Arc<parking_lot::Mutex<HashMap<PoolSubscription, Arc<RelayEose>>>>;

/// A pool of Nostr relay connections, keyed by normalized URL.
pub struct RelayPool {
    relays: RwLock<HashMap<String, RelayConnection>>,
    events_tx: broadcast::Sender<PoolEvent>,
    forwarders: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
    /// Relay subscriptions still owing the pool an EOSE
    eose_waiters: EoseWaiters,
    config: RelayConfig,
}

impl RelayPool {
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Pool whose relays all use `config`.
    pub fn with_config(config: RelayConfig) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            relays: RwLock::new(HashMap::new()),
            events_tx,
            forwarders: parking_lot::Mutex::new(HashMap::new()),
            eose_waiters: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Pool pre-populated with `urls`. Invalid URLs are an error.
    pub async fn with_relays(urls: &[String], config: RelayConfig) -> Result<Self> {
        let pool = Self::with_config(config);
        for url in urls {
            pool.add_relay(url).await?;
        }
        Ok(pool)
    }

    /// Merged notifications from every relay.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    /// Add a relay, or return the existing connection for the same URL.
    pub async fn add_relay(&self, url: &str) -> Result<RelayConnection> {
        let relay = RelayConnection::with_config(url, self.config.clone())?;
        let key = relay.url().to_string();

        let mut relays = self.relays.write().await;
        if let Some(existing) = relays.get(&key) {
            return Ok(existing.clone());
        }
        info!("Adding relay to pool: {}", key);
        self.spawn_forwarder(&relay);
        relays.insert(key, relay.clone());
        Ok(relay)
    }

    /// Remove and disconnect a relay.
    pub async fn remove_relay(&self, url: &str) {
        let key = normalize_url(url);
        let removed = self.relays.write().await.remove(&key);
        if let Some(relay) = removed {
            info!("Removing relay from pool: {}", key);
            relay.disconnect().await;
        }
        if let Some(forwarder) = self.forwarders.lock().remove(&key) {
            forwarder.abort();
        }
    }

    pub async fn relay(&self, url: &str) -> Option<RelayConnection> {
        self.relays.read().await.get(&normalize_url(url)).cloned()
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        self.relays.read().await.keys().cloned().collect()
    }

    pub async fn relay_states(&self) -> HashMap<String, ConnectionState> {
        self.relays
            .read()
            .await
            .iter()
            .map(|(url, relay)| (url.clone(), relay.state()))
            .collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.relays
            .read()
            .await
            .values()
            .filter(|r| r.is_connected())
            .count()
    }

    fn spawn_forwarder(&self, relay: &RelayConnection) {
        let mut rx = relay.events();
        let events_tx = self.events_tx.clone();
        let eose_waiters = Arc::clone(&self.eose_waiters);
        let relay_url = relay.url().to_string();
        let key = relay_url.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let RelayEvent::Closed { subscription_id, .. } = &event {
                            let waiter = eose_waiters.lock().remove(&PoolSubscription {
                                relay_url: relay_url.clone(),
                                subscription_id: subscription_id.clone(),
                            });
                            if let Some(waiter) = waiter {
                                waiter.finish();
                            }
                        }
                        let _ = events_tx.send(PoolEvent {
                            relay_url: relay_url.clone(),
                            event,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Pool forwarder for {} lagged by {} events", relay_url, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.forwarders.lock().insert(key, handle) {
            previous.abort();
        }
    }

    async fn snapshot(&self) -> Vec<RelayConnection> {
        self.relays.read().await.values().cloned().collect()
    }

    /// Connect to every relay concurrently. Never fails as a whole.
    pub async fn connect_all(&self) -> HashMap<String, bool> {
        let relays = self.snapshot().await;
        let outcomes = join_all(relays.iter().map(|r| r.connect())).await;
        relays
            .iter()
            .map(|r| r.url().to_string())
            .zip(outcomes)
            .collect()
    }

    pub async fn disconnect_all(&self) {
        let relays = self.snapshot().await;
        join_all(relays.iter().map(|r| r.disconnect())).await;
    }

    /// Publish to every relay concurrently.
    pub async fn publish_event(&self, event: &Event) -> PoolPublishResult {
        self.publish_with_details(event).await.result
    }

    /// [`Self::publish_event`] plus success and failure counts.
    pub async fn publish_with_details(&self, event: &Event) -> PublishDetails {
        let relays = self.snapshot().await;
        let outcomes = join_all(
            relays
                .iter()
                .map(|r| r.publish(event, PublishOptions::default())),
        )
        .await;

        let results: HashMap<String, RelayPublishResult> = relays
            .iter()
            .map(|r| r.url().to_string())
            .zip(outcomes.into_iter().map(RelayPublishResult::from))
            .collect();
        let success_count = results.values().filter(|r| r.accepted).count();
        let failure_count = results.len() - success_count;
        debug!(
            "Published {} to {}/{} relays",
            event.id,
            success_count,
            results.len()
        );

        PublishDetails {
            result: PoolPublishResult {
                event_id: event.id.clone(),
                success: success_count > 0,
                results,
            },
            success_count,
            failure_count,
        }
    }

    /// Subscribe on every relay. `on_eose` runs once, after every relay that
    /// took the subscription has reported EOSE, closed it, or let its EOSE
    /// timeout expire.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        on_event: EventCallback,
        on_eose: Option<EoseCallback>,
    ) -> Result<Vec<PoolSubscription>> {
        self.subscribe_with_options(filters, on_event, on_eose, SubscriptionOptions::default())
            .await
    }

    pub async fn subscribe_with_options(
        &self,
        filters: Vec<Filter>,
        on_event: EventCallback,
        on_eose: Option<EoseCallback>,
        options: SubscriptionOptions,
    ) -> Result<Vec<PoolSubscription>> {
        for filter in &filters {
            filter.validate()?;
        }

        let relays = self.snapshot().await;
        let latch = on_eose.map(|on_eose| {
            Arc::new(EoseLatch {
                remaining: AtomicUsize::new(relays.len()),
                on_eose,
            })
        });
        self.eose_waiters.lock().retain(|_, waiter| !waiter.is_done());

        let mut subscriptions = Vec::with_capacity(relays.len());
        let mut failed = Vec::new();
        for relay in &relays {
            let relay_eose = latch.as_ref().map(RelayEose::new);
            let callback = relay_eose.as_ref().map(|relay_eose| {
                let relay_eose = Arc::clone(relay_eose);
                Arc::new(move || relay_eose.finish()) as EoseCallback
            });

            match relay
                .subscribe(
                    filters.clone(),
                    Arc::clone(&on_event),
                    callback,
                    options.clone(),
                )
                .await
            {
                Ok(subscription_id) => {
                    let subscription = PoolSubscription {
                        relay_url: relay.url().to_string(),
                        subscription_id,
                    };
                    if let Some(relay_eose) = relay_eose {
                        if let Some(wait) = options.eose_timeout {
                            let expired = Arc::clone(&relay_eose);
                            tokio::spawn(async move {
                                tokio::time::sleep(wait).await;
                                expired.finish();
                            });
                        }
                        self.eose_waiters
                            .lock()
                            .insert(subscription.clone(), relay_eose);
                    }
                    subscriptions.push(subscription);
                }
                Err(e) => {
                    warn!("Failed to subscribe on {}: {}", relay.url(), e);
                    failed.extend(relay_eose);
                }
            }
        }

        if subscriptions.is_empty() && !relays.is_empty() {
            return Err(ClientError::Connection(
                "no relay accepted the subscription".to_string(),
            ));
        }
        for relay_eose in failed {
            relay_eose.finish();
        }
        Ok(subscriptions)
    }

    pub async fn unsubscribe(&self, subscriptions: &[PoolSubscription]) {
        for subscription in subscriptions {
            self.eose_waiters.lock().remove(subscription);
            if let Some(relay) = self.relay(&subscription.relay_url).await {
                relay.unsubscribe(&subscription.subscription_id).await;
            }
        }
    }

    /// Close every subscription on every relay.
    pub async fn unsubscribe_all(&self) {
        self.eose_waiters.lock().clear();
        for relay in self.snapshot().await {
            for id in relay.active_subscriptions() {
                relay.unsubscribe(&id).await;
            }
        }
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        for (_, forwarder) in self.forwarders.lock().drain() {
            forwarder.abort();
        }
    }
}

fn normalize_url(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}
