//! Single relay connection management
//!
//! A [`RelayConnection`] owns one WebSocket and everything scoped to it:
//! the subscription registry, per-subscription delivery buffers, the
//! replaceable/addressable tables, pending publish acknowledgments and the
//! reconnect policy. Incoming messages are processed strictly in arrival
//! order by one reader task; events pass a structural check and a
//! signature check before they are buffered, and buffers are delivered in
//! [`nostr::compare_events`] order on a fixed flush interval or on EOSE.

use crate::cache::ReplaceableIndex;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, MessageError, OkPrefix, RelayMessage};
use crate::recovery::ExponentialBackoff;
use crate::subscription::{
    EoseCallback, EventCallback, Subscription, SubscriptionOptions, generate_subscription_id,
};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, StreamExt};
use nostr::{
    Event, create_auth_event, finalize_event, unix_now, validate_event_structure,
    verify_event_integrity,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Disconnected
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
    /// Waiting for an automatic reconnect
    Reconnecting,
}

/// Category of a [`RelayEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    /// Transport could not be opened or was lost for good
    Connection,
    /// Relay sent something that is not a well-formed message
    Protocol,
    /// Event failed structural validation
    Validation,
    /// Event id or signature did not check out
    Crypto,
}

/// Relay's answer to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
    /// Machine-readable prefix of `message`, if any
    pub prefix: Option<OkPrefix>,
}

impl PublishConfirmation {
    pub fn new(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            event_id: event_id.into(),
            accepted,
            prefix: OkPrefix::parse(&message),
            message,
        }
    }
}

/// Notification emitted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connect,
    Disconnect,
    Error {
        kind: RelayErrorKind,
        message: String,
    },
    Notice(String),
    Ok(PublishConfirmation),
    Closed {
        subscription_id: String,
        message: String,
    },
    Auth {
        challenge: String,
    },
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// How often buffered events are delivered
    pub flush_interval: Duration,
    /// Default wait for a publish acknowledgment
    pub publish_timeout: Duration,
    /// Reconnect automatically after a connection that had succeeded drops
    pub auto_reconnect: bool,
    /// Initial reconnection delay
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Reconnection attempts (0 = unlimited)
    pub max_reconnect_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            flush_interval: Duration::from_millis(100),
            publish_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

impl RelayConfig {
    /// Defaults, overridden by any `NOSTR_*` environment variables that are set.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `NOSTR_CONNECT_TIMEOUT_MS`, `NOSTR_FLUSH_INTERVAL_MS`,
    /// `NOSTR_PUBLISH_TIMEOUT_MS`, `NOSTR_RECONNECT_DELAY_MS`,
    /// `NOSTR_MAX_RECONNECT_DELAY_MS`, `NOSTR_MAX_RECONNECT_ATTEMPTS` and
    /// `NOSTR_AUTO_RECONNECT`. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_millis("NOSTR_CONNECT_TIMEOUT_MS") {
            self.connect_timeout = v;
        }
        if let Some(v) = env_millis("NOSTR_FLUSH_INTERVAL_MS") {
            self.flush_interval = v;
        }
        if let Some(v) = env_millis("NOSTR_PUBLISH_TIMEOUT_MS") {
            self.publish_timeout = v;
        }
        if let Some(v) = env_millis("NOSTR_RECONNECT_DELAY_MS") {
            self.reconnect_delay = v;
        }
        if let Some(v) = env_millis("NOSTR_MAX_RECONNECT_DELAY_MS") {
            self.max_reconnect_delay = v;
        }
        if let Some(v) = std::env::var("NOSTR_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            self.max_reconnect_attempts = v;
        }
        if let Ok(v) = std::env::var("NOSTR_AUTO_RECONNECT") {
            self.auto_reconnect = matches!(v.trim(), "1" | "true" | "yes");
        }
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_backoff(mut self, base: Duration, cap: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = base;
        self.max_reconnect_delay = cap;
        self.max_reconnect_attempts = max_attempts;
        self
    }
}

/// Options for [`RelayConnection::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Wait for the relay's OK before returning
    pub wait_for_ack: bool,
    /// Overrides [`RelayConfig::publish_timeout`]
    pub timeout: Option<Duration>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            wait_for_ack: true,
            timeout: None,
        }
    }
}

impl PublishOptions {
    /// Return as soon as the event is written to the socket.
    pub fn fire_and_forget() -> Self {
        Self {
            wait_for_ack: false,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

type AckSender = oneshot::Sender<PublishConfirmation>;

#[derive(Default)]
struct ConnectionTasks {
    reader: Option<JoinHandle<()>>,
    flush: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl ConnectionTasks {
    fn abort_transport(&mut self) {
        for handle in [self.reader.take(), self.flush.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

struct Inner {
    url: Url,
    config: RelayConfig,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    /// event id -> (registration token, waiter)
    pending_acks: Mutex<HashMap<String, (u64, AckSender)>>,
    next_ack_token: AtomicU64,
    index: Mutex<ReplaceableIndex>,
    events_tx: broadcast::Sender<RelayEvent>,
    backoff: Mutex<ExponentialBackoff>,
    tasks: Mutex<ConnectionTasks>,
    /// In-flight connect attempt, tagged with the epoch it started in.
    connecting: Mutex<Option<(u64, Shared<BoxFuture<'static, bool>>)>>,
    /// Serializes delivery so a flush and an EOSE never interleave
    delivery: tokio::sync::Mutex<()>,
    /// Bumped by every successful open and every manual disconnect; stale
    /// reader tasks compare against it before touching state.
    epoch: AtomicU64,
    ever_connected: AtomicBool,
}

/// Relay connection. Cheap to clone; clones share the same socket.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

/// Removes a publish waiter when the publish call finishes, whichever way.
struct PendingAck {
    inner: Arc<Inner>,
    event_id: String,
    token: u64,
}

impl PendingAck {
    fn register(inner: &Arc<Inner>, event_id: &str, tx: AckSender) -> Self {
        let token = inner.next_ack_token.fetch_add(1, Ordering::Relaxed);
        inner
            .pending_acks
            .lock()
            .insert(event_id.to_string(), (token, tx));
        Self {
            inner: Arc::clone(inner),
            event_id: event_id.to_string(),
            token,
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        let mut pending = self.inner.pending_acks.lock();
        if pending
            .get(&self.event_id)
            .is_some_and(|(token, _)| *token == self.token)
        {
            pending.remove(&self.event_id);
        }
    }
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let backoff = ExponentialBackoff::new(
            config.reconnect_delay,
            config.max_reconnect_delay,
            config.max_reconnect_attempts,
        );
        let (events_tx, _) = broadcast::channel(1024);

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                writer: Mutex::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                next_ack_token: AtomicU64::new(0),
                index: Mutex::new(ReplaceableIndex::new()),
                events_tx,
                backoff: Mutex::new(backoff),
                tasks: Mutex::new(ConnectionTasks::default()),
                connecting: Mutex::new(None),
                delivery: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                ever_connected: AtomicBool::new(false),
            }),
        })
    }

    /// Normalized relay URL
    pub fn url(&self) -> &str {
        self.inner.url.as_str()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connection notifications. Each receiver sees events sent after it
    /// was created.
    pub fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Connect to the relay.
    ///
    /// Returns `true` once connected. Concurrent callers share one attempt.
    /// Failures are reported as a [`RelayEvent::Error`] and `false`.
    pub async fn connect(&self) -> bool {
        Inner::connect(&self.inner).await
    }

    /// Close the connection and drop every subscription. Idempotent.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        {
            let mut attempt = inner.connecting.lock();
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            attempt.take();
        }
        inner.index.lock().clear();

        {
            let mut tasks = inner.tasks.lock();
            tasks.abort_transport();
            if let Some(handle) = tasks.reconnect.take() {
                handle.abort();
            }
        }

        let subscriptions: Vec<Subscription> =
            inner.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for mut subscription in subscriptions {
            subscription.cancel_timer();
        }
        inner.pending_acks.lock().clear();

        if let Some(writer) = inner.writer.lock().take() {
            let _ = writer.send(Message::Close(None));
        }

        let previous = std::mem::replace(&mut *inner.state.write(), ConnectionState::Disconnected);
        if matches!(
            previous,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            info!("Disconnected from relay: {}", inner.url);
            inner.emit(RelayEvent::Disconnect);
        }
    }

    /// Publish an event, connecting first if needed.
    pub async fn publish(
        &self,
        event: &Event,
        options: PublishOptions,
    ) -> Result<PublishConfirmation> {
        if !self.connect().await {
            return Err(ClientError::NotConnected);
        }
        self.send_and_confirm(ClientMessage::Event(event.clone()), &event.id, options)
            .await
    }

    /// Answer a NIP-42 challenge with an AUTH event signed by `secret_key`.
    pub async fn authenticate(
        &self,
        challenge: &str,
        secret_key: &[u8; 32],
    ) -> Result<PublishConfirmation> {
        let template = create_auth_event(challenge, self.url());
        let event = finalize_event(&template, secret_key)?;
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.send_and_confirm(ClientMessage::Auth(event.clone()), &event.id, PublishOptions::default())
            .await
    }

    async fn send_and_confirm(
        &self,
        message: ClientMessage,
        event_id: &str,
        options: PublishOptions,
    ) -> Result<PublishConfirmation> {
        if !options.wait_for_ack {
            self.inner.send(&message)?;
            return Ok(PublishConfirmation::new(event_id, true, ""));
        }

        let (tx, rx) = oneshot::channel();
        let _pending = PendingAck::register(&self.inner, event_id, tx);
        self.inner.send(&message)?;

        let wait = options.timeout.unwrap_or(self.inner.config.publish_timeout);
        tokio::select! {
            ack = rx => ack.map_err(|_| ClientError::Disconnected),
            _ = tokio::time::sleep(wait) => Err(ClientError::Timeout(format!(
                "publish acknowledgment timed out after {wait:?} for event {event_id} on {}",
                self.inner.url
            ))),
        }
    }

    /// Register a subscription and send REQ if connected.
    ///
    /// Filters are validated first; nothing is registered if one is malformed.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        on_event: EventCallback,
        on_eose: Option<EoseCallback>,
        options: SubscriptionOptions,
    ) -> Result<String> {
        for filter in &filters {
            filter.validate()?;
        }

        let id = generate_subscription_id();
        let eose_timeout = options.eose_timeout;
        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: filters.clone(),
        };
        self.inner.subscriptions.lock().insert(
            id.clone(),
            Subscription::new(id.clone(), filters, on_event, on_eose, options),
        );

        if let Some(wait) = eose_timeout {
            let inner = Arc::clone(&self.inner);
            let sub_id = id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                inner.expire_subscription(&sub_id).await;
            });
            match self.inner.subscriptions.lock().get_mut(&id) {
                Some(subscription) => subscription.eose_timer = Some(timer),
                None => timer.abort(),
            }
        }

        if self.is_connected()
            && let Err(e) = self.inner.send(&req)
        {
            warn!("Failed to send REQ {} to {}: {}", id, self.inner.url, e);
        }
        debug!("Subscribed {} on {}", id, self.inner.url);
        Ok(id)
    }

    /// Drop a subscription and send CLOSE if connected. Unknown ids are ignored.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        self.inner.remove_subscription(subscription_id, true);
    }

    /// Ids of the live subscriptions.
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().keys().cloned().collect()
    }

    /// Newest stored replaceable event for an author and kind.
    pub fn replaceable_event(&self, pubkey: &str, kind: u16) -> Option<Event> {
        self.inner.index.lock().replaceable(pubkey, kind).cloned()
    }

    /// Newest stored addressable event for `kind:pubkey:d_tag`.
    pub fn addressable_event(&self, kind: u16, pubkey: &str, d_tag: &str) -> Option<Event> {
        self.inner
            .index
            .lock()
            .addressable(kind, pubkey, d_tag)
            .cloned()
    }

    /// Deliver every non-empty buffer now.
    pub async fn flush(&self) {
        self.inner.flush_all().await;
    }
}

impl Inner {
    fn emit(&self, event: RelayEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        debug!("Sending to {}: {}", self.url, text);
        let writer = self.writer.lock();
        let writer = writer.as_ref().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::text(text))
            .map_err(|_| ClientError::NotConnected)
    }

    async fn connect(self: &Arc<Self>) -> bool {
        if *self.state.read() == ConnectionState::Connected {
            return true;
        }

        let attempt = {
            let mut slot = self.connecting.lock();
            match slot.as_ref() {
                Some((_, in_flight)) => in_flight.clone(),
                None => {
                    let epoch = self.epoch.load(Ordering::SeqCst);
                    let fut = Arc::clone(self).open(epoch).shared();
                    *slot = Some((epoch, fut.clone()));
                    fut
                }
            }
        };
        attempt.await
    }

    fn open(self: Arc<Self>, epoch: u64) -> BoxFuture<'static, bool> {
        async move { self.open_transport(epoch).await }.boxed()
    }

    /// Forget the attempt started in `epoch`; a newer attempt stays shared.
    fn finish_attempt(&self, epoch: u64) {
        let mut slot = self.connecting.lock();
        if slot.as_ref().is_some_and(|(started, _)| *started == epoch) {
            slot.take();
        }
    }

    async fn open_transport(self: Arc<Self>, epoch: u64) -> bool {
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to relay: {}", self.url);

        let ws_stream = match timeout(self.config.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                self.connect_failed(epoch, format!("failed to connect to {}: {e}", self.url));
                return false;
            }
            Err(_) => {
                self.connect_failed(
                    epoch,
                    format!(
                        "connection to {} timed out after {:?}",
                        self.url, self.config.connect_timeout
                    ),
                );
                return false;
            }
        };

        // A disconnect() while the handshake was in flight wins.
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Dropping late handshake for {}", self.url);
            self.finish_attempt(epoch);
            return false;
        }
        let started = epoch;
        let epoch = epoch + 1;

        let (mut sink, stream) = ws_stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        let url = self.url.to_string();
        tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("Writer for {} stopped: {}", url, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        *self.writer.lock() = Some(writer_tx);

        self.set_state(ConnectionState::Connected);
        self.ever_connected.store(true, Ordering::SeqCst);
        self.backoff.lock().reset();

        let reader = tokio::spawn(Arc::clone(&self).read_loop(stream, epoch));
        let flush = tokio::spawn(Arc::clone(&self).flush_loop());
        {
            let mut tasks = self.tasks.lock();
            tasks.abort_transport();
            tasks.reader = Some(reader);
            tasks.flush = Some(flush);
        }

        info!("Connected to relay: {}", self.url);
        self.emit(RelayEvent::Connect);

        let resubscribe: Vec<ClientMessage> = self
            .subscriptions
            .lock()
            .values()
            .map(|s| ClientMessage::Req {
                subscription_id: s.id.clone(),
                filters: s.filters.clone(),
            })
            .collect();
        for req in &resubscribe {
            if let Err(e) = self.send(req) {
                warn!("Failed to resubscribe on {}: {}", self.url, e);
            }
        }

        self.finish_attempt(started);
        true
    }

    fn connect_failed(&self, epoch: u64, message: String) {
        warn!("{}", message);
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.set_state(ConnectionState::Disconnected);
        }
        self.finish_attempt(epoch);
        self.emit(RelayEvent::Error {
            kind: RelayErrorKind::Connection,
            message,
        });
    }

    async fn read_loop<S>(self: Arc<Self>, mut stream: S, epoch: u64)
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    debug!("Received from {}: {}", self.url, text.as_str());
                    self.handle_text(text.as_str()).await;
                }
                Ok(Message::Close(_)) => {
                    info!("Relay {} closed connection", self.url);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error from {}: {}", self.url, e);
                    break;
                }
            }
        }
        self.handle_close(epoch).await;
    }

    async fn handle_close(self: &Arc<Self>, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }

        self.writer.lock().take();
        if let Some(flush) = self.tasks.lock().flush.take() {
            flush.abort();
        }
        self.pending_acks.lock().clear();
        self.set_state(ConnectionState::Disconnected);
        self.flush_all().await;
        self.emit(RelayEvent::Disconnect);

        if self.config.auto_reconnect && self.ever_connected.load(Ordering::SeqCst) {
            let handle = tokio::spawn(Arc::clone(self).reconnect_loop(epoch));
            if let Some(previous) = self.tasks.lock().reconnect.replace(handle) {
                previous.abort();
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        loop {
            let next = self.backoff.lock().next_delay();
            let Some(delay) = next else {
                let attempts = self.backoff.lock().attempt();
                self.set_state(ConnectionState::Disconnected);
                self.emit(RelayEvent::Error {
                    kind: RelayErrorKind::Connection,
                    message: format!("giving up on {} after {attempts} reconnect attempts", self.url),
                });
                return;
            };

            self.set_state(ConnectionState::Reconnecting);
            debug!("Reconnecting to {} in {:?}", self.url, delay);
            tokio::time::sleep(delay).await;

            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            if self.connect().await {
                return;
            }
        }
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush_all().await;
        }
    }

    async fn flush_all(&self) {
        let _delivery = self.delivery.lock().await;
        let batches: Vec<(Vec<Event>, EventCallback)> = self
            .subscriptions
            .lock()
            .values_mut()
            .filter(|s| s.buffered() > 0)
            .map(|s| (s.take_sorted(), Arc::clone(&s.on_event)))
            .collect();
        for (events, on_event) in batches {
            for event in events {
                on_event(event);
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(MessageError::UnknownType(kind)) => {
                debug!("Ignoring {} message from {}", kind, self.url);
                return;
            }
            Err(e) => {
                self.emit(RelayEvent::Error {
                    kind: RelayErrorKind::Protocol,
                    message: format!("malformed message from {}: {e}", self.url),
                });
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.handle_event(subscription_id, event).await,
            RelayMessage::Eose { subscription_id } => self.handle_eose(&subscription_id).await,
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                let confirmation = PublishConfirmation::new(event_id, success, message);
                let waiter = self.pending_acks.lock().remove(&confirmation.event_id);
                if let Some((_, tx)) = waiter {
                    let _ = tx.send(confirmation.clone());
                }
                self.emit(RelayEvent::Ok(confirmation));
            }
            RelayMessage::Notice { message } => {
                info!("Notice from {}: {}", self.url, message);
                self.emit(RelayEvent::Notice(message));
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                debug!("Relay {} closed {}: {}", self.url, subscription_id, message);
                self.remove_subscription(&subscription_id, false);
                self.emit(RelayEvent::Closed {
                    subscription_id,
                    message,
                });
            }
            RelayMessage::Auth { challenge } => self.emit(RelayEvent::Auth { challenge }),
        }
    }

    async fn handle_event(&self, subscription_id: String, event: Event) {
        if !self.subscriptions.lock().contains_key(&subscription_id) {
            debug!(
                "Dropping event {} for unknown subscription {}",
                event.id, subscription_id
            );
            return;
        }

        if let Err(e) = validate_event_structure(&event, unix_now()) {
            self.emit(RelayEvent::Error {
                kind: RelayErrorKind::Validation,
                message: format!("event {} from {} rejected: {e}", event.id, self.url),
            });
            return;
        }

        let verified = tokio::task::spawn_blocking(move || {
            let outcome = verify_event_integrity(&event);
            (event, outcome)
        })
        .await;
        let event = match verified {
            Ok((event, Ok(()))) => event,
            Ok((event, Err(e))) => {
                self.emit(RelayEvent::Error {
                    kind: RelayErrorKind::Crypto,
                    message: format!("event {} from {} rejected: {e}", event.id, self.url),
                });
                return;
            }
            Err(e) => {
                self.emit(RelayEvent::Error {
                    kind: RelayErrorKind::Crypto,
                    message: format!("signature check failed to run: {e}"),
                });
                return;
            }
        };

        self.index.lock().insert(&event);
        if let Some(subscription) = self.subscriptions.lock().get_mut(&subscription_id) {
            subscription.buffer_event(event);
        }
    }

    async fn handle_eose(&self, subscription_id: &str) {
        let _delivery = self.delivery.lock().await;
        let (events, on_event, on_eose, auto_close) = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(subscription) = subscriptions.get_mut(subscription_id) else {
                return;
            };
            subscription.eose_received = true;
            subscription.cancel_timer();
            (
                subscription.take_sorted(),
                Arc::clone(&subscription.on_event),
                subscription.on_eose.clone(),
                subscription.options.auto_close,
            )
        };

        for event in events {
            on_event(event);
        }
        if let Some(on_eose) = on_eose {
            on_eose();
        }
        if auto_close {
            self.remove_subscription(subscription_id, true);
        }
    }

    /// EOSE did not arrive in time: deliver what was buffered and close.
    async fn expire_subscription(&self, subscription_id: &str) {
        let _delivery = self.delivery.lock().await;
        let Some(mut subscription) = self.subscriptions.lock().remove(subscription_id) else {
            return;
        };
        // Drop our own timer handle without aborting the running task.
        subscription.eose_timer.take();
        debug!("EOSE timeout for {} on {}", subscription_id, self.url);

        for event in subscription.take_sorted() {
            (subscription.on_event)(event);
        }
        if self.writer.lock().is_some() {
            let _ = self.send(&ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            });
        }
    }

    fn remove_subscription(&self, subscription_id: &str, send_close: bool) {
        let Some(mut subscription) = self.subscriptions.lock().remove(subscription_id) else {
            return;
        };
        subscription.cancel_timer();
        if send_close && *self.state.read() == ConnectionState::Connected {
            let close = ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            };
            if let Err(e) = self.send(&close) {
                debug!("Failed to send CLOSE {} to {}: {}", subscription_id, self.url, e);
            }
        }
    }
}
