//! WebSocket server for exercising clients.
//!
//! The relay accepts WebSocket connections and answers Nostr protocol messages:
//! - EVENT: validate, store and fan out to matching subscriptions
//! - REQ: register a subscription, send stored matches and EOSE
//! - CLOSE: drop a subscription
//! - AUTH: NIP-42 authentication when required
//!
//! It also lets a test reach behind the protocol: inspect open subscriptions,
//! push raw frames, and drop every connection.

use crate::error::{RelayError, Result};
use crate::store::{EventStore, StoreOutcome};
use crate::subscription::{Filter, Subscription, SubscriptionManager, validate_subscription_id};
use futures::{SinkExt, StreamExt};
use nostr::{AUTH_KIND, Event, unix_now, validate_event_structure, verify_event_integrity};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Generate a random challenge string for NIP-42 AUTH
fn generate_auth_challenge() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

/// Test relay configuration
#[derive(Debug, Clone)]
pub struct TestRelayConfig {
    /// Bind address; port 0 picks a free one
    pub bind_addr: SocketAddr,
    /// Check structure, id and signature of incoming events
    pub verify_events: bool,
    /// Send an AUTH challenge on connect and refuse events until answered
    pub auth_required: bool,
}

impl Default for TestRelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            verify_events: true,
            auth_required: false,
        }
    }
}

struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Message>,
    subscriptions: Arc<Mutex<SubscriptionManager>>,
    task: JoinHandle<()>,
}

struct RelayState {
    config: TestRelayConfig,
    url: String,
    store: Mutex<EventStore>,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    next_connection: AtomicU64,
}

impl RelayState {
    /// Send `event` to every subscription it matches, on every connection.
    fn fan_out(&self, event: &Event) {
        let connections = self.connections.lock();
        for handle in connections.values() {
            let matching = handle.subscriptions.lock().matches_any(event);
            for sub_id in matching {
                let frame = json!(["EVENT", sub_id, event]).to_string();
                let _ = handle.outbound.send(Message::text(frame));
            }
        }
    }
}

/// In-memory Nostr relay bound to a local port.
pub struct TestRelay {
    state: Arc<RelayState>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TestRelay {
    /// Bind and start accepting connections in the background.
    pub async fn start(config: TestRelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let url = format!("ws://{local_addr}");
        info!("Relay server listening on {}", local_addr);

        let state = Arc::new(RelayState {
            config,
            url,
            store: Mutex::new(EventStore::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("New connection from {}", addr);
                        spawn_connection(&accept_state, stream, addr);
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            state,
            local_addr,
            accept_task,
        })
    }

    /// `ws://127.0.0.1:<port>`
    pub fn url(&self) -> &str {
        &self.state.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open subscription ids across all connections.
    pub fn subscription_ids(&self) -> Vec<String> {
        let connections = self.state.connections.lock();
        let mut ids: Vec<String> = connections
            .values()
            .flat_map(|h| h.subscriptions.lock().subscription_ids())
            .collect();
        ids.sort();
        ids
    }

    /// Stored events, newest first.
    pub fn stored_events(&self) -> Vec<Event> {
        self.state.store.lock().all()
    }

    /// Store an event directly, as if it had been published earlier.
    pub fn seed(&self, event: &Event) {
        self.state.store.lock().insert(event);
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Send a raw text frame to every connected client.
    pub fn push_raw(&self, text: &str) {
        for handle in self.state.connections.lock().values() {
            let _ = handle.outbound.send(Message::text(text.to_string()));
        }
    }

    /// Send `["EVENT", sub_id, event]` for every open subscription on every
    /// connection, whether or not the event matches. Bypasses validation.
    pub fn push_event(&self, event: &Value) {
        for handle in self.state.connections.lock().values() {
            for sub_id in handle.subscriptions.lock().subscription_ids() {
                let frame = json!(["EVENT", sub_id, event]).to_string();
                let _ = handle.outbound.send(Message::text(frame));
            }
        }
    }

    /// Close every client connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        let handles: Vec<ConnectionHandle> = self
            .state
            .connections
            .lock()
            .drain()
            .map(|(_, h)| h)
            .collect();
        info!("Dropping {} connection(s)", handles.len());
        for handle in handles {
            handle.task.abort();
        }
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_connection(state: &Arc<RelayState>, stream: TcpStream, addr: SocketAddr) {
    let id = state.next_connection.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let subscriptions = Arc::new(Mutex::new(SubscriptionManager::new()));

    // Registered under the lock so a fast drop_connections cannot miss it.
    let mut connections = state.connections.lock();
    let task = {
        let state = Arc::clone(state);
        let subscriptions = Arc::clone(&subscriptions);
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let result =
                handle_connection(&state, stream, addr, outbound_tx, outbound_rx, subscriptions)
                    .await;
            state.connections.lock().remove(&id);
            if let Err(e) = result {
                error!("Error handling connection from {}: {}", addr, e);
            }
        })
    };
    connections.insert(
        id,
        ConnectionHandle {
            outbound: outbound_tx,
            subscriptions,
            task,
        },
    );
}

/// Handle a single WebSocket connection
async fn handle_connection(
    state: &RelayState,
    stream: TcpStream,
    addr: SocketAddr,
    outbound_tx: mpsc::UnboundedSender<Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    subscriptions: Arc<Mutex<SubscriptionManager>>,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| RelayError::WebSocket(e.to_string()))?;
    info!("WebSocket connection established: {}", addr);

    let (mut write, mut read) = ws_stream.split();
    let auth_challenge = generate_auth_challenge();
    let mut authenticated_pubkey: Option<String> = None;

    if state.config.auth_required {
        let _ = outbound_tx.send(Message::text(json!(["AUTH", auth_challenge]).to_string()));
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {}: {}", addr, text.as_str());
                        let responses = match serde_json::from_str::<Value>(text.as_str()) {
                            Ok(value) => {
                                let mut ctx = MessageContext {
                                    state,
                                    subscriptions: &subscriptions,
                                    auth_challenge: &auth_challenge,
                                    authenticated_pubkey: &mut authenticated_pubkey,
                                };
                                handle_nostr_message(&value, &mut ctx)
                            }
                            Err(e) => {
                                warn!("Invalid JSON from {}: {}", addr, e);
                                vec![json!(["NOTICE", format!("invalid: bad JSON: {e}")])]
                            }
                        };
                        for response in responses {
                            let _ = outbound_tx.send(Message::text(response.to_string()));
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = outbound_tx.send(Message::Pong(data));
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write.send(frame).await {
                    warn!("Failed to send to {}: {}", addr, e);
                    break;
                }
            }
        }
    }

    info!("Connection closed: {}", addr);
    Ok(())
}

/// Per-message view of one connection's state.
struct MessageContext<'a> {
    state: &'a RelayState,
    subscriptions: &'a Mutex<SubscriptionManager>,
    auth_challenge: &'a str,
    authenticated_pubkey: &'a mut Option<String>,
}

fn ok(event_id: &str, accepted: bool, message: impl Into<String>) -> Value {
    json!(["OK", event_id, accepted, message.into()])
}

fn notice(message: impl Into<String>) -> Value {
    json!(["NOTICE", message.into()])
}

fn check_event(event: &Event, verify: bool) -> std::result::Result<(), String> {
    if !verify {
        return Ok(());
    }
    validate_event_structure(event, unix_now()).map_err(|e| format!("invalid: {e}"))?;
    verify_event_integrity(event).map_err(|e| format!("invalid: {e}"))
}

/// Handle a Nostr protocol message, returns the frames to send back
fn handle_nostr_message(msg: &Value, ctx: &mut MessageContext<'_>) -> Vec<Value> {
    let Some(msg_array) = msg.as_array() else {
        return vec![notice("invalid: message must be an array")];
    };
    let Some(msg_type) = msg_array.first().and_then(Value::as_str) else {
        return vec![notice("invalid: missing message type")];
    };

    match msg_type {
        "EVENT" => handle_event(msg_array, ctx),
        "REQ" => handle_req(msg_array, ctx),
        "CLOSE" => {
            let Some(sub_id) = msg_array.get(1).and_then(Value::as_str) else {
                return vec![notice("invalid: CLOSE needs a subscription id")];
            };
            if ctx.subscriptions.lock().remove(sub_id) {
                debug!("Subscription closed: {}", sub_id);
            }
            Vec::new()
        }
        "AUTH" => handle_auth(msg_array, ctx),
        other => vec![notice(format!("Unknown message type: {other}"))],
    }
}

fn handle_event(msg_array: &[Value], ctx: &mut MessageContext<'_>) -> Vec<Value> {
    let Some(raw) = msg_array.get(1) else {
        return vec![notice("invalid: EVENT message must have 2 elements")];
    };
    let event: Event = match serde_json::from_value(raw.clone()) {
        Ok(event) => event,
        Err(e) => return vec![notice(format!("invalid: failed to parse event: {e}"))],
    };

    if let Err(reason) = check_event(&event, ctx.state.config.verify_events) {
        return vec![ok(&event.id, false, reason)];
    }
    if ctx.state.config.auth_required && ctx.authenticated_pubkey.is_none() {
        return vec![ok(
            &event.id,
            false,
            "auth-required: authentication required",
        )];
    }

    let outcome = ctx.state.store.lock().insert(&event);
    match outcome {
        StoreOutcome::Duplicate => {
            return vec![ok(&event.id, true, "duplicate: already have this event")];
        }
        StoreOutcome::Stale => {
            return vec![ok(&event.id, true, "duplicate: have a newer version")];
        }
        StoreOutcome::Stored | StoreOutcome::NotStored => {}
    }
    debug!("Accepted event {} ({:?})", event.id, outcome);
    ctx.state.fan_out(&event);
    vec![ok(&event.id, true, "")]
}

fn handle_req(msg_array: &[Value], ctx: &mut MessageContext<'_>) -> Vec<Value> {
    let Some(sub_id) = msg_array.get(1).and_then(Value::as_str) else {
        return vec![notice("invalid: REQ needs a subscription id")];
    };
    if let Err(e) = validate_subscription_id(sub_id) {
        return vec![notice(e.to_string())];
    }

    let mut filters = Vec::new();
    for value in msg_array.iter().skip(2) {
        let filter: Filter = match serde_json::from_value(value.clone()) {
            Ok(filter) => filter,
            Err(e) => {
                return vec![json!([
                    "CLOSED",
                    sub_id,
                    format!("invalid: failed to parse filter: {e}")
                ])];
            }
        };
        if let Err(e) = filter.validate() {
            return vec![json!(["CLOSED", sub_id, e.to_string()])];
        }
        filters.push(filter);
    }
    if filters.is_empty() {
        return vec![json!(["CLOSED", sub_id, "invalid: REQ needs at least one filter"])];
    }

    let mut responses = Vec::new();
    {
        let store = ctx.state.store.lock();
        let mut seen = std::collections::HashSet::new();
        for filter in &filters {
            for event in store.query(filter) {
                if seen.insert(event.id.clone()) {
                    responses.push(json!(["EVENT", sub_id, event]));
                }
            }
        }
    }
    debug!(
        "Subscription {} with {} filter(s): {} stored match(es)",
        sub_id,
        filters.len(),
        responses.len()
    );

    ctx.subscriptions
        .lock()
        .add(Subscription::new(sub_id.to_string(), filters));
    responses.push(json!(["EOSE", sub_id]));
    responses
}

fn handle_auth(msg_array: &[Value], ctx: &mut MessageContext<'_>) -> Vec<Value> {
    let Some(raw) = msg_array.get(1) else {
        return vec![notice("invalid: AUTH message must have 2 elements")];
    };
    let event: Event = match serde_json::from_value(raw.clone()) {
        Ok(event) => event,
        Err(e) => return vec![ok("", false, format!("invalid: failed to parse auth event: {e}"))],
    };
    if let Err(reason) = check_event(&event, true) {
        return vec![ok(&event.id, false, reason)];
    }
    if event.kind != AUTH_KIND {
        return vec![ok(
            &event.id,
            false,
            format!("invalid: expected kind {AUTH_KIND}, got {}", event.kind),
        )];
    }

    let our_url = ctx.state.url.trim_end_matches('/');
    let relay_ok = event
        .tag_values("relay")
        .any(|url| url.trim_end_matches('/') == our_url);
    if !relay_ok {
        return vec![ok(&event.id, false, "invalid: missing or incorrect relay tag")];
    }
    let challenge_ok = event
        .tag_values("challenge")
        .any(|c| c == ctx.auth_challenge);
    if !challenge_ok {
        return vec![ok(&event.id, false, "invalid: missing or incorrect challenge tag")];
    }

    info!("Client authenticated as {}", event.pubkey);
    *ctx.authenticated_pubkey = Some(event.pubkey.clone());
    vec![ok(&event.id, true, "")]
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventTemplate, create_auth_event, finalize_event, generate_secret_key};
    use pretty_assertions::assert_eq;

    struct Harness {
        state: RelayState,
        subscriptions: Mutex<SubscriptionManager>,
        authenticated: Option<String>,
    }

    impl Harness {
        fn new(config: TestRelayConfig) -> Self {
            Self {
                state: RelayState {
                    config,
                    url: "ws://127.0.0.1:7000".to_string(),
                    store: Mutex::new(EventStore::new()),
                    connections: Mutex::new(HashMap::new()),
                    next_connection: AtomicU64::new(0),
                },
                subscriptions: Mutex::new(SubscriptionManager::new()),
                authenticated: None,
            }
        }

        fn send(&mut self, msg: Value) -> Vec<Value> {
            let mut ctx = MessageContext {
                state: &self.state,
                subscriptions: &self.subscriptions,
                auth_challenge: "challenge",
                authenticated_pubkey: &mut self.authenticated,
            };
            handle_nostr_message(&msg, &mut ctx)
        }
    }

    fn note(content: &str) -> Event {
        let template = EventTemplate::new(1, vec![], content);
        finalize_event(&template, &generate_secret_key()).unwrap()
    }

    #[test]
    fn test_handle_event_message() {
        let mut relay = Harness::new(TestRelayConfig::default());
        let event = note("hello");

        let responses = relay.send(json!(["EVENT", event]));
        assert_eq!(responses, vec![json!(["OK", event.id, true, ""])]);

        let again = relay.send(json!(["EVENT", event]));
        assert_eq!(again[0][3], "duplicate: already have this event");
    }

    #[test]
    fn test_tampered_event_rejected() {
        let mut relay = Harness::new(TestRelayConfig::default());
        let mut event = note("hello");
        event.content = "changed".to_string();

        let responses = relay.send(json!(["EVENT", event]));
        assert_eq!(responses[0][2], false);
        assert!(responses[0][3].as_str().unwrap().starts_with("invalid:"));
        assert!(relay.state.store.lock().is_empty());
    }

    #[test]
    fn test_handle_req_message() {
        let mut relay = Harness::new(TestRelayConfig::default());
        let event = note("stored");
        relay.send(json!(["EVENT", event]));

        let responses = relay.send(json!(["REQ", "sub_123", {"kinds": [1]}]));
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0][0], "EVENT");
        assert_eq!(responses[0][2]["id"], event.id.as_str());
        assert_eq!(responses[1], json!(["EOSE", "sub_123"]));
        assert_eq!(relay.subscriptions.lock().len(), 1);
    }

    #[test]
    fn test_handle_close_message() {
        let mut relay = Harness::new(TestRelayConfig::default());
        relay.send(json!(["REQ", "sub_123", {}]));
        assert!(relay.send(json!(["CLOSE", "sub_123"])).is_empty());
        assert!(relay.subscriptions.lock().is_empty());
    }

    #[test]
    fn test_handle_invalid_message() {
        let mut relay = Harness::new(TestRelayConfig::default());
        assert_eq!(relay.send(json!({"not": "array"}))[0][0], "NOTICE");
        assert_eq!(relay.send(json!(["BOGUS"]))[0][0], "NOTICE");
        assert_eq!(
            relay.send(json!(["REQ", "s", {"limit": 9999}]))[0][0],
            "CLOSED"
        );
    }

    #[test]
    fn test_auth_required_flow() {
        let mut relay = Harness::new(TestRelayConfig {
            auth_required: true,
            ..TestRelayConfig::default()
        });
        let sk = generate_secret_key();
        let event = note("needs auth");

        let refused = relay.send(json!(["EVENT", event]));
        assert!(refused[0][3].as_str().unwrap().starts_with("auth-required:"));

        let wrong = finalize_event(&create_auth_event("nope", "ws://127.0.0.1:7000"), &sk).unwrap();
        assert_eq!(relay.send(json!(["AUTH", wrong]))[0][2], false);

        let auth = finalize_event(&create_auth_event("challenge", "ws://127.0.0.1:7000/"), &sk)
            .unwrap();
        assert_eq!(relay.send(json!(["AUTH", auth]))[0][2], true);
        assert_eq!(relay.send(json!(["EVENT", event]))[0][2], true);
    }
}
