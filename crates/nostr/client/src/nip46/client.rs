//! Remote signer client.
//!
//! Talks to a bunker over kind 24133 events using an ephemeral transport key.
//! Each request waits on its own channel keyed by request id; an `auth_url`
//! response is surfaced as [`ClientEvent::AuthUrl`] and the request keeps
//! waiting for the real answer.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::pool::{PoolSubscription, RelayPool};
use crate::relay::RelayConfig;
use crate::subscription::EventCallback;
use nostr::{
    BunkerUrl, EncryptionScheme, Event, EventTemplate, KIND_NOSTR_CONNECT, Keys,
    NostrConnectMethod, NostrConnectRequest, NostrConnectResponse, NostrConnectUrl,
    SchemePriority, finalize_event, generate_request_id, is_nostr_connect_event,
    verify_event_integrity,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Remote signer client configuration
#[derive(Debug, Clone)]
pub struct RemoteSignerConfig {
    /// Wait for an answer to a request
    pub request_timeout: Duration,
    /// Approval window, opened by the first `auth_url` of a request
    pub auth_timeout: Duration,
    pub schemes: SchemePriority,
    pub relay_config: RelayConfig,
    /// Permissions asked for on connect
    pub permissions: Vec<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub image: Option<String>,
}

impl Default for RemoteSignerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(300),
            schemes: SchemePriority::dual(),
            relay_config: RelayConfig::default(),
            permissions: Vec::new(),
            name: None,
            url: None,
            image: None,
        }
    }
}

impl RemoteSignerConfig {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn schemes(mut self, schemes: SchemePriority) -> Self {
        self.schemes = schemes;
        self
    }

    pub fn relay_config(mut self, config: RelayConfig) -> Self {
        self.relay_config = config;
        self
    }

    pub fn permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Name shown by the signer when approving a `nostrconnect://` string.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Client lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The signer wants the user to open `url` before answering `request_id`
    AuthUrl { request_id: String, url: String },
    Connected { remote_signer_pubkey: String },
    Disconnected,
}

type ResponseSender = mpsc::UnboundedSender<NostrConnectResponse>;

/// Removes a pending request when its caller stops waiting.
struct PendingRequest {
    inner: Arc<ClientInner>,
    id: String,
}

impl PendingRequest {
    fn register(inner: &Arc<ClientInner>, id: &str, tx: ResponseSender) -> Self {
        inner.pending.lock().insert(id.to_string(), tx);
        Self {
            inner: Arc::clone(inner),
            id: id.to_string(),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

/// Secret and notifier for a `nostrconnect://` handshake in progress.
struct ConnectWaiter {
    secret: String,
    notify: oneshot::Sender<String>,
}

struct ClientInner {
    keys: Keys,
    config: RemoteSignerConfig,
    pool: RelayPool,
    remote_signer: RwLock<Option<String>>,
    user_pubkey: RwLock<Option<String>>,
    schemes: Mutex<SchemePriority>,
    pending: Mutex<HashMap<String, ResponseSender>>,
    connect_waiter: Mutex<Option<ConnectWaiter>>,
    signer_rx: tokio::sync::Mutex<Option<oneshot::Receiver<String>>>,
    subscriptions: Mutex<Vec<PoolSubscription>>,
    events_tx: broadcast::Sender<ClientEvent>,
}

/// NIP-46 client: asks a bunker to sign and encrypt on its behalf.
pub struct RemoteSignerClient {
    inner: Arc<ClientInner>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteSignerClient {
    pub fn new(config: RemoteSignerConfig) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ClientInner {
                keys: Keys::generate(),
                pool: RelayPool::with_config(config.relay_config.clone()),
                schemes: Mutex::new(config.schemes.clone()),
                config,
                remote_signer: RwLock::new(None),
                user_pubkey: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                connect_waiter: Mutex::new(None),
                signer_rx: tokio::sync::Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
                events_tx,
            }),
            handler: Mutex::new(None),
        }
    }

    /// Ephemeral transport public key of this client.
    pub fn public_key(&self) -> &str {
        self.inner.keys.public_key()
    }

    pub fn remote_signer_pubkey(&self) -> Option<String> {
        self.inner.remote_signer.read().clone()
    }

    /// User public key, known after a successful connect.
    pub fn user_pubkey(&self) -> Option<String> {
        self.inner.user_pubkey.read().clone()
    }

    /// Scheme the next request will be encrypted under.
    pub fn preferred_scheme(&self) -> EncryptionScheme {
        self.inner.schemes.lock().preferred()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Connect using a `bunker://` string and fetch the user's public key.
    pub async fn connect_bunker(&self, bunker: &BunkerUrl) -> Result<String> {
        self.listen(&bunker.relays).await?;
        *self.inner.remote_signer.write() = Some(bunker.remote_signer_pubkey.clone());

        let mut params = vec![
            bunker.remote_signer_pubkey.clone(),
            bunker.secret.clone().unwrap_or_default(),
        ];
        if !self.inner.config.permissions.is_empty() {
            params.push(self.inner.config.permissions.join(","));
        }
        self.request(NostrConnectMethod::Connect, params).await?;

        info!("Connected to remote signer {}", bunker.remote_signer_pubkey);
        self.inner.emit(ClientEvent::Connected {
            remote_signer_pubkey: bunker.remote_signer_pubkey.clone(),
        });
        self.get_public_key().await
    }

    /// Start listening on `relays` and return the `nostrconnect://` string
    /// to hand to the signer. Follow with [`Self::wait_for_signer`].
    pub async fn start_nostrconnect(&self, relays: Vec<String>) -> Result<NostrConnectUrl> {
        let url = self.nostrconnect_url(relays);
        let (notify, rx) = oneshot::channel();
        *self.inner.connect_waiter.lock() = Some(ConnectWaiter {
            secret: url.secret.clone(),
            notify,
        });
        *self.inner.signer_rx.lock().await = Some(rx);

        self.listen(&url.relays).await?;
        Ok(url)
    }

    fn nostrconnect_url(&self, relays: Vec<String>) -> NostrConnectUrl {
        let config = &self.inner.config;
        let mut url = NostrConnectUrl::new(self.public_key(), relays, generate_request_id());
        url.perms = config.permissions.clone();
        url.name = config.name.clone();
        url.url = config.url.clone();
        url.image = config.image.clone();
        url
    }

    /// Wait for a signer to answer the `nostrconnect://` string, then fetch
    /// the user's public key.
    pub async fn wait_for_signer(&self, wait: Duration) -> Result<String> {
        let rx = self
            .inner
            .signer_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ClientError::InvalidRequest("no nostrconnect handshake started".to_string()))?;

        let signer = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(signer)) => signer,
            Ok(Err(_)) => return Err(ClientError::Disconnected),
            Err(_) => {
                self.inner.connect_waiter.lock().take();
                return Err(ClientError::Timeout(format!(
                    "no remote signer answered the nostrconnect request within {wait:?}"
                )));
            }
        };

        info!("Remote signer {} accepted nostrconnect", signer);
        *self.inner.remote_signer.write() = Some(signer.clone());
        self.inner.emit(ClientEvent::Connected {
            remote_signer_pubkey: signer,
        });
        self.get_public_key().await
    }

    pub async fn get_public_key(&self) -> Result<String> {
        let pubkey = self
            .request(NostrConnectMethod::GetPublicKey, Vec::new())
            .await?;
        if !nostr::is_lower_hex(&pubkey, 64) {
            return Err(ClientError::Protocol(format!(
                "signer returned an invalid public key: {pubkey}"
            )));
        }
        *self.inner.user_pubkey.write() = Some(pubkey.clone());
        Ok(pubkey)
    }

    /// Have the signer sign `template`. The returned event is verified.
    pub async fn sign_event(&self, template: &EventTemplate) -> Result<Event> {
        let json = serde_json::to_string(template)?;
        let result = self
            .request(NostrConnectMethod::SignEvent, vec![json])
            .await?;
        let event: Event = serde_json::from_str(&result)?;
        verify_event_integrity(&event)?;

        if let Some(expected) = self.user_pubkey()
            && event.pubkey != expected
        {
            return Err(ClientError::Protocol(format!(
                "signed by {} instead of {}",
                event.pubkey, expected
            )));
        }
        if event.kind != template.kind || event.content != template.content {
            return Err(ClientError::Protocol(
                "signed event does not match the template".to_string(),
            ));
        }
        Ok(event)
    }

    pub async fn ping(&self) -> Result<()> {
        let result = self.request(NostrConnectMethod::Ping, Vec::new()).await?;
        if result != "pong" {
            return Err(ClientError::Protocol(format!("unexpected ping reply: {result}")));
        }
        Ok(())
    }

    pub async fn nip04_encrypt(&self, third_party: &str, plaintext: &str) -> Result<String> {
        self.cipher(NostrConnectMethod::Nip04Encrypt, third_party, plaintext)
            .await
    }

    pub async fn nip04_decrypt(&self, third_party: &str, ciphertext: &str) -> Result<String> {
        self.cipher(NostrConnectMethod::Nip04Decrypt, third_party, ciphertext)
            .await
    }

    pub async fn nip44_encrypt(&self, third_party: &str, plaintext: &str) -> Result<String> {
        self.cipher(NostrConnectMethod::Nip44Encrypt, third_party, plaintext)
            .await
    }

    pub async fn nip44_decrypt(&self, third_party: &str, ciphertext: &str) -> Result<String> {
        self.cipher(NostrConnectMethod::Nip44Decrypt, third_party, ciphertext)
            .await
    }

    async fn cipher(
        &self,
        method: NostrConnectMethod,
        third_party: &str,
        text: &str,
    ) -> Result<String> {
        self.request(method, vec![third_party.to_string(), text.to_string()])
            .await
    }

    /// Reject every pending request with [`ClientError::Disconnected`] and
    /// close the relays.
    pub async fn disconnect(&self) {
        if let Some(handler) = self.handler.lock().take() {
            handler.abort();
        }
        let dropped = {
            let mut pending = self.inner.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        self.inner.connect_waiter.lock().take();

        let subscriptions: Vec<PoolSubscription> =
            self.inner.subscriptions.lock().drain(..).collect();
        self.inner.pool.unsubscribe(&subscriptions).await;
        self.inner.pool.disconnect_all().await;

        let was_connected = self.inner.remote_signer.write().take().is_some();
        self.inner.user_pubkey.write().take();
        if was_connected {
            self.inner.emit(ClientEvent::Disconnected);
        }
        info!(
            "Remote signer client disconnected ({} pending request(s) rejected)",
            dropped
        );
    }

    async fn listen(&self, relays: &[String]) -> Result<()> {
        if relays.is_empty() {
            return Err(ClientError::InvalidRequest(
                "no relays to reach the signer on".to_string(),
            ));
        }
        for relay in relays {
            self.inner.pool.add_relay(relay).await?;
        }
        let connected = self.inner.pool.connect_all().await;
        if !connected.values().any(|ok| *ok) {
            return Err(ClientError::Connection(
                "no signer relay reachable".to_string(),
            ));
        }

        let Some(on_event) = self.spawn_handler() else {
            return Ok(());
        };
        let filter = Filter::new()
            .kinds(vec![KIND_NOSTR_CONNECT])
            .pubkey_refs(vec![self.public_key().to_string()]);
        let subscriptions = self.inner.pool.subscribe(vec![filter], on_event, None).await?;
        self.inner.subscriptions.lock().extend(subscriptions);
        Ok(())
    }

    /// Start the response handler unless it runs already; returns the
    /// callback feeding it.
    fn spawn_handler(&self) -> Option<EventCallback> {
        let mut handler = self.handler.lock();
        if handler.is_some() {
            return None;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let inner = Arc::clone(&self.inner);
        *handler = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.handle_event(event);
            }
        }));
        Some(Arc::new(move |event| {
            let _ = tx.send(event);
        }))
    }

    async fn request(&self, method: NostrConnectMethod, params: Vec<String>) -> Result<String> {
        let remote = self.remote_signer_pubkey().ok_or(ClientError::NotConnected)?;
        let request = NostrConnectRequest::new(method, params);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _pending = PendingRequest::register(&self.inner, &request.id, tx);

        let scheme = self.preferred_scheme();
        let secret_key = self.inner.keys.secret_key();
        let content = scheme.encrypt(secret_key, &remote, &request.to_json()?)?;
        let template = EventTemplate::new(
            KIND_NOSTR_CONNECT,
            vec![vec!["p".to_string(), remote.clone()]],
            content,
        );
        let event = finalize_event(&template, secret_key)?;

        debug!("Sending {} request {} ({})", method, request.id, scheme);
        let published = self.inner.pool.publish_event(&event).await;
        if !published.success {
            return Err(ClientError::PublishFailed(format!(
                "{} request {} not accepted by any relay",
                method, request.id
            )));
        }

        // The approval window opens at the first auth_url and never moves.
        let mut deadline = Instant::now() + self.inner.config.request_timeout;
        let mut awaiting_auth = false;
        loop {
            let response = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => return Err(ClientError::Disconnected),
                Err(_) if awaiting_auth => {
                    return Err(ClientError::Timeout(format!(
                        "auth challenge for {} request {} was not completed within {:?}",
                        method, request.id, self.inner.config.auth_timeout
                    )));
                }
                Err(_) => {
                    return Err(ClientError::Timeout(format!(
                        "{} request {} got no answer within {:?}",
                        method, request.id, self.inner.config.request_timeout
                    )));
                }
            };

            if let Some(url) = response.challenge_url() {
                info!("Signer asks for approval of {} at {}", request.id, url);
                self.inner.emit(ClientEvent::AuthUrl {
                    request_id: request.id.clone(),
                    url: url.to_string(),
                });
                if !awaiting_auth {
                    deadline = Instant::now() + self.inner.config.auth_timeout;
                    awaiting_auth = true;
                }
                continue;
            }
            if let Some(error) = response.error {
                return Err(ClientError::Rejected(error));
            }
            return Ok(response.result.unwrap_or_default());
        }
    }
}

impl Drop for RemoteSignerClient {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.get_mut().take() {
            handler.abort();
        }
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    fn handle_event(&self, event: Event) {
        if !is_nostr_connect_event(&event) {
            return;
        }
        let expected = self.remote_signer.read().clone();
        let handshake = self.connect_waiter.lock().is_some();
        if expected.as_deref() != Some(event.pubkey.as_str()) && !handshake {
            debug!("Ignoring kind {} event from {}", event.kind, event.pubkey);
            return;
        }

        let decrypted =
            self.schemes
                .lock()
                .decrypt(self.keys.secret_key(), &event.pubkey, &event.content);
        let (plaintext, scheme) = match decrypted {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!("Dropping undecryptable response from {}: {}", event.pubkey, e);
                return;
            }
        };
        let response = match NostrConnectResponse::from_json(&plaintext) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping malformed response from {}: {}", event.pubkey, e);
                return;
            }
        };
        debug!("Response {} from {} ({})", response.id, event.pubkey, scheme);

        {
            let mut waiter = self.connect_waiter.lock();
            if waiter
                .as_ref()
                .is_some_and(|w| response.result.as_deref() == Some(w.secret.as_str()))
                && let Some(w) = waiter.take()
            {
                let _ = w.notify.send(event.pubkey.clone());
                return;
            }
        }

        if expected.as_deref() != Some(event.pubkey.as_str()) {
            return;
        }
        match self.pending.lock().get(&response.id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!("No pending request for response {}", response.id),
        }
    }
}
