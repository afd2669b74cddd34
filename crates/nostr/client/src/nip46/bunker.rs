//! Remote signer ("bunker") role.
//!
//! The bunker listens for kind 24133 requests addressed to its transport key,
//! decrypts them under whichever scheme works, checks the caller's session
//! and permissions, and answers under the scheme the request arrived in.
//! Events are signed with a separate custodied user key.

use super::session::{ChallengeKind, PendingChallenge, Session};
use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::pool::{PoolSubscription, RelayPool};
use crate::relay::{RelayConfig, RelayConnection};
use crate::subscription::{EventCallback, SubscriptionOptions};
use nostr::{
    BunkerUrl, EncryptionScheme, Event, EventTemplate, KIND_NOSTR_CONNECT, Keys,
    NostrConnectMethod, NostrConnectRequest, NostrConnectResponse, NostrConnectUrl,
    SchemePriority, finalize_event, is_nostr_connect_event, parse_permissions,
    sign_event_permission,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Out-of-band approval: `connect` and denied requests are answered with an
/// `auth_url` instead of a result until the user approves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallengeConfig {
    /// Page the user opens to approve; the request id is appended as
    /// `?request=<id>`
    pub auth_url: String,
    pub challenge_expiry: Duration,
}

impl AuthChallengeConfig {
    pub fn new(auth_url: impl Into<String>) -> Self {
        Self {
            auth_url: auth_url.into(),
            challenge_expiry: Duration::from_secs(300),
        }
    }

    pub fn challenge_expiry(mut self, expiry: Duration) -> Self {
        self.challenge_expiry = expiry;
        self
    }

    fn url_for(&self, request_id: &str) -> String {
        match url::Url::parse(&self.auth_url) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("request", request_id);
                url.to_string()
            }
            Err(_) => self.auth_url.clone(),
        }
    }
}

/// Bunker configuration
#[derive(Debug, Clone)]
pub struct BunkerConfig {
    pub relays: Vec<String>,
    /// Shared secret a `connect` must present
    pub secret: Option<String>,
    /// Granted to every session on top of what the client asks for
    pub default_permissions: Vec<String>,
    /// Order tried for clients without a session
    pub schemes: SchemePriority,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub auth_challenge: Option<AuthChallengeConfig>,
    /// Answer the `nip44_*` methods
    pub nip44_methods: bool,
    pub relay_config: RelayConfig,
}

impl Default for BunkerConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            secret: None,
            default_permissions: Vec::new(),
            schemes: SchemePriority::dual(),
            session_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            auth_challenge: None,
            nip44_methods: true,
            relay_config: RelayConfig::default(),
        }
    }
}

impl BunkerConfig {
    pub fn new(relays: Vec<String>) -> Self {
        Self {
            relays,
            ..Self::default()
        }
    }

    /// Apply `NOSTR_BUNKER_SECRET`, `NOSTR_BUNKER_RELAYS` (comma separated)
    /// and `NOSTR_BUNKER_SESSION_TIMEOUT_SECS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(secret) = std::env::var("NOSTR_BUNKER_SECRET")
            && !secret.trim().is_empty()
        {
            self.secret = Some(secret.trim().to_string());
        }
        if let Ok(relays) = std::env::var("NOSTR_BUNKER_RELAYS") {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if !relays.is_empty() {
                self.relays = relays;
            }
        }
        if let Some(secs) = std::env::var("NOSTR_BUNKER_SESSION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.session_timeout = Duration::from_secs(secs);
        }
        self.relay_config = self.relay_config.with_env_overrides();
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn default_permissions(mut self, permissions: Vec<String>) -> Self {
        self.default_permissions = permissions;
        self
    }

    pub fn schemes(mut self, schemes: SchemePriority) -> Self {
        self.schemes = schemes;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn auth_challenge(mut self, challenge: AuthChallengeConfig) -> Self {
        self.auth_challenge = Some(challenge);
        self
    }

    pub fn nip44_methods(mut self, enabled: bool) -> Self {
        self.nip44_methods = enabled;
        self
    }

    pub fn relay_config(mut self, config: RelayConfig) -> Self {
        self.relay_config = config;
        self
    }
}

#[derive(Default)]
struct BunkerState {
    sessions: HashMap<String, Session>,
    /// One outstanding challenge per client pubkey
    challenges: HashMap<String, PendingChallenge>,
    /// Scheme order learned from clients that have no session yet
    sessionless: HashMap<String, (SchemePriority, Instant)>,
}

struct BunkerInner {
    transport_keys: Keys,
    user_keys: Keys,
    config: BunkerConfig,
    pool: RelayPool,
    state: Mutex<BunkerState>,
    subscriptions: Mutex<Vec<PoolSubscription>>,
    on_event: EventCallback,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

/// NIP-46 remote signer.
pub struct Bunker {
    inner: Arc<BunkerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bunker {
    /// `transport_keys` address the bunker on relays; `user_keys` sign.
    pub fn new(transport_keys: Keys, user_keys: Keys, config: BunkerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_event: EventCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });

        Self {
            inner: Arc::new(BunkerInner {
                transport_keys,
                user_keys,
                pool: RelayPool::with_config(config.relay_config.clone()),
                config,
                state: Mutex::new(BunkerState::default()),
                subscriptions: Mutex::new(Vec::new()),
                on_event,
                incoming: Mutex::new(Some(rx)),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Transport public key clients address requests to.
    pub fn public_key(&self) -> &str {
        self.inner.transport_keys.public_key()
    }

    /// Public key of the custodied signing key.
    pub fn user_public_key(&self) -> &str {
        self.inner.user_keys.public_key()
    }

    pub fn config(&self) -> &BunkerConfig {
        &self.inner.config
    }

    /// Connection string advertising this bunker.
    pub fn bunker_url(&self) -> BunkerUrl {
        let url = BunkerUrl::new(self.public_key(), self.inner.config.relays.clone());
        match &self.inner.config.secret {
            Some(secret) => url.with_secret(secret.clone()),
            None => url,
        }
    }

    /// Connect to the configured relays and start answering requests.
    ///
    /// Fails if no relay could be reached. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        let Some(mut incoming) = self.inner.incoming.lock().take() else {
            return Ok(());
        };

        for relay in &self.inner.config.relays {
            self.inner.pool.add_relay(relay).await?;
        }
        let connected = self.inner.pool.connect_all().await;
        if !connected.values().any(|ok| *ok) {
            *self.inner.incoming.lock() = Some(incoming);
            return Err(ClientError::Connection(
                "no bunker relay reachable".to_string(),
            ));
        }

        let subscriptions = self
            .inner
            .pool
            .subscribe(
                vec![self.inner.request_filter()],
                Arc::clone(&self.inner.on_event),
                None,
            )
            .await?;
        self.inner.subscriptions.lock().extend(subscriptions);

        let handler = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                while let Some(event) = incoming.recv().await {
                    inner.handle_event(event).await;
                }
                debug!("Bunker request stream closed");
            })
        };
        let sweeper = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.sweep_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    inner.sweep();
                }
            })
        };
        self.tasks.lock().extend([handler, sweeper]);

        info!(
            "Bunker {} listening on {} relay(s)",
            self.public_key(),
            connected.values().filter(|ok| **ok).count()
        );
        Ok(())
    }

    /// Stop answering and close every relay.
    pub async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let subscriptions: Vec<PoolSubscription> =
            self.inner.subscriptions.lock().drain(..).collect();
        self.inner.pool.unsubscribe(&subscriptions).await;
        self.inner.pool.disconnect_all().await;
        info!("Bunker {} stopped", self.public_key());
    }

    /// Approve the outstanding challenge for `client_pubkey` and send the
    /// deferred answer under the original request id.
    ///
    /// Returns `false` when there is no live challenge for that client.
    pub async fn resolve_auth_challenge(&self, client_pubkey: &str) -> Result<bool> {
        let resolved = {
            let mut state = self.inner.state.lock();
            let Some(challenge) = state.challenges.remove(client_pubkey) else {
                return Ok(false);
            };
            let expiry = self
                .inner
                .config
                .auth_challenge
                .as_ref()
                .map(|c| c.challenge_expiry)
                .unwrap_or(Duration::ZERO);
            if challenge.is_expired(Instant::now(), expiry) {
                debug!("Auth challenge for {} already expired", client_pubkey);
                return Ok(false);
            }
            let response = self.inner.apply_challenge(&mut state, &challenge);
            (challenge.scheme, response)
        };

        let (scheme, response) = resolved;
        info!("Auth challenge for {} resolved", client_pubkey);
        self.inner.respond(client_pubkey, scheme, &response).await?;
        Ok(true)
    }

    /// Answer a `nostrconnect://` string: join the client's relays, open a
    /// session with the permissions it asked for and send it the secret.
    pub async fn accept_nostrconnect(&self, url: &NostrConnectUrl) -> Result<()> {
        for relay_url in &url.relays {
            let relay = self.inner.pool.add_relay(relay_url).await?;
            self.inner.listen_on(&relay).await?;
        }

        let scheme = self.inner.config.schemes.preferred();
        {
            let mut state = self.inner.state.lock();
            let permissions = self
                .inner
                .config
                .default_permissions
                .iter()
                .chain(url.perms.iter())
                .cloned();
            state.sessions.insert(
                url.client_pubkey.clone(),
                Session::new(
                    url.client_pubkey.clone(),
                    permissions,
                    self.inner.config.schemes.clone(),
                ),
            );
        }

        let response = NostrConnectResponse::ok(nostr::generate_request_id(), url.secret.clone());
        info!("Accepting nostrconnect from {}", url.client_pubkey);
        self.inner
            .respond(&url.client_pubkey, scheme, &response)
            .await
    }

    pub fn has_session(&self, client_pubkey: &str) -> bool {
        self.inner.state.lock().sessions.contains_key(client_pubkey)
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Scheme the bunker currently prefers for a client.
    pub fn session_scheme(&self, client_pubkey: &str) -> Option<EncryptionScheme> {
        self.inner
            .state
            .lock()
            .sessions
            .get(client_pubkey)
            .map(|s| s.schemes.preferred())
    }

    pub fn has_pending_challenge(&self, client_pubkey: &str) -> bool {
        self.inner
            .state
            .lock()
            .challenges
            .contains_key(client_pubkey)
    }

    /// Drop a client's session.
    pub fn revoke_session(&self, client_pubkey: &str) -> bool {
        let mut state = self.inner.state.lock();
        state.challenges.remove(client_pubkey);
        state.sessions.remove(client_pubkey).is_some()
    }
}

impl Drop for Bunker {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn unknown_method(request: &NostrConnectRequest) -> NostrConnectResponse {
    NostrConnectResponse::error(&request.id, format!("unknown method: {}", request.method))
}

impl BunkerInner {
    fn request_filter(&self) -> Filter {
        Filter::new()
            .kinds(vec![KIND_NOSTR_CONNECT])
            .pubkey_refs(vec![self.transport_keys.public_key().to_string()])
    }

    async fn listen_on(&self, relay: &RelayConnection) -> Result<()> {
        let already = {
            let subscriptions = self.subscriptions.lock();
            subscriptions.iter().any(|s| s.relay_url == relay.url())
        };
        if already {
            return Ok(());
        }
        if !relay.connect().await {
            return Err(ClientError::Connection(format!(
                "could not reach {}",
                relay.url()
            )));
        }
        let subscription_id = relay
            .subscribe(
                vec![self.request_filter()],
                Arc::clone(&self.on_event),
                None,
                SubscriptionOptions::default(),
            )
            .await?;
        self.subscriptions.lock().push(PoolSubscription {
            relay_url: relay.url().to_string(),
            subscription_id,
        });
        Ok(())
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let sessions_before = state.sessions.len();
        let challenges_before = state.challenges.len();

        let session_timeout = self.config.session_timeout;
        state
            .sessions
            .retain(|_, s| !s.is_idle(now, session_timeout));
        state
            .sessionless
            .retain(|_, (_, last_seen)| now.saturating_duration_since(*last_seen) <= session_timeout);
        if let Some(auth) = &self.config.auth_challenge {
            state
                .challenges
                .retain(|_, c| !c.is_expired(now, auth.challenge_expiry));
        }

        let evicted_sessions = sessions_before - state.sessions.len();
        let evicted_challenges = challenges_before - state.challenges.len();
        if evicted_sessions + evicted_challenges > 0 {
            debug!(
                "Bunker sweep evicted {} session(s) and {} challenge(s)",
                evicted_sessions, evicted_challenges
            );
        }
    }

    async fn handle_event(&self, event: Event) {
        if !is_nostr_connect_event(&event) || event.pubkey == self.transport_keys.public_key() {
            return;
        }
        let client = event.pubkey.clone();

        let decrypted = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let secret_key = self.transport_keys.secret_key();
            match state.sessions.get_mut(&client) {
                Some(session) => session.schemes.decrypt(secret_key, &client, &event.content),
                None => {
                    let mut schemes = state
                        .sessionless
                        .get(&client)
                        .map(|(schemes, _)| schemes.clone())
                        .unwrap_or_else(|| self.config.schemes.clone());
                    let decrypted = schemes.decrypt(secret_key, &client, &event.content);
                    if decrypted.is_ok() {
                        state
                            .sessionless
                            .insert(client.clone(), (schemes, Instant::now()));
                    }
                    decrypted
                }
            }
        };
        let (plaintext, scheme) = match decrypted {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!("Dropping undecryptable request from {}: {}", client, e);
                return;
            }
        };

        let request = match NostrConnectRequest::from_json(&plaintext) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping malformed request from {}: {}", client, e);
                return;
            }
        };
        debug!(
            "Bunker request {} '{}' from {} ({})",
            request.id, request.method, client, scheme
        );

        let response = {
            let mut state = self.state.lock();
            self.dispatch(&mut state, &client, scheme, &request)
        };
        if let Err(e) = self.respond(&client, scheme, &response).await {
            warn!("Failed to answer {} from {}: {}", request.id, client, e);
        }
    }

    fn dispatch(
        &self,
        state: &mut BunkerState,
        client: &str,
        scheme: EncryptionScheme,
        request: &NostrConnectRequest,
    ) -> NostrConnectResponse {
        let method = match request.method() {
            Ok(method) => method,
            Err(_) => return unknown_method(request),
        };
        if !self.config.nip44_methods
            && matches!(
                method,
                NostrConnectMethod::Nip44Encrypt | NostrConnectMethod::Nip44Decrypt
            )
        {
            return unknown_method(request);
        }

        if method == NostrConnectMethod::Connect {
            return self.handle_connect(state, client, scheme, request);
        }

        let Some(session) = state.sessions.get_mut(client) else {
            return NostrConnectResponse::error(&request.id, "unauthorized");
        };
        session.touch();
        session.schemes.promote(scheme);

        match method {
            NostrConnectMethod::Connect => unknown_method(request),
            NostrConnectMethod::Ping => NostrConnectResponse::ok(&request.id, "pong"),
            NostrConnectMethod::GetPublicKey => {
                NostrConnectResponse::ok(&request.id, self.user_keys.public_key())
            }
            NostrConnectMethod::SignEvent => {
                let template: EventTemplate = match request
                    .params
                    .first()
                    .map(|json| serde_json::from_str(json))
                {
                    Some(Ok(template)) => template,
                    Some(Err(e)) => {
                        return NostrConnectResponse::error(
                            &request.id,
                            format!("invalid event: {e}"),
                        );
                    }
                    None => return NostrConnectResponse::error(&request.id, "missing event"),
                };
                if !session.allows_sign(template.kind) {
                    let permission = sign_event_permission(template.kind);
                    return self.deny(state, client, scheme, request, permission);
                }
                match finalize_event(&template, self.user_keys.secret_key())
                    .map_err(|e| e.to_string())
                    .and_then(|event| serde_json::to_string(&event).map_err(|e| e.to_string()))
                {
                    Ok(json) => NostrConnectResponse::ok(&request.id, json),
                    Err(e) => NostrConnectResponse::error(&request.id, format!("signing failed: {e}")),
                }
            }
            NostrConnectMethod::Nip04Encrypt
            | NostrConnectMethod::Nip04Decrypt
            | NostrConnectMethod::Nip44Encrypt
            | NostrConnectMethod::Nip44Decrypt => {
                if !session.allows(method.as_str()) {
                    return self.deny(state, client, scheme, request, method.as_str().to_string());
                }
                self.handle_cipher(method, request)
            }
        }
    }

    fn handle_connect(
        &self,
        state: &mut BunkerState,
        client: &str,
        scheme: EncryptionScheme,
        request: &NostrConnectRequest,
    ) -> NostrConnectResponse {
        if request.params.first().map(String::as_str) != Some(self.transport_keys.public_key()) {
            return NostrConnectResponse::error(&request.id, "invalid remote signer pubkey");
        }
        if let Some(secret) = &self.config.secret
            && request.params.get(1) != Some(secret)
        {
            warn!("Rejecting connect from {}: invalid secret", client);
            return NostrConnectResponse::error(&request.id, "invalid secret");
        }
        let requested = request
            .params
            .get(2)
            .map(|p| parse_permissions(p))
            .unwrap_or_default();

        if let Some(auth) = &self.config.auth_challenge {
            state.challenges.insert(
                client.to_string(),
                PendingChallenge::new(
                    client,
                    &request.id,
                    scheme,
                    ChallengeKind::Connect {
                        permissions: requested,
                    },
                ),
            );
            info!("Connect from {} waiting for approval", client);
            return NostrConnectResponse::auth_challenge(&request.id, auth.url_for(&request.id));
        }

        self.grant_session(state, client, scheme, requested);
        info!("Session opened for {}", client);
        NostrConnectResponse::ok(&request.id, "ack")
    }

    fn grant_session(
        &self,
        state: &mut BunkerState,
        client: &str,
        scheme: EncryptionScheme,
        requested: Vec<String>,
    ) {
        let learned = state.sessionless.remove(client).map(|(schemes, _)| schemes);
        let session = state.sessions.entry(client.to_string()).or_insert_with(|| {
            Session::new(
                client,
                Vec::new(),
                learned.unwrap_or_else(|| self.config.schemes.clone()),
            )
        });
        for permission in self.config.default_permissions.iter().cloned().chain(requested) {
            session.grant(permission);
        }
        session.schemes.promote(scheme);
        session.touch();
    }

    fn deny(
        &self,
        state: &mut BunkerState,
        client: &str,
        scheme: EncryptionScheme,
        request: &NostrConnectRequest,
        permission: String,
    ) -> NostrConnectResponse {
        let Some(auth) = &self.config.auth_challenge else {
            debug!("Denied {} to {}", permission, client);
            return NostrConnectResponse::error(
                &request.id,
                format!("permission denied: {permission}"),
            );
        };
        state.challenges.insert(
            client.to_string(),
            PendingChallenge::new(
                client,
                &request.id,
                scheme,
                ChallengeKind::Permission {
                    permission,
                    request: request.clone(),
                },
            ),
        );
        NostrConnectResponse::auth_challenge(&request.id, auth.url_for(&request.id))
    }

    fn handle_cipher(
        &self,
        method: NostrConnectMethod,
        request: &NostrConnectRequest,
    ) -> NostrConnectResponse {
        let (Some(peer), Some(text)) = (request.params.first(), request.params.get(1)) else {
            return NostrConnectResponse::error(&request.id, "expected [pubkey, text]");
        };
        let secret_key = self.user_keys.secret_key();
        let result = match method {
            NostrConnectMethod::Nip04Encrypt => EncryptionScheme::Nip04.encrypt(secret_key, peer, text),
            NostrConnectMethod::Nip04Decrypt => EncryptionScheme::Nip04.decrypt(secret_key, peer, text),
            NostrConnectMethod::Nip44Encrypt => EncryptionScheme::Nip44.encrypt(secret_key, peer, text),
            _ => EncryptionScheme::Nip44.decrypt(secret_key, peer, text),
        };
        match result {
            Ok(output) => NostrConnectResponse::ok(&request.id, output),
            Err(e) => NostrConnectResponse::error(&request.id, e.to_string()),
        }
    }

    fn apply_challenge(
        &self,
        state: &mut BunkerState,
        challenge: &PendingChallenge,
    ) -> NostrConnectResponse {
        let client = challenge.client_pubkey.as_str();
        match &challenge.kind {
            ChallengeKind::Connect { permissions } => {
                self.grant_session(state, client, challenge.scheme, permissions.clone());
                NostrConnectResponse::ok(&challenge.request_id, "ack")
            }
            ChallengeKind::Permission {
                permission,
                request,
            } => {
                let Some(session) = state.sessions.get_mut(client) else {
                    return NostrConnectResponse::error(&challenge.request_id, "unauthorized");
                };
                session.grant(permission.clone());
                self.dispatch(state, client, challenge.scheme, request)
            }
        }
    }

    async fn respond(
        &self,
        client: &str,
        scheme: EncryptionScheme,
        response: &NostrConnectResponse,
    ) -> Result<()> {
        let content = scheme.encrypt(
            self.transport_keys.secret_key(),
            client,
            &response.to_json()?,
        )?;
        let template = EventTemplate::new(
            KIND_NOSTR_CONNECT,
            vec![vec!["p".to_string(), client.to_string()]],
            content,
        );
        let event = finalize_event(&template, self.transport_keys.secret_key())?;

        let result = self.pool.publish_event(&event).await;
        if !result.success {
            return Err(ClientError::PublishFailed(format!(
                "response {} to {} not accepted by any relay",
                response.id, client
            )));
        }
        debug!("Answered {} to {} ({})", response.id, client, scheme);
        Ok(())
    }
}
