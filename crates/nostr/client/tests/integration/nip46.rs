//! Remote signing end to end: bunker and client talking through one relay

use super::*;
use nostr::{
    BunkerUrl, EncryptionScheme, EventTemplate, KIND_NOSTR_CONNECT, Keys, NostrConnectRequest,
    NostrConnectResponse, verify_event,
};
use nostr_client::{
    AuthChallengeConfig, Bunker, BunkerConfig, ClientError, ClientEvent, EventCallback, Filter,
    PublishOptions, RelayConnection, RemoteSignerClient, RemoteSignerConfig, SimpleBunker,
    SimpleRemoteSigner, SubscriptionOptions,
};
use nostr_relay::TestRelay;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SECRET: &str = "s3cret";

fn bunker_config(relay: &TestRelay) -> BunkerConfig {
    BunkerConfig::new(vec![relay.url().to_string()])
        .secret(SECRET)
        .default_permissions(vec!["sign_event:1".to_string(), "nip04_encrypt".to_string()])
        .relay_config(fast_config())
}

fn client_config() -> RemoteSignerConfig {
    RemoteSignerConfig::default()
        .relay_config(fast_config())
        .request_timeout(Duration::from_secs(5))
}

async fn started(relay: &TestRelay, user: &Keys, config: BunkerConfig) -> Bunker {
    let bunker = Bunker::new(Keys::generate(), user.clone(), config);
    bunker.start().await.unwrap();
    wait_until("bunker subscription", Duration::from_secs(5), || {
        !relay.subscription_ids().is_empty()
    })
    .await;
    bunker
}

fn rejected_with(result: Result<impl std::fmt::Debug, ClientError>, expected: &str) {
    match result {
        Err(ClientError::Rejected(message)) => assert_eq!(message, expected),
        other => panic!("expected rejection '{expected}', got {other:?}"),
    }
}

#[tokio::test]
async fn test_remote_signing_round_trip() {
    let relay = start_test_relay().await;
    let user = Keys::generate();
    let bunker = started(&relay, &user, bunker_config(&relay)).await;

    let client = RemoteSignerClient::new(client_config());
    let pubkey = client.connect_bunker(&bunker.bunker_url()).await.unwrap();
    assert_eq!(pubkey, user.public_key());
    assert_eq!(client.user_pubkey().as_deref(), Some(user.public_key()));
    assert!(bunker.has_session(client.public_key()));

    client.ping().await.unwrap();

    let event = client
        .sign_event(&EventTemplate::new(1, vec![], "signed remotely"))
        .await
        .unwrap();
    assert_eq!(event.pubkey, user.public_key());
    assert_eq!(event.content, "signed remotely");
    assert!(verify_event(&event));

    rejected_with(
        client
            .sign_event(&EventTemplate::new(30023, vec![vec!["d".into(), "post".into()]], "long"))
            .await,
        "permission denied: sign_event:30023",
    );

    let peer = Keys::generate();
    let ciphertext = client.nip04_encrypt(peer.public_key(), "hello").await.unwrap();
    let plaintext = EncryptionScheme::Nip04
        .decrypt(peer.secret_key(), user.public_key(), &ciphertext)
        .unwrap();
    assert_eq!(plaintext, "hello");
    rejected_with(
        client.nip04_decrypt(peer.public_key(), &ciphertext).await,
        "permission denied: nip04_decrypt",
    );
    assert_eq!(client.pending_requests(), 0);

    client.disconnect().await;
    bunker.stop().await;
}

#[tokio::test]
async fn test_connect_with_wrong_secret_is_rejected() {
    let relay = start_test_relay().await;
    let bunker = started(&relay, &Keys::generate(), bunker_config(&relay)).await;

    let url = BunkerUrl::new(bunker.public_key(), vec![relay.url().to_string()])
        .with_secret("wrong");
    let client = RemoteSignerClient::new(client_config());
    rejected_with(client.connect_bunker(&url).await, "invalid secret");
    assert!(!bunker.has_session(client.public_key()));

    bunker.stop().await;
}

#[tokio::test]
async fn test_revoked_session_is_unauthorized() {
    let relay = start_test_relay().await;
    let bunker = started(&relay, &Keys::generate(), bunker_config(&relay)).await;
    let client = RemoteSignerClient::new(client_config());
    client.connect_bunker(&bunker.bunker_url()).await.unwrap();

    assert!(bunker.revoke_session(client.public_key()));
    rejected_with(client.ping().await, "unauthorized");

    client.disconnect().await;
    bunker.stop().await;
}

#[tokio::test]
async fn test_client_falls_back_to_nip04_responses() {
    let relay = start_test_relay().await;
    let user = Keys::generate();
    let config = bunker_config(&relay).schemes(nostr::SchemePriority::dual_nip04_first());
    let bunker = started(&relay, &user, config).await;

    let client = RemoteSignerClient::new(client_config());
    assert_eq!(client.preferred_scheme(), EncryptionScheme::Nip44);
    let url = client
        .start_nostrconnect(vec![relay.url().to_string()])
        .await
        .unwrap();
    wait_until("client subscription", Duration::from_secs(5), || {
        relay.subscription_ids().len() == 2
    })
    .await;

    bunker.accept_nostrconnect(&url).await.unwrap();
    let pubkey = client.wait_for_signer(Duration::from_secs(5)).await.unwrap();

    assert_eq!(pubkey, user.public_key());
    assert_eq!(client.remote_signer_pubkey().as_deref(), Some(bunker.public_key()));
    assert_eq!(client.preferred_scheme(), EncryptionScheme::Nip04);
    assert_eq!(
        bunker.session_scheme(client.public_key()),
        Some(EncryptionScheme::Nip04)
    );

    client.disconnect().await;
    bunker.stop().await;
}

#[tokio::test]
async fn test_bunker_falls_back_to_nip04_requests() {
    let relay = start_test_relay().await;
    let bunker = started(&relay, &Keys::generate(), bunker_config(&relay)).await;

    let client = RemoteSignerClient::new(
        client_config().schemes(nostr::SchemePriority::dual_nip04_first()),
    );
    client.connect_bunker(&bunker.bunker_url()).await.unwrap();

    assert_eq!(
        bunker.session_scheme(client.public_key()),
        Some(EncryptionScheme::Nip04)
    );
    client.ping().await.unwrap();

    client.disconnect().await;
    bunker.stop().await;
}

#[tokio::test]
async fn test_auth_challenges_resume_original_requests() {
    let relay = start_test_relay().await;
    let user = Keys::generate();
    let config = bunker_config(&relay)
        .auth_challenge(AuthChallengeConfig::new("https://signer.example/approve"));
    let bunker = started(&relay, &user, config).await;

    let client = RemoteSignerClient::new(client_config());
    let client_pubkey = client.public_key().to_string();
    let mut events = client.events();

    let approve = async {
        let url = loop {
            if let Ok(ClientEvent::AuthUrl { url, .. }) = events.recv().await {
                break url;
            }
        };
        assert!(url.starts_with("https://signer.example/approve?request="));
        assert!(bunker.has_pending_challenge(&client_pubkey));
        assert!(bunker.resolve_auth_challenge(&client_pubkey).await.unwrap());
    };
    let bunker_url = bunker.bunker_url();
    let (connected, ()) = tokio::join!(client.connect_bunker(&bunker_url), approve);
    assert_eq!(connected.unwrap(), user.public_key());

    let approve = async {
        loop {
            if let Ok(ClientEvent::AuthUrl { .. }) = events.recv().await {
                break;
            }
        }
        assert!(bunker.resolve_auth_challenge(&client_pubkey).await.unwrap());
    };
    let template = EventTemplate::new(30023, vec![vec!["d".into(), "post".into()]], "long");
    let (signed, ()) = tokio::join!(client.sign_event(&template), approve);
    let signed = signed.unwrap();
    assert_eq!(signed.kind, 30023);
    assert_eq!(signed.pubkey, user.public_key());

    assert!(!bunker.resolve_auth_challenge(&client_pubkey).await.unwrap());

    client.disconnect().await;
    bunker.stop().await;
}

#[tokio::test]
async fn test_unanswered_auth_challenge_times_out() {
    let relay = start_test_relay().await;
    let config = bunker_config(&relay)
        .auth_challenge(AuthChallengeConfig::new("https://signer.example/approve"));
    let bunker = started(&relay, &Keys::generate(), config).await;

    let client = RemoteSignerClient::new(client_config().auth_timeout(Duration::from_millis(300)));
    match client.connect_bunker(&bunker.bunker_url()).await {
        Err(ClientError::Timeout(message)) => assert!(message.contains("auth challenge")),
        other => panic!("expected auth timeout, got {other:?}"),
    }
    assert_eq!(client.pending_requests(), 0);

    bunker.stop().await;
}

/// A signer that grants the handshake, then answers every other request with
/// a fresh approval link every 100 ms and never with a result.
async fn start_insistent_signer(relay: &TestRelay, signer: Keys, user: String) -> JoinHandle<()> {
    let connection = RelayConnection::with_config(relay.url(), fast_config()).unwrap();
    assert!(connection.connect().await);
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let on_event: EventCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    let filter = Filter::new()
        .kinds(vec![KIND_NOSTR_CONNECT])
        .pubkey_refs(vec![signer.public_key().to_string()]);
    connection
        .subscribe(vec![filter], on_event, None, SubscriptionOptions::default())
        .await
        .unwrap();
    wait_until("signer subscription", Duration::from_secs(5), || {
        !relay.subscription_ids().is_empty()
    })
    .await;

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let plaintext = EncryptionScheme::Nip44
                .decrypt(signer.secret_key(), &event.pubkey, &event.content)
                .unwrap();
            let request = NostrConnectRequest::from_json(&plaintext).unwrap();
            let responses: Vec<NostrConnectResponse> = match request.method.as_str() {
                "connect" => vec![NostrConnectResponse::ok(&request.id, "ack")],
                "get_public_key" => vec![NostrConnectResponse::ok(&request.id, user.clone())],
                _ => (0..30)
                    .map(|round| {
                        NostrConnectResponse::auth_challenge(
                            &request.id,
                            format!("https://signer.example/approve?round={round}"),
                        )
                    })
                    .collect(),
            };
            for response in responses {
                let content = EncryptionScheme::Nip44
                    .encrypt(signer.secret_key(), &event.pubkey, &response.to_json().unwrap())
                    .unwrap();
                let template = EventTemplate::new(
                    KIND_NOSTR_CONNECT,
                    vec![vec!["p".to_string(), event.pubkey.clone()]],
                    content,
                );
                let reply = nostr::finalize_event(&template, signer.secret_key()).unwrap();
                if connection.publish(&reply, PublishOptions::default()).await.is_err() {
                    return;
                }
                sleep(Duration::from_millis(100)).await;
            }
        }
    })
}

#[tokio::test]
async fn test_repeated_auth_urls_do_not_extend_the_approval_window() {
    let relay = start_test_relay().await;
    let signer = Keys::generate();
    let user = Keys::generate();
    let task = start_insistent_signer(&relay, signer.clone(), user.public_key().to_string()).await;

    let auth_timeout = Duration::from_millis(400);
    let client = RemoteSignerClient::new(client_config().auth_timeout(auth_timeout));
    let url = BunkerUrl::new(signer.public_key(), vec![relay.url().to_string()]);
    assert_eq!(client.connect_bunker(&url).await.unwrap(), user.public_key());

    let mut events = client.events();
    let started = Instant::now();
    match client.ping().await {
        Err(ClientError::Timeout(message)) => assert!(message.contains("auth challenge")),
        other => panic!("expected auth timeout, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= auth_timeout, "gave up early after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "window kept moving: {elapsed:?}");

    let mut auth_urls = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ClientEvent::AuthUrl { .. }) {
            auth_urls += 1;
        }
    }
    assert!(auth_urls >= 2, "only {auth_urls} approval link(s) surfaced");
    assert_eq!(client.pending_requests(), 0);

    client.disconnect().await;
    task.abort();
}

#[tokio::test]
async fn test_simple_roles_speak_nip04_only() {
    let relay = start_test_relay().await;
    let user = Keys::generate();
    let bunker = SimpleBunker::with_relay_config(
        Keys::generate(),
        user.clone(),
        vec![relay.url().to_string()],
        Some(SECRET.to_string()),
        vec![
            "sign_event:1".to_string(),
            "nip04_encrypt".to_string(),
            "nip04_decrypt".to_string(),
        ],
        fast_config(),
    );
    bunker.start().await.unwrap();
    wait_until("bunker subscription", Duration::from_secs(5), || {
        !relay.subscription_ids().is_empty()
    })
    .await;

    let signer = SimpleRemoteSigner::with_config(client_config());
    assert_eq!(signer.connect(&bunker.bunker_url()).await.unwrap(), user.public_key());
    assert!(bunker.has_session(signer.public_key()));

    let event = signer
        .sign_event(&EventTemplate::new(1, vec![], "plain note"))
        .await
        .unwrap();
    assert!(verify_event(&event));

    let peer = Keys::generate();
    let ciphertext = signer.nip04_encrypt(peer.public_key(), "secret").await.unwrap();
    assert_eq!(
        signer.nip04_decrypt(peer.public_key(), &ciphertext).await.unwrap(),
        "secret"
    );
    signer.ping().await.unwrap();

    signer.disconnect().await;
    bunker.stop().await;
}
