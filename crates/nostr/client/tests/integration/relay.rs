//! Single relay connection against a live relay

use super::*;
use nostr::{Keys, unix_now};
use nostr_client::{
    EoseCallback, EventCallback, Filter, OkPrefix, PublishOptions, RelayConnection,
    RelayErrorKind, RelayEvent, SubscriptionOptions,
};
use nostr_relay::TestRelayConfig;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

fn collector() -> (EventCallback, Arc<Mutex<Vec<Event>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: EventCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
    (callback, seen)
}

fn eose_flag() -> (EoseCallback, Arc<AtomicBool>) {
    let flag = Arc::new(AtomicBool::new(false));
    let sink = Arc::clone(&flag);
    (Arc::new(move || sink.store(true, Ordering::SeqCst)), flag)
}

fn drain(rx: &mut broadcast::Receiver<RelayEvent>) -> Vec<RelayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn connected(relay: &nostr_relay::TestRelay) -> RelayConnection {
    let connection = RelayConnection::with_config(relay.url(), fast_config()).unwrap();
    assert!(connection.connect().await);
    connection
}

#[tokio::test]
async fn test_stored_events_arrive_newest_first_before_eose() {
    let relay = start_test_relay().await;
    let connection = connected(&relay).await;
    let keys = Keys::generate();
    let now = unix_now();

    for offset in [30, 10, 20] {
        let event = signed(&keys, 1, now - offset, &format!("note {offset}"));
        let ack = connection
            .publish(&event, PublishOptions::default())
            .await
            .unwrap();
        assert!(ack.accepted, "rejected: {}", ack.message);
    }

    let (on_event, seen) = collector();
    let (on_eose, eose) = eose_flag();
    connection
        .subscribe(
            vec![Filter::new().kinds(vec![1])],
            on_event,
            Some(on_eose),
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    wait_until("EOSE", Duration::from_secs(5), || eose.load(Ordering::SeqCst)).await;
    let contents: Vec<String> = seen.lock().unwrap().iter().map(|e| e.content.clone()).collect();
    assert_eq!(contents, vec!["note 10", "note 20", "note 30"]);

    connection.disconnect().await;
}

#[tokio::test]
async fn test_tampered_event_reported_once_and_not_delivered() {
    let relay = start_test_relay().await;
    let connection = connected(&relay).await;
    let mut events = connection.events();

    let (on_event, seen) = collector();
    connection
        .subscribe(
            vec![Filter::new()],
            on_event,
            None,
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    wait_until("relay subscription", Duration::from_secs(5), || {
        relay.subscription_ids().len() == 1
    })
    .await;

    let mut tampered = signed(&Keys::generate(), 1, unix_now(), "original");
    tampered.content = "forged".to_string();
    relay.push_event(&serde_json::to_value(&tampered).unwrap());

    let genuine = signed(&Keys::generate(), 1, unix_now(), "genuine");
    relay.push_event(&serde_json::to_value(&genuine).unwrap());

    wait_until("genuine delivery", Duration::from_secs(5), || {
        seen.lock().unwrap().len() == 1
    })
    .await;
    assert_eq!(seen.lock().unwrap()[0].id, genuine.id);

    let crypto_errors = drain(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                RelayEvent::Error {
                    kind: RelayErrorKind::Crypto,
                    ..
                }
            )
        })
        .count();
    assert_eq!(crypto_errors, 1);

    connection.disconnect().await;
}

#[tokio::test]
async fn test_replaceable_event_keeps_newest_version() {
    let relay = start_test_relay().await;
    let connection = connected(&relay).await;
    let keys = Keys::generate();
    let now = unix_now();
    let older = signed(&keys, 0, now - 60, r#"{"name":"old"}"#);
    let newer = signed(&keys, 0, now, r#"{"name":"new"}"#);

    let first = connection.publish(&newer, PublishOptions::default()).await.unwrap();
    assert!(first.accepted);
    let stale = connection.publish(&older, PublishOptions::default()).await.unwrap();
    assert_eq!(stale.prefix, Some(OkPrefix::Duplicate));
    assert_eq!(relay.stored_events(), vec![newer.clone()]);

    let (on_event, seen) = collector();
    connection
        .subscribe(
            vec![Filter::new().kinds(vec![0])],
            on_event,
            None,
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    wait_until("stored metadata", Duration::from_secs(5), || {
        !seen.lock().unwrap().is_empty()
    })
    .await;

    // Out-of-order arrival must not roll the cache back.
    relay.push_event(&serde_json::to_value(&older).unwrap());
    relay.push_event(&serde_json::to_value(&newer).unwrap());
    wait_until("pushed copies", Duration::from_secs(5), || {
        seen.lock().unwrap().len() == 3
    })
    .await;
    assert_eq!(connection.replaceable_event(keys.public_key(), 0), Some(newer));

    connection.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_forgets_replaceable_events() {
    let relay = start_test_relay().await;
    let keys = Keys::generate();
    relay.seed(&signed(&keys, 0, unix_now(), r#"{"name":"alice"}"#));
    let connection = connected(&relay).await;

    let (on_event, _) = collector();
    let (on_eose, eose) = eose_flag();
    connection
        .subscribe(
            vec![Filter::new().kinds(vec![0])],
            on_event,
            Some(on_eose),
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    wait_until("EOSE", Duration::from_secs(5), || eose.load(Ordering::SeqCst)).await;
    assert!(connection.replaceable_event(keys.public_key(), 0).is_some());

    connection.disconnect().await;
    assert_eq!(connection.replaceable_event(keys.public_key(), 0), None);
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let relay = start_test_relay().await;
    let connection = connected(&relay).await;
    let (on_event, seen) = collector();
    let subscription_id = connection
        .subscribe(
            vec![Filter::new().kinds(vec![1])],
            on_event,
            None,
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    wait_until("relay subscription", Duration::from_secs(5), || {
        relay.subscription_ids() == vec![subscription_id.clone()]
    })
    .await;

    relay.drop_connections();
    wait_until("resubscribe", Duration::from_secs(5), || {
        relay.connection_count() == 1 && relay.subscription_ids() == vec![subscription_id.clone()]
    })
    .await;
    assert!(connection.is_connected());

    let publisher = connected(&relay).await;
    let note = signed(&Keys::generate(), 1, unix_now(), "after reconnect");
    publisher.publish(&note, PublishOptions::default()).await.unwrap();
    wait_until("live event", Duration::from_secs(5), || {
        seen.lock().unwrap().iter().any(|e| e.id == note.id)
    })
    .await;

    publisher.disconnect().await;
    connection.disconnect().await;
}

#[tokio::test]
async fn test_auth_challenge_then_publish() {
    let relay = start_test_relay_with(TestRelayConfig {
        auth_required: true,
        ..TestRelayConfig::default()
    })
    .await;
    let connection = RelayConnection::with_config(relay.url(), fast_config()).unwrap();
    let mut events = connection.events();
    assert!(connection.connect().await);

    let challenge = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(RelayEvent::Auth { challenge }) = events.recv().await {
                return challenge;
            }
        }
    })
    .await
    .expect("no AUTH challenge");

    let keys = Keys::generate();
    let note = signed(&keys, 1, unix_now(), "members only");
    let refused = connection.publish(&note, PublishOptions::default()).await.unwrap();
    assert!(!refused.accepted);
    assert_eq!(refused.prefix, Some(OkPrefix::AuthRequired));

    let auth = connection
        .authenticate(&challenge, keys.secret_key())
        .await
        .unwrap();
    assert!(auth.accepted, "auth rejected: {}", auth.message);

    let accepted = connection.publish(&note, PublishOptions::default()).await.unwrap();
    assert!(accepted.accepted);

    connection.disconnect().await;
}

#[tokio::test]
async fn test_unreachable_relay_reports_connection_error() {
    init_tracing();
    let connection = RelayConnection::with_config("ws://127.0.0.1:1", fast_config()).unwrap();
    let mut events = connection.events();

    assert!(!connection.connect().await);
    assert!(matches!(
        events.try_recv(),
        Ok(RelayEvent::Error {
            kind: RelayErrorKind::Connection,
            ..
        })
    ));
    assert!(
        connection
            .publish(
                &signed(&Keys::generate(), 1, unix_now(), "x"),
                PublishOptions::default()
            )
            .await
            .is_err()
    );
}
