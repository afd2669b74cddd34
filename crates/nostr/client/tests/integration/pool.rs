//! Relay pool integration tests

use super::*;
use nostr::{Keys, unix_now};
use nostr_client::{
    EoseCallback, EventCallback, Filter, RelayEvent, RelayPool, SubscriptionOptions,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_pool_publishes_to_multiple_relays() {
    let relay_a = start_test_relay().await;
    let relay_b = start_test_relay().await;
    let pool = RelayPool::with_relays(
        &[
            relay_a.url().to_string(),
            relay_b.url().to_string(),
            "ws://127.0.0.1:1".to_string(),
        ],
        fast_config(),
    )
    .await
    .unwrap();

    let connected = pool.connect_all().await;
    assert_eq!(connected.values().filter(|ok| **ok).count(), 2);
    assert_eq!(pool.connected_count().await, 2);

    let event = signed(&Keys::generate(), 1, unix_now(), "pool publish");
    let details = pool.publish_with_details(&event).await;
    assert!(details.result.success);
    assert_eq!(details.success_count, 2);
    assert_eq!(details.failure_count, 1);
    assert_eq!(details.result.event_id, event.id);

    assert_eq!(relay_a.stored_events(), vec![event.clone()]);
    assert_eq!(relay_b.stored_events(), vec![event]);

    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_pool_subscription_merges_relays_and_fires_eose_once() {
    let relay_a = start_test_relay().await;
    let relay_b = start_test_relay().await;
    let keys = Keys::generate();
    let now = unix_now();
    let shared = signed(&keys, 1, now - 10, "on both");
    relay_a.seed(&shared);
    relay_b.seed(&shared);
    relay_b.seed(&signed(&keys, 1, now - 5, "only on b"));

    let pool = RelayPool::with_relays(
        &[relay_a.url().to_string(), relay_b.url().to_string()],
        fast_config(),
    )
    .await
    .unwrap();
    pool.connect_all().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let on_event: EventCallback = Arc::new(move |event| sink.lock().unwrap().push(event.id));
    let eose_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&eose_calls);
    let on_eose: EoseCallback = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let subscriptions = pool
        .subscribe(vec![Filter::new().authors(vec![keys.public_key().to_string()])], on_event, Some(on_eose))
        .await
        .unwrap();
    assert_eq!(subscriptions.len(), 2);

    wait_until("EOSE from both relays", Duration::from_secs(5), || {
        eose_calls.load(Ordering::SeqCst) == 1
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(eose_calls.load(Ordering::SeqCst), 1);

    let unique: HashSet<String> = seen.lock().unwrap().iter().cloned().collect();
    assert_eq!(unique.len(), 2);
    assert!(unique.contains(&shared.id));

    pool.disconnect_all().await;
}

fn eose_counter() -> (EoseCallback, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let on_eose: EoseCallback = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (on_eose, calls)
}

#[tokio::test]
async fn test_pool_eose_counts_closed_subscriptions() {
    let relay_a = start_test_relay().await;
    let relay_b = start_test_relay().await;
    let pool = RelayPool::with_relays(
        &[relay_a.url().to_string(), relay_b.url().to_string()],
        fast_config(),
    )
    .await
    .unwrap();
    pool.connect_all().await;
    let mut events = pool.events();

    // Both relays refuse a REQ without filters with CLOSED and never send EOSE.
    let (on_eose, eose_calls) = eose_counter();
    let subscriptions = pool
        .subscribe(Vec::new(), Arc::new(|_| {}), Some(on_eose))
        .await
        .unwrap();
    assert_eq!(subscriptions.len(), 2);

    wait_until("pool EOSE", Duration::from_secs(5), || {
        eose_calls.load(Ordering::SeqCst) == 1
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(eose_calls.load(Ordering::SeqCst), 1);

    let mut closed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event.event, RelayEvent::Closed { .. }) {
            closed += 1;
        }
    }
    assert_eq!(closed, 2);
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_pool_eose_counts_expired_subscriptions() {
    let live = start_test_relay().await;
    let pool = RelayPool::with_relays(
        &[live.url().to_string(), "ws://127.0.0.1:1".to_string()],
        fast_config(),
    )
    .await
    .unwrap();
    pool.connect_all().await;

    let (on_eose, eose_calls) = eose_counter();
    let wait = Duration::from_millis(300);
    let started = Instant::now();
    let subscriptions = pool
        .subscribe_with_options(
            vec![Filter::new().kinds(vec![1])],
            Arc::new(|_| {}),
            Some(on_eose),
            SubscriptionOptions::default().eose_timeout(wait),
        )
        .await
        .unwrap();
    assert_eq!(subscriptions.len(), 2);

    wait_until("pool EOSE", Duration::from_secs(5), || {
        eose_calls.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(started.elapsed() >= wait);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(eose_calls.load(Ordering::SeqCst), 1);
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_unsubscribe_all_closes_on_every_relay() {
    let relay_a = start_test_relay().await;
    let relay_b = start_test_relay().await;
    let pool = RelayPool::with_relays(
        &[relay_a.url().to_string(), relay_b.url().to_string()],
        fast_config(),
    )
    .await
    .unwrap();
    pool.connect_all().await;

    let on_event: EventCallback = Arc::new(|_| {});
    pool.subscribe(vec![Filter::new().kinds(vec![1])], Arc::clone(&on_event), None)
        .await
        .unwrap();
    pool.subscribe(vec![Filter::new().kinds(vec![7])], on_event, None)
        .await
        .unwrap();
    wait_until("subscriptions on both relays", Duration::from_secs(5), || {
        relay_a.subscription_ids().len() == 2 && relay_b.subscription_ids().len() == 2
    })
    .await;

    pool.unsubscribe_all().await;
    wait_until("CLOSE on both relays", Duration::from_secs(5), || {
        relay_a.subscription_ids().is_empty() && relay_b.subscription_ids().is_empty()
    })
    .await;
    for url in pool.relay_urls().await {
        let relay = pool.relay(&url).await.unwrap();
        assert!(relay.active_subscriptions().is_empty());
    }

    pool.disconnect_all().await;
}
