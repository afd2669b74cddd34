//! Integration tests for the client against a live in-memory relay
//!
//! Every test starts its own relay on a free port.

mod nip46;
mod pool;
mod relay;

use nostr::{Event, EventTemplate, Keys, finalize_event};
use nostr_client::RelayConfig;
use nostr_relay::{TestRelay, TestRelayConfig};
use std::sync::Once;
use tokio::time::{Duration, Instant, sleep};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Start a relay on a free local port
pub async fn start_test_relay() -> TestRelay {
    start_test_relay_with(TestRelayConfig::default()).await
}

pub async fn start_test_relay_with(config: TestRelayConfig) -> TestRelay {
    init_tracing();
    TestRelay::start(config)
        .await
        .expect("failed to start test relay")
}

/// Short timeouts and fast flushing so tests finish quickly
pub fn fast_config() -> RelayConfig {
    RelayConfig::default()
        .connect_timeout(Duration::from_secs(2))
        .flush_interval(Duration::from_millis(10))
        .publish_timeout(Duration::from_secs(2))
        .reconnect_backoff(Duration::from_millis(20), Duration::from_millis(100), 0)
}

/// Poll `condition` until it holds, panicking with `what` after `within`
pub async fn wait_until(what: &str, within: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + within;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub fn signed(keys: &Keys, kind: u16, created_at: u64, content: &str) -> Event {
    let template = EventTemplate::new(kind, vec![], content).created_at(created_at);
    finalize_event(&template, keys.secret_key()).unwrap()
}
