//! Broker stops confirming for a while.

use super::harness::{
    assert_delivered_at_least_once, publish_range, start_client, test_settings, MockBroker,
};
use std::time::Duration;

/// Confirms stop upstream, then come back: everything is eventually confirmed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_timeout_recovers() {
    let broker = MockBroker::new();
    let mut settings = test_settings();
    settings.confirm_timeout = Duration::from_millis(300);
    let client = start_client(&broker, settings);

    broker.stall();
    let sent = publish_range(&client, 0..20);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.size(), 20);
    assert_eq!(broker.delivered_count(), 0);

    broker.resume();

    assert!(client.wait_for_confirms(Duration::from_secs(10)).await);
    assert_eq!(client.size(), 0);
    assert_delivered_at_least_once(&broker, &sent);

    client.shutdown().await;
}

/// A missing confirm makes the client move to a fresh channel.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_confirm_recycles_channel() {
    let broker = MockBroker::new();
    let mut settings = test_settings();
    settings.confirm_timeout = Duration::from_millis(200);
    let client = start_client(&broker, settings);

    broker.stall();
    publish_range(&client, 0..3);
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(broker.channels() >= 2);
    assert_eq!(broker.connects(), 1);
    assert_eq!(client.size(), 3);

    broker.resume();
    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);

    client.shutdown().await;
}

/// Unconfirmed messages keep the pending count up for as long as the stall lasts.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_premature_success_while_stalled() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());

    broker.stall();
    publish_range(&client, 0..10);

    assert!(!client.wait_for_confirms(Duration::from_millis(500)).await);
    assert_eq!(client.size(), 10);

    broker.resume();
    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);

    client.shutdown().await;
}
