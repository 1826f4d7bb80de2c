//! Delivery over a healthy link.

use super::harness::{
    assert_delivered_exactly, payload, publish_range, start_client, test_settings, MockBroker,
    EXCHANGE,
};
use crate::error::BrokerError;
use crate::message::{DeliveryMode, MessageProperties};
use std::time::Duration;

/// Ten messages over a healthy channel arrive exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthy_channel_delivers_every_message() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());

    let sent = publish_range(&client, 0..10);

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_eq!(client.size(), 0);
    assert_delivered_exactly(&broker, &sent);
    assert_eq!(broker.connects(), 1);

    client.shutdown().await;
}

/// Messages from one caller reach the broker in submission order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_caller_order_is_preserved() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());

    let sent = publish_range(&client, 0..50);

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_eq!(broker.delivered(), sent);

    client.shutdown().await;
}

/// Concurrent callers each get all their messages delivered.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_are_all_delivered() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());

    let mut handles = Vec::new();
    for caller in 0..4 {
        let client = client.clone();
        handles.push(std::thread::spawn(move || {
            publish_range(&client, caller * 100..caller * 100 + 100)
        }));
    }
    let sent: Vec<Vec<u8>> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert!(client.wait_for_confirms(Duration::from_secs(10)).await);
    assert_delivered_exactly(&broker, &sent);

    client.shutdown().await;
}

/// A disabled client refuses messages without recording them.
#[tokio::test]
async fn disabled_client_drops_messages() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());
    client.set_enabled(false);

    let result = client.publish(Some(EXCHANGE), "", MessageProperties::default(), payload(1));

    assert!(matches!(result, Err(BrokerError::Disabled)));
    assert_eq!(client.size(), 0);

    client.shutdown().await;
}

/// A missing or empty exchange is refused at the boundary.
#[tokio::test]
async fn missing_exchange_drops_messages() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());

    let none = client.publish(None, "", MessageProperties::default(), payload(1));
    let empty = client.publish(Some(""), "", MessageProperties::default(), payload(2));

    assert!(matches!(none, Err(BrokerError::MissingExchange)));
    assert!(matches!(empty, Err(BrokerError::MissingExchange)));
    assert_eq!(client.size(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.delivered_count(), 0);

    client.shutdown().await;
}

/// Properties are passed through to the transport untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_messages_are_delivered() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());

    let props = MessageProperties::json(DeliveryMode::Transient, Some("ci".into()));
    client
        .publish(Some(EXCHANGE), "builds.done", props, payload(7))
        .unwrap();

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_eq!(broker.delivered(), vec![payload(7)]);

    client.shutdown().await;
}

/// Drain forgets pending messages and is idempotent.
#[tokio::test]
async fn drain_resets_pending_count() {
    let broker = MockBroker::new();
    broker.cut();
    let client = start_client(&broker, test_settings());

    publish_range(&client, 0..25);
    assert_eq!(client.size(), 25);

    assert_eq!(client.drain(), 25);
    assert_eq!(client.size(), 0);
    assert_eq!(client.drain(), 0);
    assert_eq!(client.size(), 0);

    broker.restore();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.delivered_count(), 0);

    client.shutdown().await;
}

/// Publishing after shutdown reports the stopped client.
#[tokio::test]
async fn publish_after_shutdown_is_refused() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());
    client.shutdown().await;

    let result = client.publish(Some(EXCHANGE), "", MessageProperties::default(), payload(1));
    assert!(matches!(result, Err(BrokerError::ClientStopped)));
    assert_eq!(client.size(), 0);
}
