//! Initialization and reconfiguration.

use super::harness::{
    assert_delivered_exactly, payload, publish_range, start_client, test_settings, MockBroker,
    EXCHANGE,
};
use crate::config::ConnectionParameters;
use crate::error::BrokerError;
use crate::message::MessageProperties;
use crate::pipeline::BrokerClient;
use std::sync::Arc;
use std::time::Duration;

/// Messages accepted before `initialize` are sent once parameters arrive.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_wait_for_initialize() {
    let broker = MockBroker::new();
    let client = BrokerClient::start(Arc::new(broker.clone()), test_settings());

    let sent = publish_range(&client, 0..3);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.size(), 3);
    assert_eq!(broker.connects(), 0);

    client.initialize(broker.parameters()).unwrap();

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_delivered_exactly(&broker, &sent);

    client.shutdown().await;
}

/// A malformed URI is permanent: later publishes are dropped until the
/// client is reconfigured, earlier ones are kept.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_uri_drops_new_messages() {
    let broker = MockBroker::new();
    let client = BrokerClient::start(Arc::new(broker.clone()), test_settings());
    client
        .initialize(ConnectionParameters::new("http://mock-broker"))
        .unwrap();

    let kept = publish_range(&client, 0..2);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dropped = client.publish(Some(EXCHANGE), "", MessageProperties::default(), payload(99));
    assert!(matches!(dropped, Err(BrokerError::InvalidConfiguration(_))));
    assert_eq!(client.size(), 2);
    assert_eq!(broker.connects(), 0);

    client.initialize(broker.parameters()).unwrap();

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_delivered_exactly(&broker, &kept);

    client.shutdown().await;
}

/// Reconfiguration drops the current connection and uses the new parameters.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reinitialize_reconnects() {
    let broker = MockBroker::new();
    let client = start_client(&broker, test_settings());

    let mut sent = publish_range(&client, 0..3);
    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_eq!(broker.connects(), 1);

    client.initialize(broker.parameters()).unwrap();
    sent.extend(publish_range(&client, 3..6));

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_delivered_exactly(&broker, &sent);
    assert_eq!(broker.connects(), 2);

    client.shutdown().await;
}

/// Refused credentials are retried until the broker accepts them.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_credentials_are_retried() {
    let broker = MockBroker::new();
    broker.refuse_credentials(true);
    let client = start_client(&broker, test_settings());

    let sent = publish_range(&client, 0..4);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.size(), 4);

    broker.refuse_credentials(false);

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_delivered_exactly(&broker, &sent);

    client.shutdown().await;
}

/// A valid `initialize` right after a malformed one takes effect, even when
/// the dispatcher rejects the malformed parameters in between.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quick_reconfiguration_after_malformed_uri() {
    let broker = MockBroker::new();
    let client = BrokerClient::start(Arc::new(broker.clone()), test_settings());

    let mut sent = publish_range(&client, 0..1);
    client
        .initialize(ConnectionParameters::new("http://mock-broker"))
        .unwrap();
    client.initialize(broker.parameters()).unwrap();

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);

    let body = payload(1);
    let accepted = client.publish(Some(EXCHANGE), "", MessageProperties::default(), body.clone());
    assert!(accepted.is_ok());
    sent.push(body);

    assert!(client.wait_for_confirms(Duration::from_secs(5)).await);
    assert_delivered_exactly(&broker, &sent);

    client.shutdown().await;
}
