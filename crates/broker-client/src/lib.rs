//! Resilient AMQP publisher for build event notifications.
//!
//! The broker client accepts JSON notifications from server event threads and
//! guarantees at-least-once delivery to a broker exchange using publisher
//! confirms. Callers never block on network I/O: every accepted message is
//! held in memory until the broker confirms it, across reconnects.
//!
//! # Architecture
//!
//! ```text
//! publish() ──> OutstandingConfirms ──> Dispatcher ──> ConnectionManager ──> broker
//!                     ^                                        |
//!                     |________ ConfirmListener (ack/nack) <___|
//! ```
//!
//! - [`BrokerClient`]: public entry point, cheap to clone, safe to call from any thread
//! - [`OutstandingConfirms`]: pending messages keyed by admission order and sequence tag
//! - [`ConnectionManager`]: lazy connection/channel ownership and shutdown handling
//! - [`AmqpConnector`]: the `lapin` transport behind the [`Connector`] trait
//! - [`Notifier`]: configuration-aware facade with explicit data providers

pub mod amqp;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod notifier;
pub mod pipeline;
pub mod probe;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod tests;

pub use amqp::AmqpConnector;
pub use config::{
    ClientSettings, ConnectionParameters, LinkSettings, NotifierConfig, RetryPolicy, Secret,
};
pub use connection::{ActiveChannel, ConfirmListener, ConnectionManager, ConnectionState};
pub use error::{BrokerError, BrokerResult};
pub use message::{DeliveryMode, MessageProperties, OutboundMessage, CONTENT_TYPE_JSON};
pub use notifier::{DataProvider, Notifier};
pub use pipeline::BrokerClient;
pub use probe::test_connection;
pub use tracker::{EntryId, OutstandingConfirms, SequenceTag};
pub use transport::{
    BrokerChannel, BrokerConnection, Confirm, Connector, LinkEvent, PendingConfirm,
    RequeueReason, ShutdownNotifier, ShutdownScope, ShutdownSignal,
};
