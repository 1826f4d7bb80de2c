//! Transport seam between the broker client and the wire.
//!
//! The connection manager only talks to these traits. [`crate::amqp`] is the
//! production implementation; the test harness provides an in-memory broker.

use crate::config::{ConnectionParameters, LinkSettings};
use crate::error::BrokerResult;
use crate::message::OutboundMessage;
use crate::tracker::SequenceTag;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Broker verdict for one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Ack,
    Nack,
}

/// Resolves once the broker confirms a published message.
///
/// Resolves to an error when the channel is lost before the confirm arrives.
pub type PendingConfirm = Pin<Box<dyn Future<Output = BrokerResult<Confirm>> + Send>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection. Unexpected shutdowns of the connection or any of
    /// its channels must be reported through `notifier`.
    async fn connect(
        &self,
        params: &ConnectionParameters,
        settings: &LinkSettings,
        notifier: ShutdownNotifier,
    ) -> BrokerResult<Box<dyn BrokerConnection>>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>>;

    /// Application-initiated close.
    async fn close(&self) -> BrokerResult<()>;
}

/// A channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Switch the channel into publisher-confirm mode.
    async fn enable_confirms(&self) -> BrokerResult<()>;

    /// Check that `exchange` exists without creating it. A missing exchange
    /// is reported as [`BrokerError::ExchangeNotFound`](crate::BrokerError::ExchangeNotFound).
    async fn verify_exchange(&self, exchange: &str) -> BrokerResult<()>;

    /// Hand a message to the broker. Returns once the message is on the wire.
    async fn publish(&self, message: &OutboundMessage) -> BrokerResult<PendingConfirm>;

    /// Application-initiated close.
    async fn close(&self) -> BrokerResult<()>;
}

/// What went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownScope {
    /// Hard shutdown: the whole connection is gone.
    Connection,
    /// Soft shutdown: only the channel is gone.
    Channel,
}

/// A shutdown observed on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    /// Connection generation the signal belongs to.
    pub epoch: u64,
    pub scope: ShutdownScope,
    pub initiated_by_application: bool,
    pub reason: String,
}

/// Why a pending entry went back to the unsent set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    Nack,
    ConfirmLost,
    ConfirmTimeout,
}

/// Events delivered to the dispatcher from outside its own task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Shutdown(ShutdownSignal),
    Requeued {
        tag: SequenceTag,
        reason: RequeueReason,
    },
}

/// Handle a transport uses to report shutdowns for one connection.
#[derive(Debug, Clone)]
pub struct ShutdownNotifier {
    epoch: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl ShutdownNotifier {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { epoch, tx }
    }

    /// A notifier nobody listens to.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { epoch: 0, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Hard shutdown not requested by this process.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        self.send(ShutdownScope::Connection, false, reason.into());
    }

    /// Soft shutdown not requested by this process.
    pub fn channel_lost(&self, reason: impl Into<String>) {
        self.send(ShutdownScope::Channel, false, reason.into());
    }

    /// Close requested by this process.
    pub fn closed_by_application(&self) {
        self.send(ShutdownScope::Connection, true, "closed by application".to_string());
    }

    fn send(&self, scope: ShutdownScope, initiated_by_application: bool, reason: String) {
        // The receiver is gone once the client has shut down.
        let _ = self.tx.send(LinkEvent::Shutdown(ShutdownSignal {
            epoch: self.epoch,
            scope,
            initiated_by_application,
            reason,
        }));
    }
}
