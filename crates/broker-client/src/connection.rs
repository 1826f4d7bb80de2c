//! Connection manager.
//!
//! Owns the single broker connection and its publishing channel. Both are
//! created lazily by [`ConnectionManager::get_channel`] and thrown away when
//! the link reports a shutdown; the next call builds them again.

use crate::config::{ClientSettings, ConnectionParameters};
use crate::error::{BrokerError, BrokerResult};
use crate::message::OutboundMessage;
use crate::tracker::{EntryId, OutstandingConfirms, SequenceTag};
use crate::transport::{
    BrokerChannel, BrokerConnection, Confirm, Connector, LinkEvent, PendingConfirm, RequeueReason,
    ShutdownNotifier, ShutdownScope, ShutdownSignal,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Connection is up but no usable channel exists.
    Connected,
    /// Channel is open and in confirm mode.
    Ready,
}

/// Routes broker confirms for one channel into the tracker.
#[derive(Clone)]
pub struct ConfirmListener {
    tracker: Arc<OutstandingConfirms>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    confirm_timeout: Duration,
    resend_on_nack: bool,
}

impl ConfirmListener {
    pub fn new(
        tracker: Arc<OutstandingConfirms>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
        settings: &ClientSettings,
    ) -> Self {
        Self {
            tracker,
            events_tx,
            confirm_timeout: settings.confirm_timeout,
            resend_on_nack: settings.resend_on_nack,
        }
    }

    /// Wait for the confirm of `tag` in the background.
    pub fn watch(&self, tag: SequenceTag, confirm: PendingConfirm) {
        let listener = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(listener.confirm_timeout, confirm).await;
            listener.settle(tag, outcome);
        });
    }

    fn settle(
        &self,
        tag: SequenceTag,
        outcome: Result<BrokerResult<Confirm>, tokio::time::error::Elapsed>,
    ) {
        let reason = match outcome {
            Ok(Ok(Confirm::Ack)) => {
                self.tracker.acknowledge(tag, false);
                return;
            }
            Ok(Ok(Confirm::Nack)) => {
                warn!(tag, resend = self.resend_on_nack, "Broker rejected message");
                if self.tracker.reject(tag, false, self.resend_on_nack) == 0 || !self.resend_on_nack {
                    return;
                }
                RequeueReason::Nack
            }
            Ok(Err(e)) => {
                debug!(tag, error = %e, "Confirm lost");
                if !self.tracker.requeue(tag) {
                    return;
                }
                RequeueReason::ConfirmLost
            }
            Err(_) => {
                warn!(
                    tag,
                    timeout_ms = self.confirm_timeout.as_millis() as u64,
                    "No confirm received from broker"
                );
                if !self.tracker.requeue(tag) {
                    return;
                }
                RequeueReason::ConfirmTimeout
            }
        };

        let _ = self.events_tx.send(LinkEvent::Requeued { tag, reason });
    }
}

/// A channel in confirm mode together with its confirm listener.
pub struct ActiveChannel {
    channel: Box<dyn BrokerChannel>,
    listener: ConfirmListener,
    tags: Arc<AtomicU64>,
    /// Last tag issued before this channel opened.
    base_tag: SequenceTag,
    /// Exchanges the broker confirmed to exist on this channel.
    verified: HashSet<String>,
}

impl ActiveChannel {
    fn new(channel: Box<dyn BrokerChannel>, listener: ConfirmListener, tags: Arc<AtomicU64>) -> Self {
        let base_tag = tags.load(Ordering::SeqCst);
        Self {
            channel,
            listener,
            tags,
            base_tag,
            verified: HashSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Whether `tag` was issued on this channel.
    pub fn issued(&self, tag: SequenceTag) -> bool {
        tag > self.base_tag
    }

    /// Check `exchange` with the broker the first time this channel uses it.
    pub async fn ensure_exchange(&mut self, exchange: &str) -> BrokerResult<()> {
        if self.verified.contains(exchange) {
            return Ok(());
        }
        self.channel.verify_exchange(exchange).await?;
        debug!(exchange, "Exchange verified");
        self.verified.insert(exchange.to_string());
        Ok(())
    }

    /// Hand the entry `id` to the broker and start tracking its confirm.
    ///
    /// The tag is recorded before the confirm is watched, so an ack can never
    /// arrive for an unrecorded tag.
    pub async fn publish(&self, id: EntryId, message: &OutboundMessage) -> BrokerResult<SequenceTag> {
        let confirm = self.channel.publish(message).await?;
        let tag = self.tags.fetch_add(1, Ordering::SeqCst) + 1;

        if self.listener.tracker.record(tag, id) {
            self.listener.watch(tag, confirm);
        } else {
            debug!(id, tag, "Entry drained while publishing");
        }
        Ok(tag)
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Error closing channel");
        }
    }
}

/// Owns the connection and channel to the broker.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ClientSettings,
    tracker: Arc<OutstandingConfirms>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    params: Option<ConnectionParameters>,
    connection: Option<Box<dyn BrokerConnection>>,
    channel: Option<ActiveChannel>,
    /// Connection generation, bumped on every connect.
    epoch: u64,
    tags: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: ClientSettings,
        tracker: Arc<OutstandingConfirms>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            connector,
            settings,
            tracker,
            events_tx,
            params: None,
            connection: None,
            channel: None,
            epoch: 0,
            tags: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Store new connection parameters. The current link, if any, is closed and
    /// rebuilt with the new parameters on next use.
    pub async fn initialize(&mut self, params: ConnectionParameters) {
        self.close().await;
        info!(uri = %redact(&params.uri), "Broker client initialized");
        self.params = Some(params);
    }

    pub fn state(&self) -> ConnectionState {
        match (&self.connection, &self.channel) {
            (Some(conn), Some(ch)) if conn.is_open() && ch.is_open() => ConnectionState::Ready,
            (Some(conn), _) if conn.is_open() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    #[cfg(test)]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Return the open channel, connecting first if needed.
    pub async fn get_channel(&mut self) -> BrokerResult<&mut ActiveChannel> {
        if !matches!(&self.channel, Some(ch) if ch.is_open()) {
            self.establish().await?;
        }
        self.channel.as_mut().ok_or(BrokerError::ChannelClosed)
    }

    async fn establish(&mut self) -> BrokerResult<()> {
        let params = self.params.clone().ok_or(BrokerError::NotInitialized)?;
        params.validate()?;

        self.channel = None;
        if !self.connection.as_ref().is_some_and(|c| c.is_open()) {
            self.connect(&params).await?;
        }

        let opened = match self.connection.as_ref() {
            Some(connection) => self.open_confirm_channel(&**connection).await,
            None => Err(BrokerError::ConnectionClosed),
        };
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                if e.is_connection_level() {
                    self.connection = None;
                }
                return Err(e);
            }
        };

        let listener = ConfirmListener::new(
            Arc::clone(&self.tracker),
            self.events_tx.clone(),
            &self.settings,
        );
        self.channel = Some(ActiveChannel::new(channel, listener, Arc::clone(&self.tags)));

        let resend = self.tracker.requeue_in_flight();
        let pending = self.tracker.size();
        info!(epoch = self.epoch, resend, pending, "Broker channel ready");
        Ok(())
    }

    async fn connect(&mut self, params: &ConnectionParameters) -> BrokerResult<()> {
        self.connection = None;
        self.epoch += 1;

        let notifier = ShutdownNotifier::new(self.epoch, self.events_tx.clone());
        let timeout = self.settings.link.connection_timeout;
        let connection = tokio::time::timeout(
            timeout,
            self.connector.connect(params, &self.settings.link, notifier),
        )
        .await
        .map_err(|_| BrokerError::Timeout(timeout))??;

        info!(epoch = self.epoch, tls = params.is_tls(), "Connected to broker");
        self.connection = Some(connection);
        Ok(())
    }

    async fn open_confirm_channel(
        &self,
        connection: &dyn BrokerConnection,
    ) -> BrokerResult<Box<dyn BrokerChannel>> {
        let timeout = self.settings.link.connection_timeout;
        let channel = tokio::time::timeout(timeout, connection.open_channel())
            .await
            .map_err(|_| BrokerError::Timeout(timeout))??;
        channel.enable_confirms().await?;
        Ok(channel)
    }

    /// React to a shutdown reported by the transport.
    pub fn handle_shutdown(&mut self, signal: &ShutdownSignal) {
        if signal.initiated_by_application {
            debug!(epoch = signal.epoch, "Broker connection closed by application");
            return;
        }
        if signal.epoch != self.epoch {
            debug!(epoch = signal.epoch, current = self.epoch, "Ignoring shutdown of stale connection");
            return;
        }

        match signal.scope {
            ShutdownScope::Connection => {
                warn!(reason = %signal.reason, "Broker connection was suddenly disconnected");
                self.channel = None;
                self.connection = None;
            }
            ShutdownScope::Channel => {
                warn!(reason = %signal.reason, "Broker channel was closed");
                self.channel = None;
            }
        }
    }

    /// Drop whatever a failed publish showed to be broken.
    pub fn handle_publish_error(&mut self, err: &BrokerError) {
        let scope = if err.is_connection_level() {
            ShutdownScope::Connection
        } else {
            ShutdownScope::Channel
        };
        self.handle_shutdown(&ShutdownSignal {
            epoch: self.epoch,
            scope,
            initiated_by_application: false,
            reason: err.to_string(),
        });
    }

    /// Close the channel but keep the connection.
    pub async fn discard_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
    }

    /// Close the channel if it issued `tag`. Confirms for older tags belong to
    /// channels that are already gone.
    pub async fn recycle_channel(&mut self, tag: SequenceTag) -> bool {
        if !matches!(&self.channel, Some(ch) if ch.issued(tag)) {
            return false;
        }
        info!(tag, "Recycling channel after missing confirm");
        self.discard_channel().await;
        true
    }

    /// Close channel and connection.
    pub async fn close(&mut self) {
        self.discard_channel().await;
        if let Some(connection) = self.connection.take() {
            if connection.is_open() {
                if let Err(e) = connection.close().await {
                    warn!(error = %e, "Error closing broker connection");
                }
            }
        }
    }
}

/// Strip credentials from a URI for logging.
pub(crate) fn redact(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => uri.to_string(),
    }
}
