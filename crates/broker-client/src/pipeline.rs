//! Publish pipeline.
//!
//! [`BrokerClient::publish`] records the message in the tracker and wakes the
//! dispatcher; it never waits for the network. The dispatcher is a single
//! background task that owns the [`ConnectionManager`], so channel operations
//! are serialized without a lock around the channel.

use crate::config::{ClientSettings, ConnectionParameters};
use crate::connection::ConnectionManager;
use crate::error::{BrokerError, BrokerResult};
use crate::message::{MessageProperties, OutboundMessage};
use crate::tracker::{EntryId, OutstandingConfirms};
use crate::transport::{Connector, LinkEvent, RequeueReason};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

enum Command {
    Initialize(ConnectionParameters),
    Wake,
    Shutdown(oneshot::Sender<()>),
}

struct Shared {
    tracker: Arc<OutstandingConfirms>,
    enabled: AtomicBool,
    /// Cleared when the current parameters turned out to be unusable.
    snapshot_valid: AtomicBool,
    /// Exchanges the broker reported missing under the current parameters.
    missing_exchanges: Mutex<HashSet<String>>,
}

impl Shared {
    /// Forget what was learned about the previous parameters.
    fn reset_snapshot(&self) {
        self.snapshot_valid.store(true, Ordering::SeqCst);
        self.missing_exchanges.lock().clear();
    }

    fn exchange_missing(&self, exchange: &str) -> bool {
        self.missing_exchanges.lock().contains(exchange)
    }
}

/// Handle to the broker client. Cheap to clone; every clone feeds the same
/// dispatcher.
#[derive(Clone)]
pub struct BrokerClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl BrokerClient {
    /// Start the client on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(connector: Arc<dyn Connector>, settings: ClientSettings) -> Self {
        Self::start_on(&Handle::current(), connector, settings)
    }

    /// Start the client with its dispatcher on `handle`.
    pub fn start_on(handle: &Handle, connector: Arc<dyn Connector>, settings: ClientSettings) -> Self {
        let tracker = Arc::new(OutstandingConfirms::new());
        let shared = Arc::new(Shared {
            tracker: Arc::clone(&tracker),
            enabled: AtomicBool::new(true),
            snapshot_valid: AtomicBool::new(true),
            missing_exchanges: Mutex::new(HashSet::new()),
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(connector, settings, tracker, events_tx);

        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            manager,
            commands: commands_rx,
            events: events_rx,
            settings,
            attempt: 0,
            last_confirmed: 0,
            retry_at: None,
            suspended: false,
        };
        handle.spawn(dispatcher.run());

        Self {
            shared,
            commands: commands_tx,
        }
    }

    /// Replace the connection parameters. The current link is dropped and
    /// rebuilt lazily; pending messages are kept and resent.
    ///
    /// Publishing is allowed again right away. The dispatcher resets the
    /// snapshot state once more when it applies the parameters, after any
    /// failure under the previous ones.
    pub fn initialize(&self, params: ConnectionParameters) -> BrokerResult<()> {
        self.shared.reset_snapshot();
        self.commands
            .send(Command::Initialize(params))
            .map_err(|_| BrokerError::ClientStopped)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Accept a message for delivery.
    ///
    /// Returns once the message is recorded; transmission happens in the
    /// background and is retried until the broker confirms it. Only messages
    /// without a valid destination are refused, and those are not recorded.
    pub fn publish(
        &self,
        exchange: Option<&str>,
        routing_key: &str,
        properties: MessageProperties,
        body: impl Into<Vec<u8>>,
    ) -> BrokerResult<EntryId> {
        if !self.is_enabled() {
            debug!("Notifier disabled, dropping message");
            return Err(BrokerError::Disabled);
        }

        let exchange = match exchange {
            Some(exchange) if !exchange.is_empty() => exchange,
            _ => {
                error!("Invalid configuration, exchange must not be null");
                return Err(BrokerError::MissingExchange);
            }
        };

        if !self.shared.snapshot_valid.load(Ordering::SeqCst) {
            warn!(exchange, "Broker configuration is invalid, dropping message");
            return Err(BrokerError::InvalidConfiguration(
                "connection parameters are invalid until reconfigured".to_string(),
            ));
        }

        if self.shared.exchange_missing(exchange) {
            warn!(exchange, "Exchange does not exist on the broker, dropping message");
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        if self.commands.is_closed() {
            return Err(BrokerError::ClientStopped);
        }

        let message = OutboundMessage::new(exchange, routing_key, properties, body);
        let id = self.shared.tracker.hold(message);
        if self.commands.send(Command::Wake).is_err() {
            error!(id, "Dispatcher stopped while accepting message");
        }
        Ok(id)
    }

    /// Number of accepted messages not yet confirmed by the broker.
    pub fn size(&self) -> usize {
        self.shared.tracker.size()
    }

    /// Forget all pending messages without sending them.
    pub fn drain(&self) -> usize {
        let dropped = self.shared.tracker.drain();
        if dropped > 0 {
            warn!(dropped, "Drained pending messages");
        }
        dropped
    }

    /// Wait until every accepted message is confirmed. Returns false on timeout.
    pub async fn wait_for_confirms(&self, timeout: Duration) -> bool {
        let mut size = self.shared.tracker.watch_size();
        let settled = tokio::time::timeout(timeout, size.wait_for(|pending| *pending == 0)).await;
        matches!(settled, Ok(Ok(_)))
    }

    /// Stop the dispatcher and close the link. Messages still pending are lost.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Background task that moves messages from the tracker onto the wire.
struct Dispatcher {
    shared: Arc<Shared>,
    manager: ConnectionManager,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    settings: ClientSettings,
    /// Failed attempts since the broker last confirmed a message.
    attempt: u32,
    /// Tracker confirm count when `attempt` was last reset.
    last_confirmed: u64,
    retry_at: Option<Instant>,
    /// Set while no connection can succeed until the next `initialize`.
    suspended: bool,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut recovery = tokio::time::interval(self.settings.recovery_interval);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Initialize(params)) => {
                        self.manager.initialize(params).await;
                        self.shared.reset_snapshot();
                        self.attempt = 0;
                        self.retry_at = None;
                        self.suspended = false;
                    }
                    Some(Command::Wake) => {}
                    Some(Command::Shutdown(done)) => {
                        self.stop().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.on_link_event(event).await,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                }
                _ = recovery.tick() => {}
            }

            self.pump().await;
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Shutdown(signal) => self.manager.handle_shutdown(&signal),
            LinkEvent::Requeued { tag, reason } => {
                debug!(tag, ?reason, "Message queued for resend");
                if reason == RequeueReason::ConfirmTimeout {
                    self.manager.recycle_channel(tag).await;
                }
                // A requeue is a failed delivery; one backoff covers a burst.
                if self.retry_at.is_none() {
                    self.schedule_retry();
                }
            }
        }
    }

    /// Send unsent entries in admission order until none are left or the
    /// link fails.
    async fn pump(&mut self) {
        if self.suspended || self.retry_at.is_some() {
            return;
        }

        while self.shared.tracker.has_unsent() {
            let active = match self.manager.get_channel().await {
                Ok(active) => active,
                Err(e) => return self.on_connect_failure(e),
            };
            let Some((id, message)) = self.shared.tracker.next_unsent() else {
                break;
            };

            if self.shared.exchange_missing(&message.exchange) {
                self.shared.tracker.discard(id);
                continue;
            }

            let sent = match active.ensure_exchange(&message.exchange).await {
                Ok(()) => active.publish(id, &message).await.map(|_| ()),
                Err(BrokerError::ExchangeNotFound(exchange)) => {
                    error!(exchange = %exchange, id, "Exchange does not exist on the broker, dropping messages for it until reconfigured");
                    self.shared.missing_exchanges.lock().insert(exchange);
                    self.shared.tracker.discard(id);
                    // The broker closes the channel after a failed passive declare.
                    self.manager.discard_channel().await;
                    continue;
                }
                Err(e) => Err(e),
            };

            if let Err(e) = sent {
                self.shared.tracker.release(id);
                warn!(error = %e, id, "Failed to publish message, will resend");
                self.manager.handle_publish_error(&e);
                self.schedule_retry();
                return;
            }
        }
    }

    fn on_connect_failure(&mut self, err: BrokerError) {
        match err {
            BrokerError::NotInitialized => {
                debug!("Broker client not initialized, holding messages");
                self.suspended = true;
            }
            err if err.is_permanent() => {
                error!(error = %err, "Broker configuration is invalid, new messages are dropped until reconfigured");
                self.shared.snapshot_valid.store(false, Ordering::SeqCst);
                self.suspended = true;
            }
            BrokerError::AuthenticationFailure(reason) => {
                error!(reason = %reason, "Broker refused credentials");
                self.schedule_retry();
            }
            err => {
                warn!(error = %err, "Unable to connect to broker");
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        let confirmed = self.shared.tracker.confirmed();
        if confirmed != self.last_confirmed {
            self.last_confirmed = confirmed;
            self.attempt = 0;
        }
        let delay = self.settings.retry.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.retry_at = Some(Instant::now() + delay);
        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            pending = self.shared.tracker.size(),
            "Scheduling reconnect"
        );
    }

    async fn stop(&mut self) {
        self.manager.close().await;
        let pending = self.shared.tracker.size();
        if pending > 0 {
            warn!(pending, "Broker client stopped with unconfirmed messages");
        } else {
            info!("Broker client stopped");
        }
    }
}
