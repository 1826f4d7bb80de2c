//! Configuration-aware notifier facade.
//!
//! Event emitters hand JSON documents to a [`Notifier`]; it applies the
//! current [`NotifierConfig`] (exchange, routing key, message properties) and
//! forwards to the [`BrokerClient`].

use crate::config::NotifierConfig;
use crate::error::BrokerResult;
use crate::pipeline::BrokerClient;
use crate::tracker::EntryId;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Adds fields to every notification before it is published.
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    fn enrich(&self, payload: &mut Map<String, Value>);
}

/// Publishes notifications with the current configuration.
pub struct Notifier {
    client: BrokerClient,
    config: RwLock<NotifierConfig>,
    providers: Vec<Arc<dyn DataProvider>>,
}

impl Notifier {
    /// Create a notifier and apply `config` to `client`.
    pub fn new(client: BrokerClient, config: NotifierConfig) -> BrokerResult<Self> {
        let notifier = Self {
            client,
            config: RwLock::new(NotifierConfig::default()),
            providers: Vec::new(),
        };
        notifier.configure(config)?;
        Ok(notifier)
    }

    /// Register a data provider. Providers run in registration order.
    pub fn register(&mut self, provider: Arc<dyn DataProvider>) {
        debug!(provider = provider.name(), "Registered data provider");
        self.providers.push(provider);
    }

    pub fn client(&self) -> &BrokerClient {
        &self.client
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> NotifierConfig {
        self.config.read().clone()
    }

    /// Apply a new configuration. An enabled configuration re-initializes the
    /// client with its connection parameters.
    pub fn configure(&self, config: NotifierConfig) -> BrokerResult<()> {
        self.client.set_enabled(config.enable_notifier);
        if config.enable_notifier {
            self.client.initialize(config.connection_parameters()?)?;
        }
        info!(
            enabled = config.enable_notifier,
            exchange = config.exchange_name.as_deref().unwrap_or(""),
            persistent = config.persistent_delivery,
            "Notifier configured"
        );
        *self.config.write() = config;
        Ok(())
    }

    /// Publish a JSON document to the configured exchange.
    pub fn publish_json(&self, document: &Value) -> BrokerResult<EntryId> {
        let config = self.config.read().clone();
        if config.enable_verbose_logging {
            let pretty = serde_json::to_string_pretty(document)?;
            info!(
                exchange = config.exchange_name.as_deref().unwrap_or(""),
                routing_key = config.routing_key(),
                "Publishing message:\n{pretty}"
            );
        }

        let body = serde_json::to_vec(document)?;
        self.client.publish(
            config.exchange_name.as_deref(),
            config.routing_key(),
            config.message_properties(),
            body,
        )
    }

    /// Enrich `payload` with every registered provider, then publish it.
    pub fn notify(&self, mut payload: Map<String, Value>) -> BrokerResult<EntryId> {
        for provider in &self.providers {
            provider.enrich(&mut payload);
        }
        self.publish_json(&Value::Object(payload))
    }
}
