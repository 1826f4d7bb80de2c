//! Configuration for the broker client.
//!
//! [`NotifierConfig`] is the operator-facing configuration holder. The client
//! only ever sees immutable snapshots derived from it: [`ConnectionParameters`]
//! for the connection and [`MessageProperties`] for each message.

use crate::error::{BrokerError, BrokerResult};
use crate::message::{DeliveryMode, MessageProperties};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

/// URI schemes accepted for broker connections.
pub const SUPPORTED_SCHEMES: [&str; 2] = ["amqp", "amqps"];

/// Heartbeat interval requested from the broker.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A secret string that never shows up in logs.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Plain-text value, for handing to the transport only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Connection snapshot taken at `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub virtual_host: Option<String>,
}

impl ConnectionParameters {
    /// Create parameters for a URI without separate credentials.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            username: None,
            password: None,
            virtual_host: None,
        }
    }

    /// Attach credentials. Empty values are ignored so the URI's own apply.
    pub fn with_credentials(mut self, username: Option<String>, password: Option<Secret>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: Option<String>) -> Self {
        self.virtual_host = virtual_host.filter(|v| !v.is_empty());
        self
    }

    /// Check the URI is well formed, uses a supported scheme and names a host.
    pub fn validate(&self) -> BrokerResult<Url> {
        validate_uri(&self.uri)
    }

    /// Whether the URI asks for TLS.
    pub fn is_tls(&self) -> bool {
        self.uri.trim_start().to_ascii_lowercase().starts_with("amqps:")
    }
}

/// Validate a broker URI.
pub fn validate_uri(uri: &str) -> BrokerResult<Url> {
    let parsed = Url::parse(uri.trim()).map_err(|e| BrokerError::InvalidUri(format!("{uri}: {e}")))?;

    if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
        return Err(BrokerError::InvalidUri(format!(
            "{uri}: unsupported scheme '{}'",
            parsed.scheme()
        )));
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(BrokerError::InvalidUri(format!("{uri}: missing host")));
    }

    Ok(parsed)
}

/// Operator-facing notifier configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Whether notifications are published at all.
    pub enable_notifier: bool,
    /// Broker URI (`amqp://` or `amqps://`).
    pub server_uri: Option<String>,
    pub user_name: Option<String>,
    pub user_password: Option<Secret>,
    /// Exchange every notification is published to.
    pub exchange_name: Option<String>,
    pub virtual_host: Option<String>,
    pub routing_key: Option<String>,
    /// Messages delivered to durable queues are written to disk when set.
    pub persistent_delivery: bool,
    /// Application id readable by consumers.
    pub app_id: Option<String>,
    /// Log every published document.
    pub enable_verbose_logging: bool,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enable_notifier: false,
            server_uri: None,
            user_name: None,
            user_password: None,
            exchange_name: None,
            virtual_host: None,
            routing_key: None,
            persistent_delivery: true,
            app_id: None,
            enable_verbose_logging: false,
        }
    }
}

impl NotifierConfig {
    /// Load configuration from `MQ_NOTIFIER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self {
            enable_notifier: flag("MQ_NOTIFIER_ENABLED", false),
            server_uri: None,
            user_name: text("MQ_NOTIFIER_USER"),
            user_password: text("MQ_NOTIFIER_PASSWORD").map(Secret::new),
            exchange_name: text("MQ_NOTIFIER_EXCHANGE"),
            virtual_host: text("MQ_NOTIFIER_VHOST"),
            routing_key: lookup("MQ_NOTIFIER_ROUTING_KEY"),
            persistent_delivery: flag("MQ_NOTIFIER_PERSISTENT", true),
            app_id: text("MQ_NOTIFIER_APP_ID"),
            enable_verbose_logging: flag("MQ_NOTIFIER_VERBOSE", false),
        };
        config.set_server_uri(lookup("MQ_NOTIFIER_URI").as_deref());
        config
    }

    /// Set the server URI, trimming whitespace and trailing slashes.
    pub fn set_server_uri(&mut self, uri: Option<&str>) {
        self.server_uri = uri
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
    }

    /// Connection snapshot for the broker client.
    pub fn connection_parameters(&self) -> BrokerResult<ConnectionParameters> {
        let uri = self
            .server_uri
            .clone()
            .ok_or_else(|| BrokerError::InvalidConfiguration("server URI is not set".to_string()))?;

        Ok(ConnectionParameters::new(uri)
            .with_credentials(self.user_name.clone(), self.user_password.clone())
            .with_virtual_host(self.virtual_host.clone()))
    }

    /// Properties for a message published now.
    pub fn message_properties(&self) -> MessageProperties {
        MessageProperties::json(
            DeliveryMode::from_persistent(self.persistent_delivery),
            self.app_id.clone(),
        )
    }

    /// Routing key, empty when unset.
    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or("")
    }
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Spread each delay over `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self
            .initial_delay
            .saturating_mul(factor)
            .min(self.max_delay);

        if !self.jitter || base.is_zero() {
            return base;
        }

        let half = base / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }
}

/// Settings for establishing a single connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSettings {
    /// Heartbeat interval negotiated with the broker.
    pub heartbeat: Duration,
    /// Upper bound for opening a connection.
    pub connection_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            heartbeat: HEARTBEAT_INTERVAL,
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Tunables of the broker client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientSettings {
    pub link: LinkSettings,
    /// Backoff between reconnect attempts. Retries never stop.
    pub retry: RetryPolicy,
    /// A handed-off message without a confirm after this long is resent.
    pub confirm_timeout: Duration,
    /// How often the dispatcher wakes up on its own to resend pending messages.
    pub recovery_interval: Duration,
    /// Keep nacked messages and resend them instead of dropping them.
    pub resend_on_nack: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            link: LinkSettings::default(),
            retry: RetryPolicy::default(),
            confirm_timeout: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(1),
            resend_on_nack: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = NotifierConfig::default();
        assert!(!config.enable_notifier);
        assert!(config.persistent_delivery);
        assert!(!config.enable_verbose_logging);
        assert!(config.server_uri.is_none());
        assert_eq!(config.routing_key(), "");
    }

    #[test]
    fn test_config_from_lookup() {
        let config = NotifierConfig::from_lookup(lookup_from(&[
            ("MQ_NOTIFIER_ENABLED", "true"),
            ("MQ_NOTIFIER_URI", " amqp://broker.local:5672/ "),
            ("MQ_NOTIFIER_USER", "guest"),
            ("MQ_NOTIFIER_PASSWORD", "guest"),
            ("MQ_NOTIFIER_EXCHANGE", "jenkins"),
            ("MQ_NOTIFIER_PERSISTENT", "no"),
            ("MQ_NOTIFIER_APP_ID", "ci-master"),
        ]));

        assert!(config.enable_notifier);
        assert_eq!(config.server_uri.as_deref(), Some("amqp://broker.local:5672"));
        assert_eq!(config.user_name.as_deref(), Some("guest"));
        assert_eq!(config.exchange_name.as_deref(), Some("jenkins"));
        assert!(!config.persistent_delivery);
        assert_eq!(config.app_id.as_deref(), Some("ci-master"));
        assert!(config.virtual_host.is_none());
    }

    #[test]
    fn test_set_server_uri_strips_slashes() {
        let mut config = NotifierConfig::default();
        config.set_server_uri(Some("amqps://host/vhost//"));
        assert_eq!(config.server_uri.as_deref(), Some("amqps://host/vhost"));

        config.set_server_uri(Some("   "));
        assert!(config.server_uri.is_none());
    }

    #[test]
    fn test_connection_parameters_require_uri() {
        let config = NotifierConfig::default();
        assert!(matches!(
            config.connection_parameters(),
            Err(BrokerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_connection_parameters_ignore_empty_credentials() {
        let config = NotifierConfig {
            server_uri: Some("amqp://localhost".into()),
            user_name: Some(String::new()),
            user_password: Some(Secret::new("")),
            virtual_host: Some("/builds".into()),
            ..Default::default()
        };
        let params = config.connection_parameters().unwrap();
        assert!(params.username.is_none());
        assert!(params.password.is_none());
        assert_eq!(params.virtual_host.as_deref(), Some("/builds"));
    }

    #[test]
    fn test_message_properties_follow_config() {
        let config = NotifierConfig {
            persistent_delivery: false,
            app_id: Some("ci".into()),
            ..Default::default()
        };
        let props = config.message_properties();
        assert_eq!(props.delivery_mode, DeliveryMode::Transient);
        assert_eq!(props.app_id.as_deref(), Some("ci"));
    }

    #[test]
    fn test_validate_uri() {
        assert!(validate_uri("amqp://localhost:5672").is_ok());
        assert!(validate_uri("amqps://user:pw@broker.example.com/vhost").is_ok());
        assert!(matches!(
            validate_uri("http://localhost"),
            Err(BrokerError::InvalidUri(_))
        ));
        assert!(matches!(validate_uri("not a uri"), Err(BrokerError::InvalidUri(_))));
        assert!(matches!(validate_uri("amqp://"), Err(BrokerError::InvalidUri(_))));
    }

    #[test]
    fn test_is_tls() {
        assert!(ConnectionParameters::new("amqps://host").is_tls());
        assert!(!ConnectionParameters::new("amqp://host").is_tls());
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(****)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60000),
            jitter: false,
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(32000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(60000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(60000));
    }

    #[test]
    fn test_retry_policy_jitter_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };

        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_client_settings_default() {
        let settings = ClientSettings::default();
        assert_eq!(settings.link.heartbeat, Duration::from_secs(30));
        assert!(settings.resend_on_nack);
        assert!(settings.confirm_timeout > settings.recovery_interval);
    }
}
