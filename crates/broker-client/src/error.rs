//! Error types for the broker client.

use std::time::Duration;
use thiserror::Error;

/// Broker client error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The server URI could not be parsed or uses an unsupported scheme
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Configuration is incomplete or inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The notifier is disabled by configuration
    #[error("Notifier is disabled")]
    Disabled,

    /// No exchange was provided for the message
    #[error("Invalid configuration, exchange must not be empty")]
    MissingExchange,

    /// The broker has no exchange with this name
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// `initialize` has not been called yet
    #[error("Broker client has not been initialized")]
    NotInitialized,

    /// The broker could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker refused the supplied credentials
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The connection is closed
    #[error("Connection is already closed")]
    ConnectionClosed,

    /// The channel is closed while the connection may still be alive
    #[error("Channel is already closed")]
    ChannelClosed,

    /// Operation did not finish within its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The background dispatcher is no longer running
    #[error("Broker client has been shut down")]
    ClientStopped,

    /// AMQP protocol error not covered by the variants above
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// URI parsing error
    #[error("URI parse error: {0}")]
    UriParse(#[from] url::ParseError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Whether retrying under the same configuration can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BrokerError::InvalidUri(_)
                | BrokerError::UriParse(_)
                | BrokerError::InvalidConfiguration(_)
                | BrokerError::MissingExchange
                | BrokerError::ExchangeNotFound(_)
                | BrokerError::Disabled
        )
    }

    /// Whether the error means the whole connection is gone, not just the channel.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::ConnectionClosed
                | BrokerError::Timeout(_)
                | BrokerError::Io(_)
                | BrokerError::Amqp(_)
        )
    }
}

/// Result type alias using BrokerError.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_errors() {
        assert!(BrokerError::InvalidUri("ftp://x".into()).is_permanent());
        assert!(BrokerError::MissingExchange.is_permanent());
        assert!(BrokerError::Disabled.is_permanent());
        assert!(BrokerError::ExchangeNotFound("builds".into()).is_permanent());
        assert!(!BrokerError::ExchangeNotFound("builds".into()).is_connection_level());
        assert!(!BrokerError::Connection("refused".into()).is_permanent());
        assert!(!BrokerError::ChannelClosed.is_permanent());
        assert!(!BrokerError::AuthenticationFailure("guest".into()).is_permanent());
    }

    #[test]
    fn test_connection_level_errors() {
        assert!(BrokerError::ConnectionClosed.is_connection_level());
        assert!(BrokerError::Timeout(Duration::from_secs(1)).is_connection_level());
        assert!(!BrokerError::ChannelClosed.is_connection_level());
    }

    #[test]
    fn test_error_display() {
        let err = BrokerError::MissingExchange;
        assert_eq!(
            err.to_string(),
            "Invalid configuration, exchange must not be empty"
        );
        let err = BrokerError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Operation timed out after 250ms");
    }
}
