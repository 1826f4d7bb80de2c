//! Synchronous connection probe for validating configuration.

use crate::config::{ConnectionParameters, LinkSettings};
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{Connector, ShutdownNotifier};
use tracing::{info, warn};

/// Open and close one connection with `params`.
///
/// Unlike publishing, every failure is reported to the caller. A failure to
/// close the probe connection is only logged.
pub async fn test_connection(
    connector: &dyn Connector,
    params: &ConnectionParameters,
    settings: &LinkSettings,
) -> BrokerResult<()> {
    params.validate()?;

    let connection = tokio::time::timeout(
        settings.connection_timeout,
        connector.connect(params, settings, ShutdownNotifier::detached()),
    )
    .await
    .map_err(|_| BrokerError::Timeout(settings.connection_timeout))??;

    info!(tls = params.is_tls(), "Broker connection test succeeded");

    if let Err(e) = connection.close().await {
        warn!(error = %e, "Failed to close test connection");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::harness::MockBroker;

    #[tokio::test]
    async fn test_probe_success_closes_connection() {
        let broker = MockBroker::new();
        test_connection(&broker, &broker.parameters(), &LinkSettings::default())
            .await
            .unwrap();
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test]
    async fn test_probe_reports_invalid_uri() {
        let broker = MockBroker::new();
        let params = ConnectionParameters::new("ftp://mock-broker");
        let err = test_connection(&broker, &params, &LinkSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidUri(_)));
        assert_eq!(broker.connects(), 0);
    }

    #[tokio::test]
    async fn test_probe_reports_authentication_failure() {
        let broker = MockBroker::new();
        broker.refuse_credentials(true);
        let err = test_connection(&broker, &broker.parameters(), &LinkSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AuthenticationFailure(_)));
    }

    #[tokio::test]
    async fn test_probe_reports_unreachable_broker() {
        let broker = MockBroker::new();
        broker.cut();
        let err = test_connection(&broker, &broker.parameters(), &LinkSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
    }
}
