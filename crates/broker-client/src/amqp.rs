//! AMQP 0-9-1 transport backed by `lapin`.

use crate::config::{ConnectionParameters, LinkSettings};
use crate::error::{BrokerError, BrokerResult};
use crate::message::OutboundMessage;
use crate::transport::{
    BrokerChannel, BrokerConnection, Confirm, Connector, PendingConfirm, ShutdownNotifier,
};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

const REPLY_SUCCESS: u16 = 200;

/// Connects to a real broker over TCP or TLS.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }

    /// Build the `lapin` URI, applying credentials, virtual host and link settings.
    pub fn build_uri(params: &ConnectionParameters, settings: &LinkSettings) -> BrokerResult<AMQPUri> {
        params.validate()?;

        let mut uri: AMQPUri = params
            .uri
            .trim()
            .parse()
            .map_err(|e: String| BrokerError::InvalidUri(format!("{}: {e}", params.uri)))?;

        uri.scheme = if params.is_tls() {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        };
        if let Some(username) = &params.username {
            uri.authority.userinfo.username = username.clone();
        }
        if let Some(password) = &params.password {
            uri.authority.userinfo.password = password.expose().to_string();
        }
        if let Some(vhost) = &params.virtual_host {
            uri.vhost = vhost.clone();
        }

        uri.query.heartbeat = Some(settings.heartbeat.as_secs().min(u16::MAX as u64) as u16);
        uri.query.connection_timeout = Some(settings.connection_timeout.as_millis() as u64);
        Ok(uri)
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        params: &ConnectionParameters,
        settings: &LinkSettings,
        notifier: ShutdownNotifier,
    ) -> BrokerResult<Box<dyn BrokerConnection>> {
        let uri = Self::build_uri(params, settings)?;
        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(classify)?;

        let lost = notifier.clone();
        connection.on_error(move |err| {
            lost.connection_lost(err.to_string());
        });

        info!(
            heartbeat_secs = settings.heartbeat.as_secs(),
            epoch = notifier.epoch(),
            "AMQP connection established"
        );
        Ok(Box::new(AmqpConnection {
            connection,
            notifier,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    notifier: ShutdownNotifier,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn open_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.map_err(classify)?;
        debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.notifier.closed_by_application();
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(classify)
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn enable_confirms(&self) -> BrokerResult<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(classify)
    }

    async fn verify_exchange(&self, exchange: &str) -> BrokerResult<()> {
        // Passive declare: the kind is ignored and nothing is created.
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|err| match &err {
                lapin::Error::ProtocolError(amqp)
                    if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
                {
                    BrokerError::ExchangeNotFound(exchange.to_string())
                }
                _ => classify(err),
            })
    }

    async fn publish(&self, message: &OutboundMessage) -> BrokerResult<PendingConfirm> {
        let props = &message.properties;
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(props.content_type.clone()))
            .with_delivery_mode(props.delivery_mode.as_u8())
            .with_timestamp(props.timestamp);
        if let Some(app_id) = &props.app_id {
            properties = properties.with_app_id(ShortString::from(app_id.clone()));
        }

        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(classify)?;

        Ok(Box::pin(async move {
            match confirm.await.map_err(classify)? {
                Confirmation::Nack(_) => Ok(Confirm::Nack),
                _ => Ok(Confirm::Ack),
            }
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(classify)
    }
}

/// Map a `lapin` error onto the client's error taxonomy.
fn classify(err: lapin::Error) -> BrokerError {
    let mapped = match &err {
        lapin::Error::InvalidChannelState(_) => Some(BrokerError::ChannelClosed),
        lapin::Error::InvalidConnectionState(_) => Some(BrokerError::ConnectionClosed),
        lapin::Error::IOError(io) => Some(BrokerError::Connection(io.to_string())),
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
                Some(BrokerError::AuthenticationFailure(amqp.to_string()))
            }
            AMQPErrorKind::Soft(_) => Some(BrokerError::ChannelClosed),
            AMQPErrorKind::Hard(_) => Some(BrokerError::ConnectionClosed),
        },
        _ => None,
    };
    mapped.unwrap_or(BrokerError::Amqp(err))
}
