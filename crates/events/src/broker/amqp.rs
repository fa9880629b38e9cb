//! AMQP 0-9-1 broker over [`lapin`].
//!
//! [`AmqpBroker`] maps the [`Broker`] contract onto a RabbitMQ-compatible
//! server: one TCP connection per [`BrokerConnection`], one AMQP channel
//! per [`BrokerChannel`]. Deliveries from `basic.consume` are forwarded
//! into a [`DeliveryStream`] by a small task that ends when the channel
//! does.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, ConnectionProperties};
use tokio::sync::mpsc;

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerOptions, Delivery, DeliveryMode,
    DeliveryStream, ExchangeKind, PublishProperties, QueueOptions,
};

/// Default AMQP port when the host carries none.
pub const DEFAULT_PORT: u16 = 5672;

const REPLY_SUCCESS: u16 = 200;

/// AMQP `delivery-mode` values.
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connects to a RabbitMQ-compatible broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker {
    connection_name: Option<String>,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for this client in the broker's management UI.
    pub fn with_connection_name(name: impl Into<String>) -> Self {
        Self {
            connection_name: Some(name.into()),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, options: &BrokerOptions) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let uri = amqp_uri(options).map_err(|reason| BrokerError::Unreachable {
            host: options.host.clone(),
            reason,
        })?;

        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = lapin::Connection::connect_uri(uri, properties)
            .await
            .map_err(|e| connect_error(options, e))?;

        tracing::debug!(host = %options.host, "AMQP connection opened");
        Ok(Arc::new(AmqpConnection {
            inner: Arc::new(connection),
        }))
    }
}

/// Build the connection URI from `host[:port]` and optional credentials.
///
/// Without credentials the broker defaults (`guest`) apply.
pub fn amqp_uri(options: &BrokerOptions) -> Result<AMQPUri, String> {
    let (host, port) = match options.host.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid port in {:?}", options.host))?;
            (host.to_string(), port)
        }
        None => (options.host.clone(), DEFAULT_PORT),
    };

    let mut uri = AMQPUri::default();
    uri.authority.host = host;
    uri.authority.port = port;
    if let Some(username) = &options.username {
        uri.authority.userinfo.username = username.clone();
    }
    if let Some(password) = &options.password {
        uri.authority.userinfo.password = password.clone();
    }
    Ok(uri)
}

fn connect_error(options: &BrokerOptions, error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::IOError(e) => BrokerError::Unreachable {
            host: options.host.clone(),
            reason: e.to_string(),
        },
        lapin::Error::ProtocolError(e)
            if matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)) =>
        {
            BrokerError::AccessRefused(options.username.clone())
        }
        other => broker_error(other),
    }
}

/// Translate a lapin error on an established connection.
fn broker_error(error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::IOError(e) => BrokerError::Io(std::io::Error::new(e.kind(), e.to_string())),
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
        lapin::Error::ProtocolError(e) => match e.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => BrokerError::AccessRefused(None),
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound {
                kind: "entity",
                name: e.get_message().as_str().to_string(),
            },
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed(e.get_message().as_str().to_string())
            }
            _ => BrokerError::ChannelClosed,
        },
        _ => BrokerError::ConnectionClosed,
    }
}

// ---------------------------------------------------------------------------
// Connection and channel
// ---------------------------------------------------------------------------

struct AmqpConnection {
    inner: Arc<lapin::Connection>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await.map_err(broker_error)?;
        Ok(Box::new(AmqpChannel { inner: channel }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn close(&self) {
        let connection = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = connection.close(REPLY_SUCCESS, "closing").await {
                tracing::debug!(error = %e, "AMQP connection close failed");
            }
        });
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        self.inner
            .exchange_declare(exchange, kind, ExchangeDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(broker_error)
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..Default::default()
        };
        self.inner
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(broker_error)
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)
    }

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(broker_error)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let options = BasicPublishOptions {
            mandatory: properties.mandatory,
            ..Default::default()
        };
        self.inner
            .basic_publish(exchange, routing_key, options, &body, to_amqp_properties(&properties))
            .await
            .map_err(broker_error)?
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn basic_consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let mut consumer = self
            .inner
            .basic_consume(queue, "", BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(broker_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        tracing::warn!(queue, error = %e, "AMQP consumer stream failed");
                        break;
                    }
                };
                if tx.send(from_amqp_delivery(delivery)).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(broker_error)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn close(&self) {
        if !self.is_open() {
            return;
        }
        let channel = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.close(REPLY_SUCCESS, "closing").await {
                tracing::debug!(error = %e, "AMQP channel close failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Property mapping
// ---------------------------------------------------------------------------

fn to_amqp_properties(properties: &PublishProperties) -> BasicProperties {
    let delivery_mode = match properties.delivery_mode {
        DeliveryMode::Transient => DELIVERY_MODE_TRANSIENT,
        DeliveryMode::Persistent => DELIVERY_MODE_PERSISTENT,
    };

    let mut amqp = BasicProperties::default().with_delivery_mode(delivery_mode);
    if let Some(content_type) = &properties.content_type {
        amqp = amqp.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        amqp = amqp.with_message_id(ShortString::from(message_id.clone()));
    }
    amqp
}

fn from_amqp_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let amqp = &delivery.properties;
    let delivery_mode = match amqp.delivery_mode() {
        Some(DELIVERY_MODE_PERSISTENT) => DeliveryMode::Persistent,
        _ => DeliveryMode::Transient,
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        properties: PublishProperties {
            delivery_mode,
            content_type: amqp.content_type().as_ref().map(|s| s.as_str().to_string()),
            message_id: amqp.message_id().as_ref().map(|s| s.as_str().to_string()),
            mandatory: false,
        },
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}
