//! Broker connections, channels and the two publishing roles

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tracing::{debug, info};

use super::registry::{ConnectionRegistry, Connector};
use super::{BrokerError, Publish};

/// AMQP delivery mode that asks the broker to write the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Opens AMQP connections against a single broker URL.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connect)?;
        info!("Connected to message broker");
        Ok(connection)
    }

    fn is_open(connection: &Connection) -> bool {
        connection.status().connected()
    }
}

pub type AmqpRegistry = ConnectionRegistry<AmqpConnector>;

/// How a [`BrokerConnection`] obtains its underlying TCP connection.
#[derive(Clone)]
pub enum ConnectionMode {
    /// A fresh connection owned by this instance alone
    Exclusive(AmqpConnector),
    /// The registry entry called `name`, shared with every other instance in
    /// this process that names the same key
    Shared {
        registry: Arc<AmqpRegistry>,
        name: String,
    },
}

impl ConnectionMode {
    pub fn shared(registry: Arc<AmqpRegistry>, name: impl Into<String>) -> Self {
        ConnectionMode::Shared {
            registry,
            name: name.into(),
        }
    }
}

/// A connection plus a channel that belongs to this instance only.
///
/// Instances sharing a connection never share a channel, so delivery tags
/// and publisher confirms stay scoped to one owner.
pub struct BrokerConnection {
    connection: Arc<Connection>,
    channel: Channel,
}

impl BrokerConnection {
    pub async fn open(mode: &ConnectionMode, confirm_delivery: bool) -> Result<Self, BrokerError> {
        let connection = match mode {
            ConnectionMode::Exclusive(connector) => Arc::new(connector.connect().await?),
            ConnectionMode::Shared { registry, name } => registry.get_or_connect(name).await?,
        };

        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::channel("channel.open"))?;

        if confirm_delivery {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(BrokerError::channel("confirm.select"))?;
        }

        debug!(channel_id = channel.id(), confirm_delivery, "Opened broker channel");

        Ok(Self { connection, channel })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Close this instance's channel. A shared connection stays open for
    /// the other instances; unacknowledged deliveries return to the queue.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(200, "closing")
            .await
            .map_err(BrokerError::channel("channel.close"))
    }

    /// Declare a durable queue that survives consumers going away.
    pub async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if queue.is_empty() {
            return Err(BrokerError::Config("queue name must not be empty".to_string()));
        }

        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::channel("queue.declare"))?;

        debug!(queue, messages = declared.message_count(), "Declared queue");
        Ok(())
    }

    /// Declare a durable fanout exchange and bind every queue to it.
    pub async fn declare_exchange_and_bind(&self, exchange: &str, queues: &[&str]) -> Result<(), BrokerError> {
        if exchange.is_empty() {
            return Err(BrokerError::Config("exchange name must not be empty".to_string()));
        }

        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::channel("exchange.declare"))?;

        for queue in queues {
            self.declare_queue(queue).await?;
            self.channel
                .queue_bind(queue, exchange, "", QueueBindOptions::default(), FieldTable::default())
                .await
                .map_err(BrokerError::channel("queue.bind"))?;
            debug!(exchange, queue, "Bound queue to exchange");
        }

        Ok(())
    }

    async fn publish_persistent(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
            )
            .await
            .map_err(BrokerError::channel("basic.publish"))?;

        // Resolves immediately when confirms were not requested
        let confirmation = confirm.await.map_err(BrokerError::channel("publisher confirm"))?;
        if confirmation.is_nack() {
            let target = if exchange.is_empty() { routing_key } else { exchange };
            return Err(BrokerError::Publish {
                target: target.to_string(),
            });
        }

        Ok(())
    }
}

/// Publish-to-exchange role: every bound queue receives a copy.
pub struct Publisher {
    connection: BrokerConnection,
    exchange: String,
}

impl Publisher {
    pub fn new(connection: BrokerConnection, exchange: impl Into<String>) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

#[async_trait]
impl Publish for Publisher {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        self.connection.publish_persistent(&self.exchange, "", payload).await
    }
}

/// Send-to-queue role through the default exchange.
pub struct QueueSender {
    connection: BrokerConnection,
    queue: String,
}

impl QueueSender {
    pub async fn new(connection: BrokerConnection, queue: impl Into<String>) -> Result<Self, BrokerError> {
        let queue = queue.into();
        connection.declare_queue(&queue).await?;
        Ok(Self { connection, queue })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl Publish for QueueSender {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        self.connection.publish_persistent("", &self.queue, payload).await
    }
}
