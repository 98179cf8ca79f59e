use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{BrokerConfig, QueueName};
use crate::message::OutboundMessage;
use crate::rabbitmq::errors::BrokerError;
use crate::rabbitmq::transport::{
    Delivery, DeliveryAck, Transport, TransportChannel, TransportConnection,
};

/// lapin-backed AMQP transport.
#[derive(Debug, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        AmqpTransport
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        config: &BrokerConfig,
    ) -> Result<Box<dyn TransportConnection>, BrokerError> {
        info!(host = %config.host, port = config.port, "connecting to RabbitMQ");

        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!("connected to RabbitMQ");
        Ok(Box::new(AmqpConnection {
            exchange: config.exchange.clone(),
            inner: connection,
        }))
    }
}

struct AmqpConnection {
    exchange: String,
    inner: Connection,
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_close(&self, observer: Box<dyn Fn() + Send + Sync>) {
        self.inner.on_error(move |err| {
            error!(error = %err, "RabbitMQ connection lost");
            observer();
        });
    }

    async fn create_channel(&self) -> Result<Box<dyn TransportChannel>, BrokerError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        debug!("channel created");
        Ok(Box::new(AmqpChannel {
            exchange: self.exchange.clone(),
            inner: channel,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        info!("closing RabbitMQ connection");
        self.inner
            .close(200, "shutting down")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpChannel {
    exchange: String,
    inner: Channel,
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_queue(&self, queue: &QueueName) -> Result<(), BrokerError> {
        self.inner
            .queue_declare(
                queue.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology {
                queue: queue.clone(),
                reason: e.to_string(),
            })?;

        debug!(queue = %queue, "queue declared");
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type("application/json".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if message.persistent {
            // delivery mode 2: broker writes the message to disk before
            // acknowledging storage
            properties = properties.with_delivery_mode(2);
        }

        self.inner
            .basic_publish(
                &self.exchange,
                message.target_queue.as_str(),
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| BrokerError::Publish {
                queue: message.target_queue.clone(),
                reason: e.to_string(),
            })
    }

    async fn consume(
        &self,
        queue: &QueueName,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Delivery>, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue.as_str(),
                consumer_tag,
                // manual acknowledgment: no_ack stays false
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "consumer started");

        Ok(consumer
            .filter_map(|delivery| async move {
                match delivery {
                    Ok(delivery) => Some(Delivery {
                        payload: delivery.data.clone(),
                        acker: Box::new(AmqpAcker { delivery }),
                    }),
                    Err(err) => {
                        error!(error = %err, "error receiving delivery");
                        None
                    }
                }
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(200, "shutting down")
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }
}

struct AmqpAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl DeliveryAck for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
