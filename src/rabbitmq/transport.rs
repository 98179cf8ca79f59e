use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::{BrokerConfig, QueueName};
use crate::message::OutboundMessage;
use crate::rabbitmq::errors::BrokerError;

/// A message delivered from the inbound queue. The acknowledgment is
/// explicit: an unacked delivery may be redelivered by the broker.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub acker: Box<dyn DeliveryAck>,
}

#[async_trait]
pub trait DeliveryAck: Send {
    /// Positive, non-requeue acknowledgment of this delivery.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Factory for broker connections. The production implementation speaks
/// AMQP via lapin; an in-memory implementation backs the tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> Result<Box<dyn TransportConnection>, BrokerError>;
}

/// A transport-level session to the broker. Replaced wholesale on failure,
/// never patched in place.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Register a callback fired when the broker or network closes the
    /// connection. Observers must be cheap and non-blocking; they are
    /// invoked from the transport's own execution context.
    fn on_close(&self, observer: Box<dyn Fn() + Send + Sync>);

    async fn create_channel(&self) -> Result<Box<dyn TransportChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical session multiplexed over the connection; the unit on which
/// declares, publishes and consumes are issued.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declare a durable, non-exclusive, non-auto-delete queue. Declaring an
    /// existing queue with matching properties is a no-op.
    async fn declare_queue(&self, queue: &QueueName) -> Result<(), BrokerError>;

    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError>;

    /// Begin consuming with manual acknowledgment. The stream ends when the
    /// channel is closed.
    async fn consume(
        &self,
        queue: &QueueName,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Delivery>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
