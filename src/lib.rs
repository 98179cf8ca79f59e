// Resilient RabbitMQ messenger for the invoice payment service: publishes
// address requests per currency and dispatches wallet notifications to
// external handlers, surviving broker restarts in between.

pub mod config;
pub mod handlers;
pub mod message;
pub mod rabbitmq;
pub mod report;

pub use config::{BrokerConfig, CurrencyCode, QueueName};
pub use handlers::InboundHandlers;
pub use message::{GetNewAddressParams, InboundMethod, OutboundMessage, RpcEnvelope};
pub use rabbitmq::{AmqpTransport, BrokerClient, BrokerError, InboundDispatcher, Publisher};
pub use report::{ErrorSink, TracingErrorSink};
