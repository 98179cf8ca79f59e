use thiserror::Error;

use crate::config::{CurrencyCode, QueueName};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to RabbitMQ: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("failed to declare queue '{queue}': {reason}")]
    Topology { queue: QueueName, reason: String },

    #[error("failed to publish to '{queue}': {reason}")]
    Publish { queue: QueueName, reason: String },

    #[error("consume error: {0}")]
    Consume(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to decode inbound message: {0}")]
    Decode(String),

    #[error("no outbound queue configured for currency '{0}'")]
    UnknownCurrency(CurrencyCode),

    #[error("inbound handler failed: {0}")]
    Handler(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

// Custom Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
