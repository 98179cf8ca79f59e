use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use invoice_messenger::rabbitmq::AmqpTransport;
use invoice_messenger::{BrokerClient, BrokerConfig, InboundHandlers, TracingErrorSink};

/// Placeholder handlers: the real service wires these to invoice storage
/// and mail. Here they only log what arrived.
struct LoggingHandlers;

#[async_trait]
impl InboundHandlers for LoggingHandlers {
    async fn on_set_address(&self, params: Value) -> anyhow::Result<()> {
        info!(params = %params, "address assigned");
        Ok(())
    }

    async fn on_transaction_seen(&self, params: Value) -> anyhow::Result<()> {
        info!(params = %params, "transaction seen");
        Ok(())
    }

    async fn on_transaction_confirmed(&self, params: Value) -> anyhow::Result<()> {
        info!(params = %params, "transaction confirmed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup tracing for logging
    tracing_subscriber::fmt::init();

    // Unrecoverable configuration failures are the only startup errors.
    let config = BrokerConfig::from_env()?;

    let client = BrokerClient::init(
        config,
        Arc::new(AmqpTransport::new()),
        Arc::new(TracingErrorSink),
    );

    // Establish connection and topology up front; if the broker is still
    // coming up this blocks through the retry backoff until it is there.
    client.ensure_ready().await?;

    let dispatcher = client.dispatcher(Arc::new(LoggingHandlers));
    tokio::spawn(dispatcher.run());

    info!("messenger running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    client.close().await;
    Ok(())
}
