use std::sync::Arc;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{BrokerConfig, CurrencyCode};
use crate::handlers::InboundHandlers;
use crate::message::{GetNewAddressParams, RpcEnvelope, GET_NEW_ADDRESS};
use crate::rabbitmq::channel::ChannelManager;
use crate::rabbitmq::connection::ConnectionManager;
use crate::rabbitmq::dispatcher::InboundDispatcher;
use crate::rabbitmq::errors::BrokerError;
use crate::rabbitmq::publisher::Publisher;
use crate::rabbitmq::transport::Transport;
use crate::report::ErrorSink;

/// The broker client context: owns the connection and channel managers, the
/// publisher, and the connection supervisor task. Built once at startup and
/// injected wherever messaging is needed; there is no ambient state.
pub struct BrokerClient {
    config: Arc<BrokerConfig>,
    connection: Arc<ConnectionManager>,
    channel: Arc<ChannelManager>,
    publisher: Publisher,
    sink: Arc<dyn ErrorSink>,
    repair_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Wire up the client against a transport. Must be called from within a
    /// tokio runtime: the connection supervisor task is spawned here.
    pub fn init(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ErrorSink>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let connection = Arc::new(ConnectionManager::new(
            transport,
            config.clone(),
            sink.clone(),
        ));
        let channel = Arc::new(ChannelManager::new(
            connection.clone(),
            config.clone(),
            sink.clone(),
        ));
        let publisher = Publisher::new(channel.clone(), sink.clone());
        let repair_task = connection.clone().spawn_repair_task();

        Arc::new(BrokerClient {
            config,
            connection,
            channel,
            publisher,
            sink,
            repair_task: Mutex::new(Some(repair_task)),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.channel
    }

    /// Eagerly establish the connection, channel and queue topology. Blocks
    /// through the reconnect backoff until the broker is reachable; a
    /// topology failure is reported and returned.
    pub async fn ensure_ready(&self) -> Result<(), BrokerError> {
        self.channel.ensure_channel().await.map(|_| ())
    }

    /// Build the inbound dispatcher bound to this client's channel.
    pub fn dispatcher(&self, handlers: Arc<dyn InboundHandlers>) -> Arc<InboundDispatcher> {
        Arc::new(InboundDispatcher::new(
            self.config.clone(),
            self.channel.clone(),
            handlers,
            self.sink.clone(),
        ))
    }

    /// Ask the wallet service for a fresh receiving address. The request is
    /// routed to the queue configured for `currency`; an unmapped currency
    /// is a configuration error and nothing is published.
    pub async fn request_new_address(
        &self,
        currency: &CurrencyCode,
        invoice_id: &str,
        user_xpub: &str,
    ) -> Result<(), BrokerError> {
        let queue = self.config.outbound_queue(currency)?.clone();

        let envelope = RpcEnvelope::request(
            GET_NEW_ADDRESS,
            GetNewAddressParams {
                invoice_id: invoice_id.to_string(),
                user_xpub: user_xpub.to_string(),
            },
        )?;
        let payload = serde_json::to_vec(&envelope)?;

        info!(currency = %currency, invoice_id = %invoice_id, queue = %queue, "requesting new address");
        self.publisher.send(payload, queue).await;
        Ok(())
    }

    /// Tear down: stop the supervisor task, close the channel, then the
    /// connection. Best-effort; close failures are reported to the sink.
    pub async fn close(&self) {
        if let Some(task) = self.repair_task.lock().unwrap().take() {
            task.abort();
        }
        self.channel.close().await;
        self.connection.close().await;
        info!("broker client closed");
    }
}
