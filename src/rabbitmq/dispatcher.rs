use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_lite::StreamExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::handlers::InboundHandlers;
use crate::message::{InboundMethod, RpcEnvelope};
use crate::rabbitmq::channel::ChannelManager;
use crate::rabbitmq::errors::BrokerError;
use crate::rabbitmq::transport::{Delivery, DeliveryAck};
use crate::report::ErrorSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    NotSubscribed,
    Subscribing,
    Subscribed,
}

fn subscription_from_u8(value: u8) -> SubscriptionState {
    match value {
        1 => SubscriptionState::Subscribing,
        2 => SubscriptionState::Subscribed,
        _ => SubscriptionState::NotSubscribed,
    }
}

/// Consumes the inbound queue and routes each notification to its external
/// handler, acknowledging only after the handler call returns.
pub struct InboundDispatcher {
    config: Arc<BrokerConfig>,
    channel: Arc<ChannelManager>,
    handlers: Arc<dyn InboundHandlers>,
    sink: Arc<dyn ErrorSink>,
    state: AtomicU8,
}

impl InboundDispatcher {
    pub fn new(
        config: Arc<BrokerConfig>,
        channel: Arc<ChannelManager>,
        handlers: Arc<dyn InboundHandlers>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        InboundDispatcher {
            config,
            channel,
            handlers,
            sink,
            state: AtomicU8::new(SubscriptionState::NotSubscribed as u8),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        subscription_from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// One subscribe-and-drain cycle: ensure a usable channel (which
    /// re-declares the topology), begin consuming with manual acks, and
    /// process deliveries until the channel is lost and the stream ends.
    pub async fn start(&self) -> Result<(), BrokerError> {
        self.set_state(SubscriptionState::Subscribing);

        let channel = match self.channel.ensure_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                self.set_state(SubscriptionState::NotSubscribed);
                return Err(err);
            }
        };

        let consumer_tag = format!("dispatcher-{}", Uuid::new_v4());
        let mut deliveries = match channel
            .consume(&self.config.inbound_queue, &consumer_tag)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.set_state(SubscriptionState::NotSubscribed);
                self.sink.report(&err);
                return Err(err);
            }
        };

        self.set_state(SubscriptionState::Subscribed);
        info!(
            queue = %self.config.inbound_queue,
            consumer_tag = %consumer_tag,
            "consuming inbound notifications"
        );

        while let Some(delivery) = deliveries.next().await {
            self.dispatch(delivery).await;
        }

        self.set_state(SubscriptionState::NotSubscribed);
        warn!(queue = %self.config.inbound_queue, "inbound consumer stream ended");
        Ok(())
    }

    /// Consume forever, re-subscribing after channel loss. A fresh channel
    /// always re-declares the topology before consumption resumes.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.start().await.is_err() {
                sleep(self.config.retry_delay).await;
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery) {
        let envelope: RpcEnvelope = match serde_json::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Poison messages must not block the queue: report, ack, drop.
                self.sink.report(&BrokerError::Decode(err.to_string()));
                self.ack(delivery.acker).await;
                return;
            }
        };

        let outcome = match envelope.inbound_method() {
            InboundMethod::SetAddress => Some(self.handlers.on_set_address(envelope.params).await),
            InboundMethod::TransactionSeen => {
                Some(self.handlers.on_transaction_seen(envelope.params).await)
            }
            InboundMethod::TransactionConfirmed => {
                Some(self.handlers.on_transaction_confirmed(envelope.params).await)
            }
            InboundMethod::Unrecognized => {
                debug!(method = %envelope.method, "ignoring unrecognized method");
                None
            }
        };

        if let Some(Err(err)) = outcome {
            // Redelivery of a failed handler call is not assumed to help;
            // the delivery is acknowledged regardless.
            self.sink.report(&BrokerError::Handler(err));
        }

        self.ack(delivery.acker).await;
    }

    async fn ack(&self, acker: Box<dyn DeliveryAck>) {
        if let Err(err) = acker.ack().await {
            self.sink.report(&err);
        }
    }
}
