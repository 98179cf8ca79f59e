use std::sync::Arc;

use tracing::debug;

use crate::config::QueueName;
use crate::message::OutboundMessage;
use crate::rabbitmq::channel::ChannelManager;
use crate::report::ErrorSink;

/// Sends outbound messages to named queues, repairing the connection and
/// channel first if either is unusable.
///
/// Delivery is best-effort, at most once: if the publish itself fails after
/// the repair (for instance the channel closed between the check and the
/// send), the failure is reported and the message is abandoned. The next
/// `send` repairs and carries new traffic; lost messages are not masked.
pub struct Publisher {
    channel: Arc<ChannelManager>,
    sink: Arc<dyn ErrorSink>,
}

impl Publisher {
    pub fn new(channel: Arc<ChannelManager>, sink: Arc<dyn ErrorSink>) -> Self {
        Publisher { channel, sink }
    }

    /// Publish `payload` to `queue` as a persistent message. Blocks the
    /// caller while a reconnect is in progress; never returns an error.
    pub async fn send(&self, payload: Vec<u8>, queue: QueueName) {
        let channel = match self.channel.ensure_channel().await {
            Ok(channel) => channel,
            // Already reported by the channel manager; drop the message.
            Err(_) => return,
        };

        let message = OutboundMessage::persistent(payload, queue);
        match channel.publish(&message).await {
            Ok(()) => debug!(queue = %message.target_queue, "message published"),
            Err(err) => self.sink.report(&err),
        }
    }
}
