use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::rabbitmq::connection::ConnectionManager;
use crate::rabbitmq::errors::BrokerError;
use crate::rabbitmq::transport::TransportChannel;
use crate::report::ErrorSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelPhase {
    Closed,
    Open,
}

struct ChannelState {
    channel: Option<Arc<dyn TransportChannel>>,
    /// Connection generation the channel was created on.
    generation: u64,
}

/// Owns the single logical channel, rebuilding it lazily whenever the
/// broker closed it or the underlying connection was replaced. Every
/// rebuild re-declares the full queue topology before the channel is
/// handed out, so a fresh channel is always usable for publish and
/// consume alike.
pub struct ChannelManager {
    connection: Arc<ConnectionManager>,
    config: Arc<BrokerConfig>,
    sink: Arc<dyn ErrorSink>,
    state: Mutex<ChannelState>,
    phase: AtomicU8,
}

impl ChannelManager {
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: Arc<BrokerConfig>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        ChannelManager {
            connection,
            config,
            sink,
            state: Mutex::new(ChannelState {
                channel: None,
                generation: 0,
            }),
            phase: AtomicU8::new(ChannelPhase::Closed as u8),
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        if self.phase.load(Ordering::SeqCst) == ChannelPhase::Open as u8 {
            ChannelPhase::Open
        } else {
            ChannelPhase::Closed
        }
    }

    /// Return a usable channel bound to the current connection, creating
    /// one and declaring all configured queues if needed. Blocks while the
    /// connection is being repaired. On a declaration or channel-creation
    /// failure the error is reported, the channel is left unset, and the
    /// next call retries.
    pub async fn ensure_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        let (connection, generation) = self.connection.ensure_connected().await;

        let mut state = self.state.lock().await;
        if let Some(channel) = &state.channel {
            if state.generation == generation && channel.is_open() {
                return Ok(channel.clone());
            }
        }

        self.phase
            .store(ChannelPhase::Closed as u8, Ordering::SeqCst);
        state.channel = None;

        let channel: Arc<dyn TransportChannel> = match connection.create_channel().await {
            Ok(channel) => Arc::from(channel),
            Err(err) => {
                self.sink.report(&err);
                return Err(err);
            }
        };

        // Declarations are idempotent; a mismatch against an existing queue
        // is a topology error and leaves the channel unusable.
        for queue in self.config.declared_queues() {
            if let Err(err) = channel.declare_queue(queue).await {
                self.sink.report(&err);
                return Err(err);
            }
            debug!(queue = %queue, "queue ready");
        }

        state.channel = Some(channel.clone());
        state.generation = generation;
        self.phase.store(ChannelPhase::Open as u8, Ordering::SeqCst);
        Ok(channel)
    }

    /// Graceful teardown. Close failures are reported, never surfaced.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(channel) = state.channel.take() {
            if let Err(err) = channel.close().await {
                self.sink.report(&err);
            }
        }
        self.phase
            .store(ChannelPhase::Closed as u8, Ordering::SeqCst);
    }
}
