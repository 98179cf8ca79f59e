use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::rabbitmq::transport::{Transport, TransportConnection};
use crate::report::ErrorSink;

/// Connection lifecycle as seen from outside the repair lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

fn phase_from_u8(value: u8) -> ConnectionPhase {
    match value {
        1 => ConnectionPhase::Connecting,
        2 => ConnectionPhase::Connected,
        _ => ConnectionPhase::Disconnected,
    }
}

struct ConnectionState {
    connection: Option<Arc<dyn TransportConnection>>,
    /// Bumped every time the connection is replaced; lets the channel owner
    /// detect that its channel is bound to a dead connection.
    generation: u64,
}

/// Owns the single broker connection, recreating it after any failure.
///
/// `ensure_connected` retries indefinitely with a fixed backoff: broker
/// unavailability is treated as transient and must not take the service
/// down. The repair runs under one lock, so under concurrent load only one
/// reconnect attempt is in flight and every caller observes the repaired
/// connection.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: Arc<BrokerConfig>,
    sink: Arc<dyn ErrorSink>,
    state: Mutex<ConnectionState>,
    phase: AtomicU8,
    repair_trigger: Arc<Notify>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<BrokerConfig>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        ConnectionManager {
            transport,
            config,
            sink,
            state: Mutex::new(ConnectionState {
                connection: None,
                generation: 0,
            }),
            phase: AtomicU8::new(ConnectionPhase::Disconnected as u8),
            repair_trigger: Arc::new(Notify::new()),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        phase_from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Return the live connection and its generation, establishing one
    /// first if needed. Does not return until a connection exists; each
    /// failed attempt is reported and followed by the fixed backoff.
    pub async fn ensure_connected(&self) -> (Arc<dyn TransportConnection>, u64) {
        let mut state = self.state.lock().await;

        if let Some(connection) = &state.connection {
            if connection.is_open() {
                return (connection.clone(), state.generation);
            }
        }

        self.phase
            .store(ConnectionPhase::Connecting as u8, Ordering::SeqCst);
        state.connection = None;

        loop {
            match self.transport.connect(&self.config).await {
                Ok(connection) => {
                    let connection: Arc<dyn TransportConnection> = Arc::from(connection);

                    // Broker-initiated shutdown only signals the supervisor
                    // task; the reconnect itself never runs on the
                    // transport's callback context.
                    let trigger = self.repair_trigger.clone();
                    connection.on_close(Box::new(move || {
                        trigger.notify_one();
                    }));

                    state.generation += 1;
                    state.connection = Some(connection.clone());
                    self.phase
                        .store(ConnectionPhase::Connected as u8, Ordering::SeqCst);
                    info!(generation = state.generation, "broker connection established");
                    return (connection, state.generation);
                }
                Err(err) => {
                    self.sink.report(&err);
                    warn!(
                        error = %err,
                        retry_in_ms = self.config.retry_delay.as_millis() as u64,
                        "connect attempt failed, retrying"
                    );
                    sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Spawn the supervisor task that re-establishes the connection whenever
    /// a close observer fires. Aborted on client teardown.
    pub(crate) fn spawn_repair_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.repair_trigger.notified().await;
                warn!("broker connection lost, reconnecting");
                self.ensure_connected().await;
            }
        })
    }

    /// Graceful teardown. Close failures are reported, never surfaced.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(connection) = state.connection.take() {
            if let Err(err) = connection.close().await {
                self.sink.report(&err);
            }
        }
        self.phase
            .store(ConnectionPhase::Disconnected as u8, Ordering::SeqCst);
    }
}
