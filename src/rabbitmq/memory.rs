//! In-process transport over tokio channels. Backs the test suite (no live
//! broker needed) and doubles as an embedded transport: connect failures can
//! be scripted, connections and channels killed, and every broker-side
//! effect is recorded in a chronological event log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::watch;

use crate::config::{BrokerConfig, QueueName};
use crate::message::OutboundMessage;
use crate::rabbitmq::errors::BrokerError;
use crate::rabbitmq::transport::{
    Delivery, DeliveryAck, Transport, TransportChannel, TransportConnection,
};

/// Chronological record of broker-side effects, shared so tests can assert
/// ordering across components (e.g. handler call before ack).
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count_of(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }

    /// Index of the first occurrence, if any.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// A publish recorded by the in-memory broker.
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub queue: QueueName,
    pub payload: Vec<u8>,
    pub persistent: bool,
}

#[derive(Default)]
struct BrokerState {
    declare_counts: HashMap<String, u32>,
    published: Vec<PublishedMessage>,
    inbound: HashMap<String, UnboundedSender<Vec<u8>>>,
}

struct MemoryCore {
    log: EventLog,
    state: Mutex<BrokerState>,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    channels_opened: AtomicU32,
    current_connection: Mutex<Option<Arc<ConnState>>>,
    last_channel: Mutex<Option<Arc<ChanState>>>,
}

struct ConnState {
    open: AtomicBool,
    observers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

struct ChanState {
    open: AtomicBool,
    // watch, not Notify: a close racing the consumer's select must not be lost
    closed_tx: watch::Sender<bool>,
}

impl ChanState {
    fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        ChanState {
            open: AtomicBool::new(true),
            closed_tx,
        }
    }

    fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
    }
}

/// In-memory [`Transport`] implementation. Cheap to clone; clones share the
/// same broker state.
#[derive(Clone)]
pub struct MemoryTransport {
    core: Arc<MemoryCore>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport {
            core: Arc::new(MemoryCore {
                log: EventLog::default(),
                state: Mutex::new(BrokerState::default()),
                connect_failures: AtomicU32::new(0),
                connect_attempts: AtomicU32::new(0),
                channels_opened: AtomicU32::new(0),
                current_connection: Mutex::new(None),
                last_channel: Mutex::new(None),
            }),
        }
    }

    pub fn log(&self) -> EventLog {
        self.core.log.clone()
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.core.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.core.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> u32 {
        self.core.channels_opened.load(Ordering::SeqCst)
    }

    pub fn declare_count(&self, queue: &QueueName) -> u32 {
        self.core
            .state
            .lock()
            .unwrap()
            .declare_counts
            .get(queue.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.core.state.lock().unwrap().published.clone()
    }

    /// Deliver a message to the queue's active consumer, if any.
    pub fn push_inbound(&self, queue: &QueueName, payload: Vec<u8>) -> bool {
        let state = self.core.state.lock().unwrap();
        match state.inbound.get(queue.as_str()) {
            Some(sender) => sender.send(payload).is_ok(),
            None => false,
        }
    }

    /// Simulate a broker-side channel closure: the channel turns unusable
    /// and any consumer stream on it ends.
    pub fn kill_channel(&self) {
        if let Some(channel) = self.core.last_channel.lock().unwrap().as_ref() {
            channel.kill();
        }
    }

    /// Simulate losing the connection: kills the channel too and fires the
    /// registered close observers.
    pub fn kill_connection(&self) {
        self.kill_channel();
        let connection = self.core.current_connection.lock().unwrap().take();
        if let Some(connection) = connection {
            connection.open.store(false, Ordering::SeqCst);
            for observer in connection.observers.lock().unwrap().iter() {
                observer();
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        _config: &BrokerConfig,
    ) -> Result<Box<dyn TransportConnection>, BrokerError> {
        self.core.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.core.connect_failures.load(Ordering::SeqCst) > 0 {
            self.core.connect_failures.fetch_sub(1, Ordering::SeqCst);
            self.core.log.record("connect-refused");
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        let state = Arc::new(ConnState {
            open: AtomicBool::new(true),
            observers: Mutex::new(Vec::new()),
        });
        *self.core.current_connection.lock().unwrap() = Some(state.clone());
        self.core.log.record("connect");

        Ok(Box::new(MemoryConnection {
            core: self.core.clone(),
            state,
        }))
    }
}

struct MemoryConnection {
    core: Arc<MemoryCore>,
    state: Arc<ConnState>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn on_close(&self, observer: Box<dyn Fn() + Send + Sync>) {
        self.state.observers.lock().unwrap().push(observer);
    }

    async fn create_channel(&self) -> Result<Box<dyn TransportChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Channel("connection is closed".to_string()));
        }

        let state = Arc::new(ChanState::new());
        *self.core.last_channel.lock().unwrap() = Some(state.clone());
        self.core.channels_opened.fetch_add(1, Ordering::SeqCst);
        self.core.log.record("channel-open");

        Ok(Box::new(MemoryChannel {
            core: self.core.clone(),
            state,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    core: Arc<MemoryCore>,
    state: Arc<ChanState>,
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &QueueName) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Topology {
                queue: queue.clone(),
                reason: "channel is closed".to_string(),
            });
        }

        let mut state = self.core.state.lock().unwrap();
        *state
            .declare_counts
            .entry(queue.as_str().to_string())
            .or_insert(0) += 1;
        self.core.log.record(format!("declare:{queue}"));
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Publish {
                queue: message.target_queue.clone(),
                reason: "channel is closed".to_string(),
            });
        }

        let mut state = self.core.state.lock().unwrap();
        state.published.push(PublishedMessage {
            queue: message.target_queue.clone(),
            payload: message.payload.clone(),
            persistent: message.persistent,
        });
        self.core.log.record(format!("publish:{}", message.target_queue));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &QueueName,
        _consumer_tag: &str,
    ) -> Result<BoxStream<'static, Delivery>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Consume("channel is closed".to_string()));
        }

        // A fresh consumer replaces the queue's sender; a re-subscription
        // after channel loss gets a clean pipe.
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        self.core
            .state
            .lock()
            .unwrap()
            .inbound
            .insert(queue.as_str().to_string(), sender);
        self.core.log.record(format!("consume:{queue}"));

        let channel_state = self.state.clone();
        let closed_rx = self.state.closed_tx.subscribe();
        let log = self.core.log.clone();
        let stream = futures::stream::unfold(
            (receiver, channel_state, closed_rx, log),
            |(mut receiver, channel_state, mut closed_rx, log)| async move {
                if !channel_state.open.load(Ordering::SeqCst) {
                    return None;
                }
                tokio::select! {
                    payload = receiver.recv() => payload.map(|payload| {
                        let delivery = Delivery {
                            payload,
                            acker: Box::new(MemoryAcker { log: log.clone() }),
                        };
                        (delivery, (receiver, channel_state, closed_rx, log))
                    }),
                    _ = closed_rx.changed() => None,
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.kill();
        Ok(())
    }
}

struct MemoryAcker {
    log: EventLog,
}

#[async_trait]
impl DeliveryAck for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.log.record("ack");
        Ok(())
    }
}
