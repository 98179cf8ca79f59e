#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use invoice_messenger::rabbitmq::memory::EventLog;
use invoice_messenger::{BrokerConfig, BrokerError, ErrorSink, InboundHandlers};

/// Config against the in-memory broker with a short retry backoff so the
/// reconnect loop converges quickly in tests.
pub fn test_config(retry_ms: u64) -> BrokerConfig {
    let vars: Vec<(String, String)> = [
        ("RABBITMQ_HOST", "localhost"),
        ("RABBITMQ_USERNAME", "guest"),
        ("RABBITMQ_PASSWORD", "guest"),
        ("RABBITMQ_QUEUE_IN", "invoices_in"),
        ("RABBITMQ_QUEUE_OUT_BTC", "btc_out"),
        ("RABBITMQ_QUEUE_OUT_LTC", "ltc_out"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .chain([(
        "RABBITMQ_RETRY_DELAY_MS".to_string(),
        retry_ms.to_string(),
    )])
    .collect();

    BrokerConfig::from_vars(vars).expect("test config is valid")
}

/// Captures everything reported so tests can assert on failures without a
/// live reporting endpoint.
pub struct RecordingSink {
    reports: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingSink {
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.reports().iter().any(|report| report.contains(needle))
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, error: &BrokerError) {
        self.reports.lock().unwrap().push(error.to_string());
    }
}

/// Handlers that record invocations into the transport's event log, so call
/// order against broker-side effects (acks) is observable.
pub struct RecordingHandlers {
    log: EventLog,
    fail_set_address: bool,
}

impl RecordingHandlers {
    pub fn new(log: EventLog) -> Arc<Self> {
        Arc::new(RecordingHandlers {
            log,
            fail_set_address: false,
        })
    }

    pub fn failing(log: EventLog) -> Arc<Self> {
        Arc::new(RecordingHandlers {
            log,
            fail_set_address: true,
        })
    }
}

#[async_trait]
impl InboundHandlers for RecordingHandlers {
    async fn on_set_address(&self, _params: Value) -> anyhow::Result<()> {
        self.log.record("handler:set_address");
        if self.fail_set_address {
            anyhow::bail!("set address handler boom");
        }
        Ok(())
    }

    async fn on_transaction_seen(&self, _params: Value) -> anyhow::Result<()> {
        self.log.record("handler:transaction_seen");
        Ok(())
    }

    async fn on_transaction_confirmed(&self, _params: Value) -> anyhow::Result<()> {
        self.log.record("handler:transaction_confirmed");
        Ok(())
    }
}

/// A well-formed inbound envelope for `method`.
pub fn envelope_bytes(method: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": { "address": "1abc", "invoice_id": "42" },
    }))
    .expect("envelope serializes")
}

/// Poll the event log until `entry` has occurred `count` times.
pub async fn eventually(log: &EventLog, entry: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if log.count_of(entry) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {count}x '{entry}'"));
}
