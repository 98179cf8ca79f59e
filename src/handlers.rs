use async_trait::async_trait;
use serde_json::Value;

/// External handlers for inbound notifications. What they do with the
/// params (database writes, email) is outside the messenger; a failure is
/// reported and the delivery is still acknowledged.
#[async_trait]
pub trait InboundHandlers: Send + Sync {
    /// A receiving address was assigned for an invoice.
    async fn on_set_address(&self, params: Value) -> anyhow::Result<()>;

    /// A transaction was observed, still unconfirmed.
    async fn on_transaction_seen(&self, params: Value) -> anyhow::Result<()>;

    /// A transaction reached its confirmation threshold.
    async fn on_transaction_confirmed(&self, params: Value) -> anyhow::Result<()>;
}
