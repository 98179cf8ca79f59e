use tracing::error;

use crate::rabbitmq::errors::BrokerError;

/// Best-effort error reporting endpoint. Broker-layer failures are forwarded
/// here and never propagate to invoice-facing callers.
///
/// Injected into every component so tests can capture what was reported.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &BrokerError);
}

/// Forwards every reported failure to the tracing pipeline.
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &BrokerError) {
        error!(error = %error, "broker failure");
    }
}
