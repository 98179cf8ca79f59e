use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::QueueName;

/// Method name of the outbound address request.
pub const GET_NEW_ADDRESS: &str = "GetNewAddress";

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

/// JSON-RPC style wire envelope carried on every queue.
///
/// Inbound producers do not always send the `jsonrpc` field, so it defaults
/// on decode; a missing `method` is a decode failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcEnvelope {
    /// Build an outbound request envelope.
    pub fn request(method: &str, params: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(RpcEnvelope {
            jsonrpc: default_jsonrpc(),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })
    }

    /// Recognized routing for this envelope's method.
    pub fn inbound_method(&self) -> InboundMethod {
        InboundMethod::parse(&self.method)
    }
}

/// Params of the outbound `GetNewAddress` request. Invoice ids travel as
/// strings on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetNewAddressParams {
    pub invoice_id: String,
    pub user_xpub: String,
}

/// Inbound notification methods this client routes. Matching is
/// case-insensitive; anything else is tolerated and ignored so newer
/// producers do not break older consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundMethod {
    SetAddress,
    TransactionSeen,
    TransactionConfirmed,
    Unrecognized,
}

impl InboundMethod {
    pub fn parse(method: &str) -> Self {
        match method.to_ascii_lowercase().as_str() {
            "setaddress" => InboundMethod::SetAddress,
            "transactionseen" => InboundMethod::TransactionSeen,
            "transactionconfirmed" => InboundMethod::TransactionConfirmed,
            _ => InboundMethod::Unrecognized,
        }
    }
}

/// A single outbound publish attempt. Built per call and not retained
/// after the send.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub target_queue: QueueName,
    pub persistent: bool,
}

impl OutboundMessage {
    /// An outbound message the broker must write to disk before
    /// acknowledging storage.
    pub fn persistent(payload: Vec<u8>, target_queue: QueueName) -> Self {
        OutboundMessage {
            payload,
            target_queue,
            persistent: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_new_address_wire_shape() {
        let envelope = RpcEnvelope::request(
            GET_NEW_ADDRESS,
            GetNewAddressParams {
                invoice_id: "42".to_string(),
                user_xpub: "xpub6B...".to_string(),
            },
        )
        .unwrap();

        let wire: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["method"], "GetNewAddress");
        assert_eq!(wire["params"]["invoice_id"], "42");
        assert_eq!(wire["params"]["user_xpub"], "xpub6B...");
    }

    #[test]
    fn decode_tolerates_missing_jsonrpc() {
        let envelope: RpcEnvelope =
            serde_json::from_str(r#"{"method": "SetAddress", "params": {"address": "1abc"}}"#)
                .unwrap();
        assert_eq!(envelope.jsonrpc, "2.0");
        assert_eq!(envelope.inbound_method(), InboundMethod::SetAddress);
        assert_eq!(envelope.params["address"], "1abc");
    }

    #[test]
    fn decode_requires_method() {
        let result: Result<RpcEnvelope, _> = serde_json::from_str(r#"{"params": {}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn method_match_is_case_insensitive() {
        for spelling in ["setaddress", "SetAddress", "SETADDRESS"] {
            assert_eq!(InboundMethod::parse(spelling), InboundMethod::SetAddress);
        }
        assert_eq!(
            InboundMethod::parse("TransactionSeen"),
            InboundMethod::TransactionSeen
        );
        assert_eq!(
            InboundMethod::parse("transactionconfirmed"),
            InboundMethod::TransactionConfirmed
        );
        assert_eq!(
            InboundMethod::parse("unknownthing"),
            InboundMethod::Unrecognized
        );
    }

    #[test]
    fn persistent_constructor_marks_message() {
        let message = OutboundMessage::persistent(b"{}".to_vec(), QueueName::new("btc_out"));
        assert!(message.persistent);
        assert_eq!(message.target_queue, QueueName::new("btc_out"));
    }
}
