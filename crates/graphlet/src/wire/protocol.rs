//! Wire protocol types for bridge-worker communication.
//!
//! Every message is a JSON object discriminated by `type`. Request and
//! response types carry a `requestId` correlation id; streaming types may
//! carry one for context but it never resolves a pending request.
//!
//! The inbound set is closed: a `type` outside this enum fails
//! deserialization and surfaces as a malformed message at the codec layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed correlation id on the one-time `ready` message.
pub const READY_REQUEST_ID: &str = "init";

/// Messages from worker to bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// Emitted once when the worker finishes loading and can take requests.
    Ready { request_id: String },

    /// Streaming progress for an in-flight request.
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        fields: serde_json::Map<String, Value>,
    },

    /// Streaming generated-text chunk.
    Token {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        fields: serde_json::Map<String, Value>,
    },

    /// A node of the analysis graph finished; more follow.
    NodeComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        fields: serde_json::Map<String, Value>,
    },

    /// Terminal success for the matching request.
    GraphComplete {
        request_id: String,
        #[serde(default)]
        result: Value,
    },

    /// Terminal failure for the matching request.
    Error { request_id: String, error: String },
}

impl WorkerMessage {
    /// Correlation id, where present.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Ready { request_id } => Some(request_id),
            Self::GraphComplete { request_id, .. } => Some(request_id),
            Self::Error { request_id, .. } => Some(request_id),
            Self::Progress { request_id, .. }
            | Self::Token { request_id, .. }
            | Self::NodeComplete { request_id, .. } => request_id.as_deref(),
        }
    }

    /// Non-terminal events that fan out on the streaming channel.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::Progress { .. } | Self::Token { .. } | Self::NodeComplete { .. }
        )
    }
}

/// An outbound request envelope.
///
/// The caller supplies the operation name and payload; the bridge injects
/// the correlation id. Payload shape is opaque to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(rename = "type")]
    pub operation: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

impl WorkerRequest {
    pub fn new(operation: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            request_id: request_id.into(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_payload(
        operation: impl Into<String>,
        request_id: impl Into<String>,
        payload: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            operation: operation.into(),
            request_id: request_id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ready_round_trips_with_fixed_id() {
        let raw = r#"{"type":"ready","requestId":"init"}"#;
        let msg: WorkerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Ready {
                request_id: READY_REQUEST_ID.to_string()
            }
        );
        assert_eq!(serde_json::to_value(&msg).unwrap(), json!({"type": "ready", "requestId": "init"}));
    }

    #[test]
    fn progress_preserves_extra_fields() {
        let raw = r#"{"type":"progress","requestId":"r1","percent":50,"status":"Transcribing"}"#;
        let msg: WorkerMessage = serde_json::from_str(raw).unwrap();

        assert_eq!(msg.request_id(), Some("r1"));
        assert!(msg.is_streaming());

        // Re-emitting the event keeps every field the worker sent.
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["percent"], json!(50));
        assert_eq!(value["status"], json!("Transcribing"));
    }

    #[test]
    fn streaming_request_id_is_optional() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"token","text":"hello"}"#).unwrap();
        assert_eq!(msg.request_id(), None);
        assert!(msg.is_streaming());
    }

    #[test]
    fn graph_complete_carries_result() {
        let raw = r#"{"type":"graph-complete","requestId":"r2","result":{"beats":[1,2]}}"#;
        let msg: WorkerMessage = serde_json::from_str(raw).unwrap();
        match msg {
            WorkerMessage::GraphComplete { request_id, result } => {
                assert_eq!(request_id, "r2");
                assert_eq!(result, json!({"beats": [1, 2]}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn graph_complete_without_result_defaults_to_null() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"graph-complete","requestId":"r3"}"#).unwrap();
        match msg {
            WorkerMessage::GraphComplete { result, .. } => assert_eq!(result, Value::Null),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn error_requires_request_id() {
        let err = serde_json::from_str::<WorkerMessage>(r#"{"type":"error","error":"boom"}"#);
        assert!(err.is_err());

        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"error","requestId":"r4","error":"boom"}"#).unwrap();
        assert!(!msg.is_streaming());
        assert_eq!(msg.request_id(), Some("r4"));
    }

    #[test]
    fn node_complete_uses_kebab_case_tag() {
        let msg = WorkerMessage::NodeComplete {
            request_id: Some("r5".to_string()),
            fields: serde_json::Map::new(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!("node-complete"));
    }

    #[test]
    fn request_injects_type_and_request_id() {
        let payload = match json!({"prompt": "summarize act one"}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let req = WorkerRequest::with_payload("chat", "r6", payload);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "chat", "requestId": "r6", "prompt": "summarize act one"})
        );
    }

    #[test]
    fn stop_request_serializes_bare() {
        let req = WorkerRequest::new("stop", "r7");
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "stop", "requestId": "r7"})
        );
    }
}
