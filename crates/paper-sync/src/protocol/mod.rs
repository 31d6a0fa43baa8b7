use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::model::{Node, Schema};
use crate::transform::Step;

/// Where a reconnecting client left off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeFrom {
    pub client_id: String,
    pub version: u64,
}

/// Messages sent from client to relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Attach to a document, optionally resuming an earlier session
    Join {
        document_id: String,
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<ResumeFrom>,
    },
    /// Submit steps built on top of `base_version`
    SubmitSteps {
        document_id: String,
        base_version: u64,
        steps: Vec<JsonValue>,
        client_id: String,
    },
    /// Ask the relay to persist the document now
    Save { document_id: String },
}

/// Messages sent from relay to client(s)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Snapshot answering a fresh join (or a resume the relay could not serve)
    Joined {
        document_id: String,
        version: u64,
        doc: JsonValue,
    },
    /// All missed batches were re-sent; the session continues at `version`
    Resumed { document_id: String, version: u64 },
    /// An accepted batch, sent to every subscriber including the submitter
    StepsBroadcast {
        document_id: String,
        version: u64,
        steps: Vec<JsonValue>,
        client_id: String,
    },
    /// A submission was not accepted (submitter only)
    Rejected {
        document_id: String,
        reason: RejectReason,
        base_version: u64,
        current_version: u64,
    },
    /// The document was written to storage
    Persisted {
        document_id: String,
        version: u64,
        updated_at: DateTime<Utc>,
    },
    /// Error message
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    OutOfDate,
}

/// Encode steps as StepJSON values
pub fn steps_to_json(steps: &[Step]) -> crate::SyncResult<Vec<JsonValue>> {
    steps.iter().map(Step::to_json).collect()
}

/// Decode StepJSON values against a schema
pub fn steps_from_json(values: &[JsonValue], schema: &Schema) -> crate::SyncResult<Vec<Step>> {
    values
        .iter()
        .map(|value| Step::from_json(value, schema))
        .collect()
}

/// Encode a document snapshot as TreeJSON
pub fn doc_to_json(doc: &Node) -> crate::SyncResult<JsonValue> {
    doc.to_json()
}

/// Encode a message using lib0 format
pub fn encode_message<T: Serialize>(message: &T) -> crate::SyncResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from lib0 format
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> crate::SyncResult<T> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json =
        lib0::decoding::Read::read_string(&mut decoder).map_err(|e| crate::SyncError::Protocol {
            message: format!("Failed to decode lib0 string: {}", e),
        })?;

    let message = serde_json::from_str(json)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::paper_schema;
    use serde_json::json;

    #[test]
    fn test_message_framing() {
        let message = ClientMessage::SubmitSteps {
            document_id: "doc-1".into(),
            base_version: 5,
            steps: vec![json!({"stepType": "replace", "from": 2, "to": 4})],
            client_id: "a".into(),
        };
        let encoded = encode_message(&message).unwrap();
        let decoded: ClientMessage = decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_wire_shape() {
        let message = ServerMessage::Rejected {
            document_id: "doc-1".into(),
            reason: RejectReason::OutOfDate,
            base_version: 5,
            current_version: 7,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "Rejected",
                "document_id": "doc-1",
                "reason": "OutOfDate",
                "base_version": 5,
                "current_version": 7
            })
        );

        let join: ClientMessage =
            serde_json::from_value(json!({"type": "Join", "document_id": "d"})).unwrap();
        assert_eq!(
            join,
            ClientMessage::Join {
                document_id: "d".into(),
                auth_token: None,
                resume: None
            }
        );
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let result: crate::SyncResult<ServerMessage> = decode_message(&[0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }

    #[test]
    fn test_steps_json_helpers() {
        let schema = paper_schema();
        let values = vec![json!({"stepType": "removeMark", "from": 1, "to": 3, "markType": "bold"})];
        let steps = steps_from_json(&values, &schema).unwrap();
        assert_eq!(steps_to_json(&steps).unwrap(), values);
    }
}
