//! # Status Events
//!
//! Per-step lifecycle events streamed to an optional async sink. Small
//! results are embedded inline as a renderable payload; large results are
//! replaced by a "claim check" carrying the step's output content hash.
//!
//! Ordering contract: events for a given step always arrive as
//! `running → (success | skipped | error)`, and events for different steps
//! never interleave mid-transition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Renderable inline payload for a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SduiPayload {
    pub ui_component: String,
    pub props: Value,
}

/// Claim check referencing a stored result instead of embedding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRef {
    /// The step's output content hash.
    pub artifact_id: String,
    /// `table` for a list of mappings, otherwise `json`.
    pub renderer_hint: String,
    #[serde(default)]
    pub metadata: Value,
    pub access_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<SduiPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_ref: Option<DataRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    Running,
    Success,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub step_id: String,
    pub phase: StepPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BlockOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StatusEvent {
    pub fn running(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            phase: StepPhase::Running,
            output: None,
            message: None,
            duration_ms: None,
        }
    }

    pub fn skipped(step_id: &str, message: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            phase: StepPhase::Skipped,
            output: None,
            message: Some(message.to_string()),
            duration_ms: None,
        }
    }

    pub fn success(step_id: &str, output: BlockOutput, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            phase: StepPhase::Success,
            output: Some(output),
            message: None,
            duration_ms: Some(duration_ms),
        }
    }

    pub fn error(step_id: &str, message: &str, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            phase: StepPhase::Error,
            output: None,
            message: Some(message.to_string()),
            duration_ms: Some(duration_ms),
        }
    }
}

/// Receives step lifecycle events. Implementations must be cheap or buffer
/// internally; the scheduler awaits every emission.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn emit(&self, event: StatusEvent);
}

/// Message envelope spoken to host processes (WebSocket server, REPL).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "BLOCK_STATUS_UPDATE")]
    BlockStatusUpdate(StatusEvent),
    #[serde(rename = "BLOCK_RESULT")]
    BlockResult(StatusEvent),
    #[serde(rename = "PAGE_LOADED")]
    PageLoaded(Value),
    #[serde(rename = "PAGE_SAVED")]
    PageSaved(Value),
    #[serde(rename = "RESULT_ERROR")]
    ResultError(Value),
}

/// Retrieval URL for a stored artifact, served by the host process.
pub fn artifact_url(output_hash: &str) -> String {
    format!("/artifacts/{output_hash}")
}

/// Wraps a raw result in a default renderable payload: a list of mappings
/// becomes a table, other structured data becomes json, bare strings become
/// text.
pub fn schematize_result(result: &Value) -> SduiPayload {
    if is_table(result) {
        return SduiPayload {
            ui_component: "table".to_string(),
            props: json!({"data": result}),
        };
    }
    match result {
        Value::Object(_) | Value::Array(_) => SduiPayload {
            ui_component: "json".to_string(),
            props: json!({"data": result}),
        },
        Value::String(text) => SduiPayload {
            ui_component: "text".to_string(),
            props: json!({"content": text}),
        },
        other => SduiPayload {
            ui_component: "json".to_string(),
            props: json!({"data": other}),
        },
    }
}

/// Renderer hint plus light metadata for a claim check.
pub fn result_metadata(result: &Value) -> (String, Value) {
    if let Value::Array(rows) = result {
        if is_table(result) {
            let columns: Vec<&String> = match rows.first() {
                Some(Value::Object(first)) => first.keys().collect(),
                _ => Vec::new(),
            };
            return (
                "table".to_string(),
                json!({"record_count": rows.len(), "columns": columns}),
            );
        }
    }
    ("json".to_string(), json!({}))
}

/// Builds the success payload for a result, embedding inline when its
/// JSON-encoded size is at most `threshold_bytes` and emitting a claim check
/// otherwise.
pub fn build_block_output(
    result: &Value,
    output_hash: Option<&str>,
    threshold_bytes: usize,
) -> BlockOutput {
    let encoded_size = serde_json::to_vec(result).map(|b| b.len()).unwrap_or(usize::MAX);

    match output_hash {
        Some(hash) if encoded_size > threshold_bytes => {
            let (renderer_hint, metadata) = result_metadata(result);
            BlockOutput {
                inline_data: None,
                data_ref: Some(DataRef {
                    artifact_id: hash.to_string(),
                    renderer_hint,
                    metadata,
                    access_url: artifact_url(hash),
                }),
            }
        }
        _ => BlockOutput {
            inline_data: Some(schematize_result(result)),
            data_ref: None,
        },
    }
}

fn is_table(result: &Value) -> bool {
    match result {
        Value::Array(rows) => !rows.is_empty() && rows.iter().all(Value::is_object),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schematize_list_of_mappings_as_table() {
        let payload = schematize_result(&json!([{"a": 1}, {"a": 2}]));
        assert_eq!(payload.ui_component, "table");
        assert_eq!(payload.props["data"][1]["a"], json!(2));
    }

    #[test]
    fn test_schematize_scalars_and_strings() {
        assert_eq!(schematize_result(&json!({"k": 1})).ui_component, "json");
        assert_eq!(schematize_result(&json!("hello")).ui_component, "text");
        assert_eq!(schematize_result(&json!(3.5)).ui_component, "json");
        // A heterogeneous list is not a table.
        assert_eq!(schematize_result(&json!([1, 2])).ui_component, "json");
    }

    #[test]
    fn test_result_metadata_for_table() {
        let rows: Vec<Value> = (0..10).map(|i| json!({"id": i, "name": "x"})).collect();
        let (hint, metadata) = result_metadata(&Value::Array(rows));
        assert_eq!(hint, "table");
        assert_eq!(metadata["record_count"], json!(10));
        assert_eq!(metadata["columns"], json!(["id", "name"]));
    }

    #[test]
    fn test_small_result_embeds_inline() {
        let output = build_block_output(&json!({"n": 1}), Some("sha256:abc"), 256 * 1024);
        assert!(output.inline_data.is_some());
        assert!(output.data_ref.is_none());
    }

    #[test]
    fn test_large_result_emits_claim_check() {
        let rows: Vec<Value> = (0..10_000)
            .map(|i| json!({"id": i, "name": format!("record-{i}")}))
            .collect();
        let result = Value::Array(rows);
        let output = build_block_output(&result, Some("sha256:deadbeef"), 256 * 1024);

        let data_ref = output.data_ref.expect("claim check expected");
        assert!(output.inline_data.is_none());
        assert_eq!(data_ref.artifact_id, "sha256:deadbeef");
        assert_eq!(data_ref.renderer_hint, "table");
        assert_eq!(data_ref.metadata["record_count"], json!(10_000));
        assert_eq!(data_ref.access_url, "/artifacts/sha256:deadbeef");
    }

    #[test]
    fn test_threshold_boundary_is_inclusive_for_inline() {
        let result = json!("x".repeat(100));
        let size = serde_json::to_vec(&result).unwrap().len();
        let at = build_block_output(&result, Some("sha256:h"), size);
        assert!(at.inline_data.is_some());
        let below = build_block_output(&result, Some("sha256:h"), size - 1);
        assert!(below.data_ref.is_some());
    }

    #[test]
    fn test_server_message_envelope_shape() {
        let event = StatusEvent::running("fetch");
        let msg = ServerMessage::BlockStatusUpdate(event);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!("BLOCK_STATUS_UPDATE"));
        assert_eq!(value["payload"]["step_id"], json!("fetch"));
        assert_eq!(value["payload"]["phase"], json!("running"));

        let back: ServerMessage = serde_json::from_value(value).unwrap();
        assert!(matches!(back, ServerMessage::BlockStatusUpdate(_)));
    }
}
