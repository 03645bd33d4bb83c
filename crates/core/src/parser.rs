//! Total decoding of loosely typed chunk payloads into [`Action`]s.
//!
//! Malformed payloads decode to `None` and are dropped by callers; nothing here panics.

use serde_json::{Map, Value};

use crate::action::{Action, MessageKind, ModelMetadata};
use crate::types::{
    CLIENT_APPROVAL_TYPE, DEFAULT_ERROR_TEXT, ToolExecutionData, ToolPhase, USER_APPROVAL_TYPE,
};

/// Parses one raw chunk into an action, or `None` when it is unrecognized or incomplete.
pub fn parse_chunk(raw: &Value) -> Option<Action> {
    let record = raw.as_object()?;
    let kind = MessageKind::parse(&coerce_string(record.get("type")))?;

    match kind {
        MessageKind::MessageStart => Some(Action::MessageStart),
        MessageKind::MessageEnd => Some(Action::MessageEnd),
        MessageKind::AiMetadata => parse_metadata(record),
        MessageKind::Text => {
            let text = record.get("text")?.as_str()?;
            Some(Action::Text {
                text: text.to_string(),
            })
        }
        MessageKind::ExecutingTool => Some(Action::ToolExecution {
            data: parse_tool(record, ToolPhase::Executing),
        }),
        MessageKind::ExecutedTool => Some(Action::ToolExecution {
            data: parse_tool(record, ToolPhase::Executed),
        }),
        MessageKind::ApprovalRequest => Some(Action::ApprovalRequest {
            request_id: request_id(record),
            command: non_empty_str(record, "command").unwrap_or_default().to_string(),
            explanation: optional_str(record, "explanation"),
            approval_type: non_empty_str(record, "approvalType")
                .unwrap_or(USER_APPROVAL_TYPE)
                .to_string(),
        }),
        MessageKind::ApprovalResult => Some(Action::ApprovalResult {
            request_id: request_id(record),
            approved: matches!(record.get("approved"), Some(Value::Bool(true))),
            approval_type: non_empty_str(record, "approvalType")
                .unwrap_or(CLIENT_APPROVAL_TYPE)
                .to_string(),
        }),
        MessageKind::Error => Some(Action::Error {
            error: non_empty_str(record, "error")
                .unwrap_or(DEFAULT_ERROR_TEXT)
                .to_string(),
            details: optional_str(record, "details"),
        }),
        MessageKind::MessageRequest => Some(Action::MessageRequest {
            text: coerce_string(record.get("text")),
        }),
    }
}

fn parse_metadata(record: &Map<String, Value>) -> Option<Action> {
    let model_name = record.get("modelName")?.as_str()?;
    let provider = match record.get("providerName") {
        Some(value) if is_truthy(value) => value,
        _ => record.get("provider")?,
    };
    let provider_name = provider.as_str()?;

    Some(Action::Metadata(ModelMetadata {
        model_name: model_name.to_string(),
        provider_name: provider_name.to_string(),
        context_window: record
            .get("contextWindow")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }))
}

fn parse_tool(record: &Map<String, Value>, phase: ToolPhase) -> ToolExecutionData {
    let (result, success) = match phase {
        ToolPhase::Executing => (None, None),
        ToolPhase::Executed => (
            optional_str(record, "result"),
            record.get("success").and_then(Value::as_bool),
        ),
    };

    ToolExecutionData {
        phase,
        integrated_tool_type: non_empty_str(record, "integratedToolType")
            .unwrap_or_default()
            .to_string(),
        tool_function: non_empty_str(record, "toolFunction")
            .unwrap_or_default()
            .to_string(),
        parameters: record.get("parameters").and_then(Value::as_object).cloned(),
        result,
        success,
    }
}

fn request_id(record: &Map<String, Value>) -> String {
    non_empty_str(record, "approvalRequestId")
        .or_else(|| non_empty_str(record, "approval_request_id"))
        .unwrap_or_default()
        .to_string()
}

fn non_empty_str<'a>(record: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn optional_str(record: &Map<String, Value>, key: &str) -> Option<String> {
    record.get(key).and_then(Value::as_str).map(str::to_string)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Loose string coercion for tag-like fields; falsy values become empty.
fn coerce_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) if number.as_f64() != Some(0.0) => number.to_string(),
        Some(Value::Bool(true)) => "true".to_string(),
        _ => String::new(),
    }
}

fn chunk_type(raw: &Value) -> Option<&str> {
    raw.as_object()?.get("type")?.as_str()
}

/// True for `MESSAGE_START` / `MESSAGE_END` chunks.
pub fn is_control_chunk(raw: &Value) -> bool {
    matches!(
        chunk_type(raw).and_then(MessageKind::parse),
        Some(MessageKind::MessageStart | MessageKind::MessageEnd)
    )
}

pub fn is_error_chunk(raw: &Value) -> bool {
    chunk_type(raw) == Some(MessageKind::Error.as_str())
}

pub fn is_metadata_chunk(raw: &Value) -> bool {
    chunk_type(raw) == Some(MessageKind::AiMetadata.as_str())
}

/// Returns the text of a `TEXT` chunk.
pub fn extract_text(raw: &Value) -> Option<&str> {
    if chunk_type(raw) != Some(MessageKind::Text.as_str()) {
        return None;
    }
    raw.get("text")?.as_str()
}

/// Resolves the human-readable message carried by error details.
///
/// Details that are a JSON document yield their `error.message` (if any); anything else is
/// returned verbatim.
pub fn error_detail_message(details: &str) -> Option<String> {
    match serde_json::from_str::<Value>(details) {
        Ok(document) => document
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string),
        Err(_) => Some(details.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn non_objects_and_unknown_types_are_dropped() {
        assert_eq!(parse_chunk(&json!(null)), None);
        assert_eq!(parse_chunk(&json!("TEXT")), None);
        assert_eq!(parse_chunk(&json!([{ "type": "TEXT", "text": "x" }])), None);
        assert_eq!(parse_chunk(&json!({ "type": "SOMETHING_ELSE" })), None);
        assert_eq!(parse_chunk(&json!({ "text": "no type" })), None);
        assert_eq!(parse_chunk(&json!({ "type": 42 })), None);
    }

    #[test]
    fn text_requires_a_string() {
        assert_eq!(
            parse_chunk(&json!({ "type": "TEXT", "text": "hello" })),
            Some(Action::Text {
                text: "hello".to_string()
            })
        );
        assert_eq!(
            parse_chunk(&json!({ "type": "TEXT", "text": "" })),
            Some(Action::Text {
                text: String::new()
            })
        );
        assert_eq!(parse_chunk(&json!({ "type": "TEXT", "text": 7 })), None);
        assert_eq!(parse_chunk(&json!({ "type": "TEXT" })), None);
    }

    #[test]
    fn metadata_requires_model_and_provider_strings() {
        assert_eq!(
            parse_chunk(&json!({
                "type": "AI_METADATA",
                "modelName": "m",
                "provider": "p",
                "contextWindow": 128000
            })),
            Some(Action::Metadata(ModelMetadata {
                model_name: "m".to_string(),
                provider_name: "p".to_string(),
                context_window: 128000,
            }))
        );
        assert_eq!(
            parse_chunk(&json!({
                "type": "AI_METADATA",
                "modelName": "m",
                "providerName": "preferred",
                "provider": "p",
                "contextWindow": "large"
            })),
            Some(Action::Metadata(ModelMetadata {
                model_name: "m".to_string(),
                provider_name: "preferred".to_string(),
                context_window: 0,
            }))
        );
        assert_eq!(
            parse_chunk(&json!({ "type": "AI_METADATA", "modelName": "m" })),
            None
        );
        assert_eq!(
            parse_chunk(&json!({ "type": "AI_METADATA", "providerName": "p" })),
            None
        );
    }

    #[test]
    fn tool_chunks_fill_missing_names() {
        let Some(Action::ToolExecution { data }) = parse_chunk(&json!({
            "type": "EXECUTED_TOOL",
            "toolFunction": "list",
            "parameters": { "path": "/" },
            "result": "done",
            "success": false
        })) else {
            panic!("expected tool execution");
        };
        assert_eq!(data.phase, ToolPhase::Executed);
        assert_eq!(data.integrated_tool_type, "");
        assert_eq!(data.tool_function, "list");
        assert_eq!(data.result.as_deref(), Some("done"));
        assert_eq!(data.success, Some(false));
        assert!(data.parameters.is_some());

        let Some(Action::ToolExecution { data }) = parse_chunk(&json!({
            "type": "EXECUTING_TOOL",
            "integratedToolType": "fs",
            "toolFunction": "list",
            "result": "ignored"
        })) else {
            panic!("expected tool execution");
        };
        assert_eq!(data.phase, ToolPhase::Executing);
        assert_eq!(data.result, None);
    }

    #[test]
    fn approval_fallbacks_differ_between_request_and_result() {
        assert_eq!(
            parse_chunk(&json!({
                "type": "APPROVAL_REQUEST",
                "approval_request_id": "r1",
                "command": "rm -rf /tmp/x"
            })),
            Some(Action::ApprovalRequest {
                request_id: "r1".to_string(),
                command: "rm -rf /tmp/x".to_string(),
                explanation: None,
                approval_type: "USER".to_string(),
            })
        );
        assert_eq!(
            parse_chunk(&json!({
                "type": "APPROVAL_RESULT",
                "approvalRequestId": "r1",
                "approved": "yes"
            })),
            Some(Action::ApprovalResult {
                request_id: "r1".to_string(),
                approved: false,
                approval_type: "CLIENT".to_string(),
            })
        );
    }

    #[test]
    fn error_and_message_request_defaults() {
        assert_eq!(
            parse_chunk(&json!({ "type": "ERROR" })),
            Some(Action::Error {
                error: "An error occurred".to_string(),
                details: None,
            })
        );
        assert_eq!(
            parse_chunk(&json!({ "type": "MESSAGE_REQUEST", "text": 12 })),
            Some(Action::MessageRequest {
                text: "12".to_string()
            })
        );
        assert_eq!(
            parse_chunk(&json!({ "type": "MESSAGE_REQUEST" })),
            Some(Action::MessageRequest {
                text: String::new()
            })
        );
    }

    #[test]
    fn chunk_predicates() {
        assert!(is_control_chunk(&json!({ "type": "MESSAGE_START" })));
        assert!(is_control_chunk(&json!({ "type": "MESSAGE_END" })));
        assert!(!is_control_chunk(&json!({ "type": "TEXT" })));
        assert!(is_error_chunk(&json!({ "type": "ERROR" })));
        assert!(is_metadata_chunk(&json!({ "type": "AI_METADATA" })));
        assert_eq!(
            extract_text(&json!({ "type": "TEXT", "text": "a" })),
            Some("a")
        );
        assert_eq!(extract_text(&json!({ "type": "ERROR", "text": "a" })), None);
    }

    #[test]
    fn error_details_prefer_nested_message() {
        assert_eq!(
            error_detail_message(r#"{"error":{"message":"quota exceeded"}}"#).as_deref(),
            Some("quota exceeded")
        );
        assert_eq!(error_detail_message(r#"{"status":500}"#), None);
        assert_eq!(
            error_detail_message("upstream timeout").as_deref(),
            Some("upstream timeout")
        );
    }
}
