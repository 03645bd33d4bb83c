use serde::Serialize;

use crate::types::ToolExecutionData;

/// Closed set of chunk kinds recognized on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    ExecutingTool,
    ExecutedTool,
    ApprovalRequest,
    ApprovalResult,
    Error,
    MessageStart,
    MessageEnd,
    MessageRequest,
    AiMetadata,
}

impl MessageKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "TEXT" => Some(Self::Text),
            "EXECUTING_TOOL" => Some(Self::ExecutingTool),
            "EXECUTED_TOOL" => Some(Self::ExecutedTool),
            "APPROVAL_REQUEST" => Some(Self::ApprovalRequest),
            "APPROVAL_RESULT" => Some(Self::ApprovalResult),
            "ERROR" => Some(Self::Error),
            "MESSAGE_START" => Some(Self::MessageStart),
            "MESSAGE_END" => Some(Self::MessageEnd),
            "MESSAGE_REQUEST" => Some(Self::MessageRequest),
            "AI_METADATA" => Some(Self::AiMetadata),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::ExecutingTool => "EXECUTING_TOOL",
            Self::ExecutedTool => "EXECUTED_TOOL",
            Self::ApprovalRequest => "APPROVAL_REQUEST",
            Self::ApprovalResult => "APPROVAL_RESULT",
            Self::Error => "ERROR",
            Self::MessageStart => "MESSAGE_START",
            Self::MessageEnd => "MESSAGE_END",
            Self::MessageRequest => "MESSAGE_REQUEST",
            Self::AiMetadata => "AI_METADATA",
        }
    }
}

/// Model information announced at the start of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub model_name: String,
    pub provider_name: String,
    pub context_window: u64,
}

/// One validated, typed event parsed from a raw chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    MessageStart,
    MessageEnd,
    Metadata(ModelMetadata),
    Text {
        text: String,
    },
    ToolExecution {
        data: ToolExecutionData,
    },
    ApprovalRequest {
        request_id: String,
        command: String,
        explanation: Option<String>,
        approval_type: String,
    },
    ApprovalResult {
        request_id: String,
        approved: bool,
        approval_type: String,
    },
    Error {
        error: String,
        details: Option<String>,
    },
    /// A user-authored message echoed over the dialog channel.
    MessageRequest {
        text: String,
    },
}
