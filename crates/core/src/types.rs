use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Free-form tool parameters as delivered on the wire.
pub type Parameters = Map<String, Value>;

pub const DEFAULT_ASSISTANT_NAME: &str = "Fae";
pub const DEFAULT_ASSISTANT_TYPE: &str = "fae";
pub const DEFAULT_ERROR_TEXT: &str = "An error occurred";
pub const CLIENT_APPROVAL_TYPE: &str = "CLIENT";
pub const USER_APPROVAL_TYPE: &str = "USER";

/// Builds the key used to pair `EXECUTING_TOOL` with `EXECUTED_TOOL`.
///
/// Two concurrent executions of the same tool function share a key and cannot be told
/// apart, since tool chunks carry no correlation id.
pub fn tool_key(integrated_tool_type: &str, tool_function: &str) -> String {
    format!("{integrated_tool_type}-{tool_function}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolPhase {
    #[serde(rename = "EXECUTING_TOOL")]
    Executing,
    #[serde(rename = "EXECUTED_TOOL")]
    Executed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionData {
    #[serde(rename = "type")]
    pub phase: ToolPhase,
    pub integrated_tool_type: String,
    pub tool_function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl ToolExecutionData {
    pub fn executing(
        integrated_tool_type: impl Into<String>,
        tool_function: impl Into<String>,
        parameters: Option<Parameters>,
    ) -> Self {
        Self {
            phase: ToolPhase::Executing,
            integrated_tool_type: integrated_tool_type.into(),
            tool_function: tool_function.into(),
            parameters,
            result: None,
            success: None,
        }
    }

    pub fn executed(
        integrated_tool_type: impl Into<String>,
        tool_function: impl Into<String>,
        result: Option<String>,
        success: Option<bool>,
    ) -> Self {
        Self {
            phase: ToolPhase::Executed,
            integrated_tool_type: integrated_tool_type.into(),
            tool_function: tool_function.into(),
            parameters: None,
            result,
            success,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn key(&self) -> String {
        tool_key(&self.integrated_tool_type, &self.tool_function)
    }

    pub fn same_tool(&self, other: &ToolExecutionData) -> bool {
        self.integrated_tool_type == other.integrated_tool_type
            && self.tool_function == other.tool_function
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn from_approved(approved: bool) -> Self {
        if approved {
            Self::Approved
        } else {
            Self::Rejected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestData {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub request_id: String,
    pub approval_type: String,
}

/// Callback invoked by the UI when a rendered approval is acted upon.
pub type ApprovalCallback = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Approve/reject callbacks attached to rendered approval segments.
///
/// They are passed through to the UI untouched; equality is pointer identity.
#[derive(Clone, Default)]
pub struct ApprovalHandlers {
    pub on_approve: Option<ApprovalCallback>,
    pub on_reject: Option<ApprovalCallback>,
}

impl ApprovalHandlers {
    pub fn new(on_approve: ApprovalCallback, on_reject: ApprovalCallback) -> Self {
        Self {
            on_approve: Some(on_approve),
            on_reject: Some(on_reject),
        }
    }

    pub fn approve(&self, request_id: Option<&str>) {
        if let Some(callback) = &self.on_approve {
            callback(request_id);
        }
    }

    pub fn reject(&self, request_id: Option<&str>) {
        if let Some(callback) = &self.on_reject {
            callback(request_id);
        }
    }
}

impl fmt::Debug for ApprovalHandlers {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ApprovalHandlers")
            .field("on_approve", &self.on_approve.is_some())
            .field("on_reject", &self.on_reject.is_some())
            .finish()
    }
}

impl PartialEq for ApprovalHandlers {
    fn eq(&self, other: &Self) -> bool {
        same_callback(&self.on_approve, &other.on_approve)
            && same_callback(&self.on_reject, &other.on_reject)
    }
}

fn same_callback(left: &Option<ApprovalCallback>, right: &Option<ApprovalCallback>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => Arc::ptr_eq(left, right),
        (None, None) => true,
        _ => false,
    }
}

/// One renderable unit of an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text {
        text: String,
    },
    ToolExecution {
        data: ToolExecutionData,
    },
    ApprovalRequest {
        data: ApprovalRequestData,
        status: ApprovalStatus,
        #[serde(skip)]
        handlers: ApprovalHandlers,
    },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool(data: ToolExecutionData) -> Self {
        Self::ToolExecution { data }
    }

    /// Returns the request id when this is an approval segment.
    pub fn approval_request_id(&self) -> Option<&str> {
        match self {
            Self::ApprovalRequest { data, .. } => Some(data.request_id.as_str()),
            Self::Text { .. } | Self::ToolExecution { .. } => None,
        }
    }

    pub fn approval_status(&self) -> Option<ApprovalStatus> {
        match self {
            Self::ApprovalRequest { status, .. } => Some(*status),
            Self::Text { .. } | Self::ToolExecution { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub approval_type: String,
}

impl PendingApproval {
    pub fn new(
        command: impl Into<String>,
        explanation: Option<String>,
        approval_type: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            explanation,
            approval_type: approval_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutingTool {
    pub integrated_tool_type: String,
    pub tool_function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl From<&ToolExecutionData> for ExecutingTool {
    fn from(data: &ToolExecutionData) -> Self {
        Self {
            integrated_tool_type: data.integrated_tool_type.clone(),
            tool_function: data.tool_function.clone(),
            parameters: data.parameters.clone(),
        }
    }
}

/// Point-in-time copy of an accumulator's internals.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccumulatorState {
    pub segments: Vec<Segment>,
    pub current_text_buffer: String,
    pub pending_approvals: IndexMap<String, PendingApproval>,
    pub executing_tools: IndexMap<String, ExecutingTool>,
}

/// Open turn state recovered from the tail of a reconciled transcript.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IncompleteState {
    pub existing_segments: Vec<Segment>,
    pub pending_approvals: Option<IndexMap<String, PendingApproval>>,
    pub executing_tools: Option<IndexMap<String, ExecutingTool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Segments(Vec<Segment>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Segments(_) => None,
        }
    }

    pub fn as_segments(&self) -> Option<&[Segment]> {
        match self {
            Self::Segments(segments) => Some(segments),
            Self::Text(_) => None,
        }
    }
}

/// One displayable message produced by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: MessageContent,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_type: Option<String>,
    /// Creation time as persisted, passed through unparsed.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerType {
    Client,
    Admin,
    Assistant,
    #[serde(other)]
    Other,
}

impl OwnerType {
    /// Client and admin authored messages are user messages; everything else is assistant.
    pub fn is_user(self) -> bool {
        matches!(self, Self::Client | Self::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOwner {
    #[serde(rename = "type")]
    pub kind: OwnerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl MessageOwner {
    pub fn new(kind: OwnerType) -> Self {
        Self {
            kind,
            machine_id: None,
            user_id: None,
            model: None,
        }
    }
}

/// A persisted dialog message as supplied by the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialog_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<MessageOwner>,
    /// Raw message-data records; a single record or a list is accepted on input.
    #[serde(default, deserialize_with = "one_or_many")]
    pub message_data: Vec<Value>,
}

impl HistoricalMessage {
    pub fn new(
        id: impl Into<String>,
        owner: OwnerType,
        created_at: impl Into<String>,
        message_data: Vec<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            dialog_id: None,
            chat_type: None,
            created_at: created_at.into(),
            owner: Some(MessageOwner::new(owner)),
            message_data,
        }
    }

    pub fn is_user(&self) -> bool {
        self.owner.as_ref().is_some_and(|owner| owner.kind.is_user())
    }

    pub fn is_admin(&self) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| owner.kind == OwnerType::Admin)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(records)) => records,
        Some(record) => vec![record],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatType {
    #[serde(rename = "CLIENT_CHAT")]
    Client,
    #[serde(rename = "ADMIN_AI_CHAT")]
    Admin,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "CLIENT_CHAT",
            Self::Admin => "ADMIN_AI_CHAT",
        }
    }

    /// Subject topic on which live chunks of this chat type arrive.
    pub fn topic(self) -> Topic {
        match self {
            Self::Client => Topic::Message,
            Self::Admin => Topic::AdminMessage,
        }
    }
}

/// Dialog subject suffix: `chat.<dialogId>.<topic>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    Message,
    AdminMessage,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::AdminMessage => "admin-message",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn historical_message_accepts_single_record_or_list() {
        let single: HistoricalMessage = serde_json::from_value(json!({
            "id": "m1",
            "createdAt": "2024-05-01T10:00:00Z",
            "owner": { "type": "CLIENT" },
            "messageData": { "type": "TEXT", "text": "hi" }
        }))
        .expect("single record");
        assert_eq!(single.message_data.len(), 1);
        assert!(single.is_user());

        let many: HistoricalMessage = serde_json::from_value(json!({
            "id": "m2",
            "createdAt": "2024-05-01T10:00:01Z",
            "owner": { "type": "SOMETHING_NEW" },
            "messageData": [{ "type": "TEXT" }, { "type": "ERROR" }]
        }))
        .expect("record list");
        assert_eq!(many.message_data.len(), 2);
        assert!(!many.is_user());

        let empty: HistoricalMessage = serde_json::from_value(json!({
            "id": "m3",
            "createdAt": "2024-05-01T10:00:02Z"
        }))
        .expect("no records");
        assert!(empty.message_data.is_empty());
        assert!(!empty.is_user());
    }

    #[test]
    fn segments_serialize_in_wire_shape() {
        let segment = Segment::tool(ToolExecutionData::executed(
            "shell",
            "run",
            Some("ok".to_string()),
            Some(true),
        ));
        assert_eq!(
            serde_json::to_value(&segment).expect("serialize"),
            json!({
                "type": "tool_execution",
                "data": {
                    "type": "EXECUTED_TOOL",
                    "integratedToolType": "shell",
                    "toolFunction": "run",
                    "result": "ok",
                    "success": true
                }
            })
        );
    }

    #[test]
    fn handlers_compare_by_identity() {
        let approve: ApprovalCallback = Arc::new(|_| {});
        let reject: ApprovalCallback = Arc::new(|_| {});
        let handlers = ApprovalHandlers::new(approve.clone(), reject.clone());

        assert_eq!(handlers, handlers.clone());
        assert_ne!(handlers, ApprovalHandlers::default());
        assert_ne!(handlers, ApprovalHandlers::new(reject, approve));
    }
}
