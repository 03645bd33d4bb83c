//! Rebuilds persisted dialog history into displayable messages.
//!
//! Every pass is a clean rebuild from the full transcript. Consecutive assistant messages
//! coalesce into one turn; user messages and the end of input close it.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;

use crate::action::Action;
use crate::parser::parse_chunk;
use crate::segments::SegmentAccumulator;
use crate::types::{
    ApprovalHandlers, ApprovalStatus, DEFAULT_ASSISTANT_NAME, DEFAULT_ASSISTANT_TYPE,
    DEFAULT_ERROR_TEXT, HistoricalMessage, MessageContent, MessageRole, PendingApproval,
    ProcessedMessage,
};

/// Id prefix of the synthetic message holding approvals still awaiting a result.
pub const PENDING_APPROVALS_PREFIX: &str = "pending-approvals-";

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub assistant_name: String,
    pub assistant_type: String,
    pub assistant_avatar: Option<String>,
    pub handlers: ApprovalHandlers,
    /// Only messages of this chat type are considered.
    pub chat_type_filter: Option<String>,
    /// Known statuses override the approved flag carried by results.
    pub approval_statuses: HashMap<String, ApprovalStatus>,
    /// `None` displays every approval type.
    pub display_approval_types: Option<Vec<String>>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            assistant_name: DEFAULT_ASSISTANT_NAME.to_string(),
            assistant_type: DEFAULT_ASSISTANT_TYPE.to_string(),
            assistant_avatar: None,
            handlers: ApprovalHandlers::default(),
            chat_type_filter: None,
            approval_statuses: HashMap::new(),
            display_approval_types: None,
        }
    }
}

impl ReconcileOptions {
    fn displays(&self, approval_type: &str) -> bool {
        self.display_approval_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|displayed| displayed == approval_type))
    }

    fn includes(&self, message: &HistoricalMessage) -> bool {
        match &self.chat_type_filter {
            Some(filter) => message.chat_type.as_deref() == Some(filter.as_str()),
            None => true,
        }
    }

    fn assistant_message(
        &self,
        id: String,
        role: MessageRole,
        content: MessageContent,
        timestamp: String,
    ) -> ProcessedMessage {
        ProcessedMessage {
            id,
            role,
            content,
            name: self.assistant_name.clone(),
            assistant_type: Some(self.assistant_type.clone()),
            timestamp,
            avatar: self.assistant_avatar.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub messages: Vec<ProcessedMessage>,
    /// Out-of-scope approvals still awaiting a result.
    pub escalated_approvals: IndexMap<String, PendingApproval>,
}

/// Whether error records are skipped or emitted at their chronological position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorRouting {
    Skip,
    Interleave,
}

struct Reconciler<'a> {
    options: &'a ReconcileOptions,
    routing: ErrorRouting,
    accumulator: SegmentAccumulator,
    /// Identity (id, timestamp) of the open assistant turn.
    turn: Option<(String, String)>,
    /// How many turns each source id has produced so far.
    parts: HashMap<String, usize>,
    messages: Vec<ProcessedMessage>,
    escalated: IndexMap<String, PendingApproval>,
    last_timestamp: Option<String>,
}

impl<'a> Reconciler<'a> {
    fn new(options: &'a ReconcileOptions, routing: ErrorRouting) -> Self {
        Self {
            options,
            routing,
            accumulator: SegmentAccumulator::with_handlers(options.handlers.clone()),
            turn: None,
            parts: HashMap::new(),
            messages: Vec::new(),
            escalated: IndexMap::new(),
            last_timestamp: None,
        }
    }

    fn run(mut self, history: &[HistoricalMessage]) -> ReconcileOutcome {
        for message in history.iter().filter(|message| self.options.includes(message)) {
            self.last_timestamp = Some(message.created_at.clone());
            if message.is_user() {
                self.flush();
                self.push_user(message);
            } else {
                self.open_turn(message);
                for record in &message.message_data {
                    self.apply_record(message, record);
                }
            }
        }
        self.flush();
        self.push_pending_approvals();

        tracing::debug!(
            input = history.len(),
            output = self.messages.len(),
            escalated = self.escalated.len(),
            "reconciled dialog history"
        );
        ReconcileOutcome {
            messages: self.messages,
            escalated_approvals: self.escalated,
        }
    }

    fn open_turn(&mut self, message: &HistoricalMessage) {
        if self.turn.is_none() {
            self.turn = Some((message.id.clone(), message.created_at.clone()));
        }
    }

    fn push_user(&mut self, message: &HistoricalMessage) {
        let name = if message.is_admin() { "Admin" } else { "You" };
        for record in &message.message_data {
            if let Some(Action::Text { text }) = parse_chunk(record)
                && !text.is_empty()
            {
                self.messages.push(ProcessedMessage {
                    id: message.id.clone(),
                    role: MessageRole::User,
                    content: MessageContent::Text(text),
                    name: name.to_string(),
                    assistant_type: None,
                    timestamp: message.created_at.clone(),
                    avatar: None,
                });
            }
        }
    }

    fn apply_record(&mut self, message: &HistoricalMessage, record: &serde_json::Value) {
        let Some(action) = parse_chunk(record) else {
            return;
        };

        match action {
            Action::Text { ref text } if text.is_empty() => {}
            Action::Text { .. } | Action::ToolExecution { .. } => {
                self.accumulator.apply_content(&action);
            }
            Action::ApprovalRequest {
                request_id,
                command,
                explanation,
                approval_type,
            } if !request_id.is_empty() => {
                let approval = PendingApproval::new(command, explanation, approval_type);
                if self.options.displays(&approval.approval_type) {
                    self.accumulator.track_approval_request(request_id, approval);
                } else {
                    self.escalated.insert(request_id, approval);
                }
            }
            Action::ApprovalResult {
                request_id,
                approved,
                approval_type,
            } if !request_id.is_empty() => {
                let approved = match self.options.approval_statuses.get(&request_id) {
                    Some(ApprovalStatus::Pending) | None => approved,
                    Some(status) => *status == ApprovalStatus::Approved,
                };
                match self.escalated.shift_remove(&request_id) {
                    Some(escalated) => {
                        self.accumulator
                            .resolve_escalated(&request_id, escalated, approved);
                    }
                    None => {
                        self.accumulator
                            .process_approval_result(&request_id, approved, &approval_type);
                    }
                }
            }
            Action::Error { error, .. } if self.routing == ErrorRouting::Interleave => {
                self.flush();
                self.messages
                    .push(error_message(self.options, message, error));
                self.open_turn(message);
            }
            _ => {}
        }
    }

    /// Emits the open turn if it has content.
    ///
    /// A turn reopened after an interleaved error keeps its source id with a `-part-N`
    /// suffix so every emitted message id stays unique.
    fn flush(&mut self) {
        if !self.accumulator.has_content() {
            return;
        }
        let Some((id, timestamp)) = self.turn.take() else {
            return;
        };
        let part = self.parts.entry(id.clone()).or_default();
        *part += 1;
        let id = match *part {
            1 => id,
            part => format!("{id}-part-{part}"),
        };
        let segments = self.accumulator.segments();
        self.accumulator.reset_segments();
        self.messages.push(self.options.assistant_message(
            id,
            MessageRole::Assistant,
            MessageContent::Segments(segments),
            timestamp,
        ));
    }

    fn push_pending_approvals(&mut self) {
        let pending = self.accumulator.flush_pending_approvals();
        if pending.is_empty() {
            return;
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let timestamp = self.last_timestamp.clone().unwrap_or_default();
        self.messages.push(self.options.assistant_message(
            format!("{PENDING_APPROVALS_PREFIX}{millis}"),
            MessageRole::Assistant,
            MessageContent::Segments(pending),
            timestamp,
        ));
    }
}

fn error_message(
    options: &ReconcileOptions,
    message: &HistoricalMessage,
    error: String,
) -> ProcessedMessage {
    let text = if error.is_empty() {
        DEFAULT_ERROR_TEXT.to_string()
    } else {
        error
    };
    options.assistant_message(
        format!("{}-error", message.id),
        MessageRole::Error,
        MessageContent::Text(text),
        message.created_at.clone(),
    )
}

/// Rebuilds `history` into displayable messages, skipping error records.
pub fn reconcile(history: &[HistoricalMessage], options: &ReconcileOptions) -> ReconcileOutcome {
    Reconciler::new(options, ErrorRouting::Skip).run(history)
}

/// Like [`reconcile`], but emits error records in place, closing the open turn first.
pub fn reconcile_with_errors(
    history: &[HistoricalMessage],
    options: &ReconcileOptions,
) -> ReconcileOutcome {
    Reconciler::new(options, ErrorRouting::Interleave).run(history)
}

/// Collects one error message per error record, independent of turn reconciliation.
pub fn extract_error_messages(
    history: &[HistoricalMessage],
    options: &ReconcileOptions,
) -> Vec<ProcessedMessage> {
    history
        .iter()
        .filter(|message| options.includes(message))
        .flat_map(|message| {
            message.message_data.iter().filter_map(move |record| {
                match parse_chunk(record)? {
                    Action::Error { error, .. } => Some(error_message(options, message, error)),
                    _ => None,
                }
            })
        })
        .collect()
}
