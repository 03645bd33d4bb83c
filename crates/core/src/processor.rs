//! Live chunk processing for one active dialog.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::action::{Action, ModelMetadata};
use crate::parser::{error_detail_message, parse_chunk};
use crate::segments::SegmentAccumulator;
use crate::types::{
    ApprovalHandlers, ApprovalStatus, CLIENT_APPROVAL_TYPE, IncompleteState, PendingApproval,
    Segment,
};

/// Notification emitted to the UI for each processed chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatUpdate {
    StreamStarted,
    StreamEnded,
    Metadata(ModelMetadata),
    /// Full snapshot of the current turn.
    Segments {
        segments: Vec<Segment>,
    },
    Error {
        error: String,
        details: Option<String>,
    },
    UserMessage {
        text: String,
    },
    EscalatedApproval {
        request_id: String,
        approval: PendingApproval,
    },
    EscalatedApprovalResolved {
        request_id: String,
        approved: bool,
        approval: PendingApproval,
    },
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Approval types rendered inline; anything else is escalated.
    pub display_approval_types: Vec<String>,
    /// Statuses already known for approval ids, e.g. from a previous session.
    pub approval_statuses: HashMap<String, ApprovalStatus>,
    pub handlers: ApprovalHandlers,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            display_approval_types: vec![CLIENT_APPROVAL_TYPE.to_string()],
            approval_statuses: HashMap::new(),
            handlers: ApprovalHandlers::default(),
        }
    }
}

impl ProcessorOptions {
    pub fn displays(&self, approval_type: &str) -> bool {
        self.display_approval_types
            .iter()
            .any(|displayed| displayed == approval_type)
    }
}

/// Turns live chunks into [`ChatUpdate`]s, one accumulator per dialog.
#[derive(Debug)]
pub struct RealtimeChunkProcessor {
    accumulator: SegmentAccumulator,
    escalated: IndexMap<String, PendingApproval>,
    options: ProcessorOptions,
}

impl RealtimeChunkProcessor {
    pub fn new(options: ProcessorOptions) -> Self {
        Self {
            accumulator: SegmentAccumulator::with_handlers(options.handlers.clone()),
            escalated: IndexMap::new(),
            options,
        }
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    pub fn set_handlers(&mut self, handlers: ApprovalHandlers) {
        self.accumulator.set_handlers(handlers.clone());
        self.options.handlers = handlers;
    }

    /// Pre-seeds an open turn and re-announces approvals escalated before a reconnect.
    pub fn seed(
        &mut self,
        incomplete: Option<IncompleteState>,
        escalated: IndexMap<String, PendingApproval>,
    ) -> Vec<ChatUpdate> {
        if let Some(state) = incomplete {
            self.accumulator.initialize_with_state(state);
        }
        self.escalated = escalated;
        self.escalated
            .iter()
            .map(|(request_id, approval)| ChatUpdate::EscalatedApproval {
                request_id: request_id.clone(),
                approval: approval.clone(),
            })
            .collect()
    }

    /// Processes one raw chunk. Unparseable chunks produce no updates.
    pub fn process_chunk(&mut self, raw: &Value) -> Vec<ChatUpdate> {
        match parse_chunk(raw) {
            Some(action) => self.process_action(action),
            None => {
                tracing::trace!(chunk = %raw, "dropping unrecognized chunk");
                Vec::new()
            }
        }
    }

    pub fn process_action(&mut self, action: Action) -> Vec<ChatUpdate> {
        match action {
            Action::MessageStart => {
                self.accumulator.reset_segments();
                vec![ChatUpdate::StreamStarted]
            }
            Action::MessageEnd => vec![ChatUpdate::StreamEnded],
            Action::Metadata(metadata) => vec![ChatUpdate::Metadata(metadata)],
            Action::Text { .. } | Action::ToolExecution { .. } => {
                self.accumulator.apply_content(&action);
                vec![self.snapshot()]
            }
            Action::ApprovalRequest {
                request_id,
                command,
                explanation,
                approval_type,
            } => {
                if self.options.displays(&approval_type) {
                    let status = self
                        .options
                        .approval_statuses
                        .get(&request_id)
                        .copied()
                        .unwrap_or_default();
                    self.accumulator.add_approval_request(
                        &request_id,
                        &command,
                        explanation,
                        &approval_type,
                        status,
                    );
                    vec![self.snapshot()]
                } else {
                    let approval = PendingApproval::new(command, explanation, approval_type);
                    self.accumulator
                        .track_approval_request(request_id.clone(), approval.clone());
                    self.escalated.insert(request_id.clone(), approval.clone());
                    vec![ChatUpdate::EscalatedApproval {
                        request_id,
                        approval,
                    }]
                }
            }
            Action::ApprovalResult {
                request_id,
                approved,
                approval_type,
            } => self.resolve_approval(request_id, approved, &approval_type),
            Action::Error { error, details } => {
                let details = details.as_deref().and_then(error_detail_message);
                tracing::debug!(error = %error, details = ?details, "stream reported error");
                self.accumulator.reset_segments();
                vec![ChatUpdate::Error { error, details }]
            }
            Action::MessageRequest { text } => vec![ChatUpdate::UserMessage { text }],
        }
    }

    fn resolve_approval(
        &mut self,
        request_id: String,
        approved: bool,
        approval_type: &str,
    ) -> Vec<ChatUpdate> {
        if let Some(approval) = self.escalated.shift_remove(&request_id) {
            self.accumulator
                .resolve_escalated(&request_id, approval.clone(), approved);
            return vec![
                ChatUpdate::EscalatedApprovalResolved {
                    request_id,
                    approved,
                    approval,
                },
                self.snapshot(),
            ];
        }

        if self.accumulator.has_rendered_approval(&request_id) {
            self.accumulator
                .update_approval_status(&request_id, ApprovalStatus::from_approved(approved));
            self.accumulator.remove_pending_approval(&request_id);
        } else {
            self.accumulator
                .process_approval_result(&request_id, approved, approval_type);
        }
        vec![self.snapshot()]
    }

    fn snapshot(&self) -> ChatUpdate {
        ChatUpdate::Segments {
            segments: self.accumulator.segments(),
        }
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.accumulator.segments()
    }

    pub fn accumulator(&self) -> &SegmentAccumulator {
        &self.accumulator
    }

    pub fn update_approval_status(
        &mut self,
        request_id: &str,
        status: ApprovalStatus,
    ) -> Vec<Segment> {
        self.accumulator.update_approval_status(request_id, status)
    }

    /// Approvals escalated outside the display scope and still awaiting a result.
    pub fn escalated_approvals(&self) -> &IndexMap<String, PendingApproval> {
        &self.escalated
    }

    pub fn reset(&mut self) {
        self.accumulator.reset();
        self.escalated.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{ToolExecutionData, ToolPhase};

    fn feed(processor: &mut RealtimeChunkProcessor, chunks: &[Value]) -> Vec<ChatUpdate> {
        chunks
            .iter()
            .flat_map(|chunk| processor.process_chunk(chunk))
            .collect()
    }

    #[test]
    fn streams_text_between_boundaries() {
        let mut processor = RealtimeChunkProcessor::new(ProcessorOptions::default());
        let updates = feed(
            &mut processor,
            &[
                json!({ "type": "MESSAGE_START" }),
                json!({ "type": "TEXT", "text": "Hello " }),
                json!({ "type": "TEXT", "text": "world" }),
                json!({ "type": "MESSAGE_END" }),
            ],
        );

        assert_eq!(updates.first(), Some(&ChatUpdate::StreamStarted));
        assert_eq!(updates.last(), Some(&ChatUpdate::StreamEnded));
        assert_eq!(processor.segments(), vec![Segment::text("Hello world")]);
    }

    #[test]
    fn garbage_chunks_produce_nothing() {
        let mut processor = RealtimeChunkProcessor::new(ProcessorOptions::default());
        assert!(processor.process_chunk(&json!("nope")).is_empty());
        assert!(processor.process_chunk(&json!({ "type": "BOGUS" })).is_empty());
        assert!(processor.segments().is_empty());
    }

    #[test]
    fn escalated_approval_renders_on_resolution() {
        let mut processor = RealtimeChunkProcessor::new(ProcessorOptions::default());
        let updates = processor.process_chunk(&json!({
            "type": "APPROVAL_REQUEST",
            "approvalRequestId": "r1",
            "command": "reboot",
            "approvalType": "USER"
        }));

        assert!(matches!(
            updates.as_slice(),
            [ChatUpdate::EscalatedApproval { request_id, .. }] if request_id == "r1"
        ));
        assert!(processor.segments().is_empty());
        assert!(processor.escalated_approvals().contains_key("r1"));

        let updates = processor.process_chunk(&json!({
            "type": "APPROVAL_RESULT",
            "approvalRequestId": "r1",
            "approved": true
        }));
        assert!(matches!(
            updates.first(),
            Some(ChatUpdate::EscalatedApprovalResolved { approved: true, approval, .. })
                if approval.command == "reboot"
        ));

        let segments = processor.segments();
        assert_eq!(segments.len(), 1);
        let Segment::ApprovalRequest { data, status, .. } = &segments[0] else {
            panic!("expected approval segment");
        };
        assert_eq!(data.command, "reboot");
        assert_eq!(data.approval_type, "USER");
        assert_eq!(*status, ApprovalStatus::Approved);
        assert!(processor.escalated_approvals().is_empty());
        assert!(!processor.accumulator().has_pending_approvals());
    }

    #[test]
    fn displayed_approval_updates_in_place() {
        let mut processor = RealtimeChunkProcessor::new(ProcessorOptions::default());
        feed(
            &mut processor,
            &[
                json!({
                    "type": "APPROVAL_REQUEST",
                    "approvalRequestId": "r2",
                    "command": "ls",
                    "approvalType": "CLIENT"
                }),
                json!({ "type": "APPROVAL_RESULT", "approvalRequestId": "r2", "approved": false }),
            ],
        );

        let segments = processor.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].approval_status(), Some(ApprovalStatus::Rejected));
    }

    #[test]
    fn known_status_applies_to_displayed_request() {
        let mut options = ProcessorOptions::default();
        options
            .approval_statuses
            .insert("r3".to_string(), ApprovalStatus::Approved);
        let mut processor = RealtimeChunkProcessor::new(options);
        processor.process_chunk(&json!({
            "type": "APPROVAL_REQUEST",
            "approvalRequestId": "r3",
            "approvalType": "CLIENT"
        }));

        assert_eq!(
            processor.segments()[0].approval_status(),
            Some(ApprovalStatus::Approved)
        );
    }

    #[test]
    fn unmatched_result_is_rendered_best_effort() {
        let mut processor = RealtimeChunkProcessor::new(ProcessorOptions::default());
        processor.process_chunk(&json!({
            "type": "APPROVAL_RESULT",
            "approvalRequestId": "ghost",
            "approved": true
        }));

        assert_eq!(
            processor.segments()[0].approval_request_id(),
            Some("ghost")
        );
    }

    #[test]
    fn error_surfaces_and_abandons_turn() {
        let mut processor = RealtimeChunkProcessor::new(ProcessorOptions::default());
        processor.process_chunk(&json!({ "type": "TEXT", "text": "partial" }));
        let updates = processor.process_chunk(&json!({
            "type": "ERROR",
            "error": "Model failed",
            "details": "{\"error\":{\"message\":\"rate limited\"}}"
        }));

        assert_eq!(
            updates,
            vec![ChatUpdate::Error {
                error: "Model failed".to_string(),
                details: Some("rate limited".to_string()),
            }]
        );
        assert!(processor.segments().is_empty());
    }

    #[test]
    fn message_request_leaves_segments_alone() {
        let mut processor = RealtimeChunkProcessor::new(ProcessorOptions::default());
        processor.process_chunk(&json!({ "type": "TEXT", "text": "answer" }));
        let updates = processor.process_chunk(&json!({ "type": "MESSAGE_REQUEST", "text": "hi" }));

        assert_eq!(
            updates,
            vec![ChatUpdate::UserMessage {
                text: "hi".to_string()
            }]
        );
        assert_eq!(processor.segments(), vec![Segment::text("answer")]);
    }

    #[test]
    fn seeded_turn_continues_without_duplicates() {
        let mut executing = IndexMap::new();
        let running = ToolExecutionData::executing("fs", "scan", None);
        executing.insert(running.key(), (&running).into());
        let mut escalated = IndexMap::new();
        escalated.insert(
            "r9".to_string(),
            PendingApproval::new("wipe", None, "USER"),
        );

        let mut processor = RealtimeChunkProcessor::new(ProcessorOptions::default());
        let announced = processor.seed(
            Some(IncompleteState {
                existing_segments: vec![Segment::text("Scanning"), Segment::tool(running)],
                pending_approvals: None,
                executing_tools: Some(executing),
            }),
            escalated,
        );
        assert_eq!(announced.len(), 1);

        processor.process_chunk(&json!({
            "type": "EXECUTED_TOOL",
            "integratedToolType": "fs",
            "toolFunction": "scan",
            "result": "clean",
            "success": true
        }));
        let segments = processor.segments();
        assert_eq!(segments.len(), 2);
        assert!(matches!(
            &segments[1],
            Segment::ToolExecution { data } if data.phase == ToolPhase::Executed
        ));

        processor.reset();
        assert!(processor.segments().is_empty());
        assert!(processor.escalated_approvals().is_empty());
    }

    #[test]
    fn updates_serialize_with_kind_tag() {
        let update = ChatUpdate::UserMessage {
            text: "hi".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&update).expect("serialize"),
            json!({ "kind": "user_message", "text": "hi" })
        );
    }
}
