//! Recovery of a turn left open at the tail of a reconciled transcript.

use indexmap::IndexMap;

use crate::reconcile::PENDING_APPROVALS_PREFIX;
use crate::types::{
    ApprovalStatus, CLIENT_APPROVAL_TYPE, ExecutingTool, IncompleteState, MessageContent,
    MessageRole, PendingApproval, ProcessedMessage, Segment, ToolPhase,
};

/// Returns the open state of `last`, or `None` when nothing needs resuming.
///
/// Only an assistant message with segment content is considered. Tools still executing and
/// approvals still pending are rebuilt so a live accumulator can continue the same turn.
pub fn extract_incomplete_state(last: Option<&ProcessedMessage>) -> Option<IncompleteState> {
    let message = last?;
    if message.role != MessageRole::Assistant {
        return None;
    }
    let MessageContent::Segments(segments) = &message.content else {
        return None;
    };

    let mut executing_tools = IndexMap::new();
    let mut pending_approvals = IndexMap::new();
    for segment in segments {
        match segment {
            Segment::ToolExecution { data } if data.phase == ToolPhase::Executing => {
                executing_tools.insert(data.key(), ExecutingTool::from(data));
            }
            Segment::ApprovalRequest { data, status, .. }
                if *status == ApprovalStatus::Pending && !data.request_id.is_empty() =>
            {
                let approval_type = if data.approval_type.is_empty() {
                    CLIENT_APPROVAL_TYPE
                } else {
                    data.approval_type.as_str()
                };
                pending_approvals.insert(
                    data.request_id.clone(),
                    PendingApproval::new(
                        data.command.clone(),
                        data.explanation.clone(),
                        approval_type,
                    ),
                );
            }
            _ => {}
        }
    }

    if executing_tools.is_empty() && pending_approvals.is_empty() {
        return None;
    }

    Some(IncompleteState {
        existing_segments: segments.clone(),
        pending_approvals: (!pending_approvals.is_empty()).then_some(pending_approvals),
        executing_tools: (!executing_tools.is_empty()).then_some(executing_tools),
    })
}

/// Returns the open state at the tail of a reconciled transcript.
///
/// Reconciliation moves approvals still awaiting a result into a trailing synthetic message.
/// When that message directly follows an assistant turn, both are read as one turn so the
/// resumed segments keep the text and tools that came before the approval.
pub fn extract_resume_state(messages: &[ProcessedMessage]) -> Option<IncompleteState> {
    let [.., turn, pending] = messages else {
        return extract_incomplete_state(messages.last());
    };
    let joined = match (&turn.content, &pending.content) {
        (MessageContent::Segments(head), MessageContent::Segments(tail))
            if pending.id.starts_with(PENDING_APPROVALS_PREFIX)
                && turn.role == MessageRole::Assistant =>
        {
            ProcessedMessage {
                content: MessageContent::Segments(head.iter().chain(tail).cloned().collect()),
                ..turn.clone()
            }
        }
        _ => return extract_incomplete_state(Some(pending)),
    };
    extract_incomplete_state(Some(&joined))
}
