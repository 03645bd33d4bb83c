//! Ordered accumulation of the segments that make up one assistant turn.

use indexmap::IndexMap;

use crate::action::Action;
use crate::types::{
    AccumulatorState, ApprovalHandlers, ApprovalRequestData, ApprovalStatus, ExecutingTool,
    IncompleteState, PendingApproval, Segment, ToolExecutionData, ToolPhase,
};

/// Result of resolving an approval.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    /// The rendered segment, already appended to the accumulator.
    pub segment: Segment,
    /// The pending entry consumed by the result, if one was tracked.
    pub pending: Option<PendingApproval>,
}

/// Folds actions into renderable segments.
///
/// Segments are only ever appended, mutated in place or cleared wholesale. Text runs
/// coalesce into the open text segment until any other segment is pushed.
#[derive(Debug, Clone, Default)]
pub struct SegmentAccumulator {
    segments: Vec<Segment>,
    open_text: Option<usize>,
    pending_approvals: IndexMap<String, PendingApproval>,
    executing_tools: IndexMap<String, ExecutingTool>,
    handlers: ApprovalHandlers,
}

impl SegmentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: ApprovalHandlers) -> Self {
        Self {
            handlers,
            ..Self::default()
        }
    }

    pub fn set_handlers(&mut self, handlers: ApprovalHandlers) {
        self.handlers = handlers;
    }

    pub fn handlers(&self) -> &ApprovalHandlers {
        &self.handlers
    }

    /// Seeds the accumulator with a turn left open by a previous session.
    pub fn initialize_with_state(&mut self, state: IncompleteState) {
        self.segments = state.existing_segments;
        self.open_text = match self.segments.last() {
            Some(Segment::Text { .. }) => Some(self.segments.len() - 1),
            _ => None,
        };
        if let Some(pending) = state.pending_approvals {
            self.pending_approvals = pending;
        }
        if let Some(executing) = state.executing_tools {
            self.executing_tools = executing;
        }
    }

    /// Returns a fresh copy of the segment list.
    pub fn segments(&self) -> Vec<Segment> {
        self.segments.clone()
    }

    pub fn state(&self) -> AccumulatorState {
        AccumulatorState {
            segments: self.segments(),
            current_text_buffer: self.current_text_buffer().to_string(),
            pending_approvals: self.pending_approvals.clone(),
            executing_tools: self.executing_tools.clone(),
        }
    }

    /// Text of the open trailing text segment, or empty.
    pub fn current_text_buffer(&self) -> &str {
        match self.open_text.and_then(|index| self.segments.get(index)) {
            Some(Segment::Text { text }) => text,
            _ => "",
        }
    }

    pub fn pending_approvals(&self) -> &IndexMap<String, PendingApproval> {
        &self.pending_approvals
    }

    pub fn executing_tools(&self) -> &IndexMap<String, ExecutingTool> {
        &self.executing_tools
    }

    pub fn has_pending_approvals(&self) -> bool {
        !self.pending_approvals.is_empty()
    }

    pub fn has_content(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn push(&mut self, segment: Segment) {
        self.open_text = None;
        self.segments.push(segment);
    }

    pub fn append_text(&mut self, text: &str) -> Vec<Segment> {
        if let Some(index) = self.open_text
            && let Some(Segment::Text { text: open }) = self.segments.get_mut(index)
        {
            open.push_str(text);
        } else {
            self.push(Segment::text(text));
            self.open_text = Some(self.segments.len() - 1);
        }
        self.segments()
    }

    /// Adds a tool segment, merging an `EXECUTED_TOOL` into its `EXECUTING_TOOL` counterpart.
    pub fn add_tool_execution(&mut self, mut data: ToolExecutionData) -> Vec<Segment> {
        let key = data.key();
        match data.phase {
            ToolPhase::Executing => {
                self.executing_tools.insert(key, ExecutingTool::from(&data));
                self.push(Segment::tool(data));
            }
            ToolPhase::Executed => {
                let tracked = self.executing_tools.shift_remove(&key);
                let position = self.segments.iter().position(|segment| {
                    matches!(
                        segment,
                        Segment::ToolExecution { data: running }
                            if running.phase == ToolPhase::Executing && running.same_tool(&data)
                    )
                });

                if data.parameters.is_none() {
                    data.parameters = tracked.and_then(|tool| tool.parameters).or_else(|| {
                        position.and_then(|index| match &self.segments[index] {
                            Segment::ToolExecution { data } => data.parameters.clone(),
                            _ => None,
                        })
                    });
                }

                match position {
                    Some(index) => self.segments[index] = Segment::tool(data),
                    None => self.push(Segment::tool(data)),
                }
            }
        }
        self.segments()
    }

    /// Records an approval without rendering it.
    pub fn track_approval_request(&mut self, request_id: impl Into<String>, data: PendingApproval) {
        self.pending_approvals.insert(request_id.into(), data);
    }

    /// Renders an approval segment directly, carrying the configured handlers.
    pub fn add_approval_request(
        &mut self,
        request_id: &str,
        command: &str,
        explanation: Option<String>,
        approval_type: &str,
        status: ApprovalStatus,
    ) -> Vec<Segment> {
        let segment = self.approval_segment(
            request_id,
            PendingApproval::new(command, explanation, approval_type),
            status,
        );
        self.push(segment);
        self.segments()
    }

    /// Renders the outcome of an approval and consumes its pending entry, if any.
    ///
    /// A result without a tracked request still renders, built from what the result carries.
    pub fn process_approval_result(
        &mut self,
        request_id: &str,
        approved: bool,
        approval_type: &str,
    ) -> ApprovalOutcome {
        let pending = self.pending_approvals.shift_remove(request_id);
        let data = pending
            .clone()
            .unwrap_or_else(|| PendingApproval::new("", None, approval_type));
        let segment =
            self.approval_segment(request_id, data, ApprovalStatus::from_approved(approved));
        self.push(segment.clone());
        ApprovalOutcome { segment, pending }
    }

    /// Moves an escalated approval into the accumulator and renders its resolution.
    pub fn resolve_escalated(
        &mut self,
        request_id: &str,
        escalated: PendingApproval,
        approved: bool,
    ) -> ApprovalOutcome {
        let approval_type = escalated.approval_type.clone();
        self.track_approval_request(request_id, escalated);
        self.process_approval_result(request_id, approved, &approval_type)
    }

    pub fn update_approval_status(
        &mut self,
        request_id: &str,
        status: ApprovalStatus,
    ) -> Vec<Segment> {
        for segment in &mut self.segments {
            if let Segment::ApprovalRequest {
                data,
                status: current,
                ..
            } = segment
                && data.request_id == request_id
            {
                *current = status;
            }
        }
        self.segments()
    }

    /// True when an approval segment for `request_id` has been rendered.
    pub fn has_rendered_approval(&self, request_id: &str) -> bool {
        self.segments
            .iter()
            .any(|segment| segment.approval_request_id() == Some(request_id))
    }

    pub fn remove_pending_approval(&mut self, request_id: &str) -> Option<PendingApproval> {
        self.pending_approvals.shift_remove(request_id)
    }

    /// Materializes every pending approval as a `pending` segment; the entries stay tracked.
    pub fn flush_pending_approvals(&self) -> Vec<Segment> {
        self.pending_approvals
            .iter()
            .map(|(request_id, approval)| {
                self.approval_segment(request_id, approval.clone(), ApprovalStatus::Pending)
            })
            .collect()
    }

    /// Applies a text or tool action. Returns `false` for every other action.
    pub fn apply_content(&mut self, action: &Action) -> bool {
        match action {
            Action::Text { text } => {
                self.append_text(text);
                true
            }
            Action::ToolExecution { data } => {
                self.add_tool_execution(data.clone());
                true
            }
            _ => false,
        }
    }

    /// Clears the rendered turn but keeps pending approvals and executing tools.
    pub fn reset_segments(&mut self) {
        self.segments.clear();
        self.open_text = None;
    }

    pub fn reset(&mut self) {
        self.reset_segments();
        self.pending_approvals.clear();
        self.executing_tools.clear();
    }

    fn approval_segment(
        &self,
        request_id: &str,
        approval: PendingApproval,
        status: ApprovalStatus,
    ) -> Segment {
        Segment::ApprovalRequest {
            data: ApprovalRequestData {
                command: approval.command,
                explanation: approval.explanation,
                request_id: request_id.to_string(),
                approval_type: approval.approval_type,
            },
            status,
            handlers: self.handlers.clone(),
        }
    }
}
