#![deny(unsafe_code)]

//! Stream reconciliation for realtime dialog chat.
//!
//! Raw chunks arriving over a dialog subject are parsed into [`Action`]s, folded into
//! renderable [`Segment`]s by the [`SegmentAccumulator`], and persisted transcripts are
//! rebuilt into the same shape by [`reconcile`], so replayed and live turns look identical.

/// Typed actions and wire message kinds.
pub mod action;
/// Live-stream catch-up buffering and merge.
pub mod catchup;
pub mod incomplete;
pub mod parser;
pub mod processor;
pub mod reconcile;
pub mod segments;
/// Shared data model for segments, messages and persisted history.
pub mod types;

pub use action::{Action, MessageKind, ModelMetadata};
pub use catchup::{BufferedChunk, ChunkCatchup};
pub use incomplete::{extract_incomplete_state, extract_resume_state};
pub use parser::{
    error_detail_message, extract_text, is_control_chunk, is_error_chunk, is_metadata_chunk,
    parse_chunk,
};
pub use processor::{ChatUpdate, ProcessorOptions, RealtimeChunkProcessor};
pub use reconcile::{
    PENDING_APPROVALS_PREFIX, ReconcileOptions, ReconcileOutcome, extract_error_messages,
    reconcile, reconcile_with_errors,
};
pub use segments::{ApprovalOutcome, SegmentAccumulator};
pub use types::{
    AccumulatorState, ApprovalCallback, ApprovalHandlers, ApprovalRequestData, ApprovalStatus,
    ChatType, ExecutingTool, HistoricalMessage, IncompleteState, MessageContent, MessageOwner,
    MessageRole, OwnerType, Parameters, PendingApproval, ProcessedMessage, Segment,
    ToolExecutionData, ToolPhase, Topic, tool_key,
};
