//! Offline replay: rebuild a transcript, then push recorded chunks through the in-memory
//! transport into a processor seeded from that transcript.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dialog_core::{
    ApprovalHandlers, ChatType, ChatUpdate, HistoricalMessage, ProcessedMessage,
    extract_resume_state, reconcile,
};
use dialog_transport::{
    ConnectionRegistry, DialogSubscription, MemoryBroker, MemoryTransportFactory,
    SubscriptionOptions, subject_for,
};
use serde::Serialize;
use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};

use crate::catchup::RecordedChunks;
use crate::live::LiveDialog;
use crate::settings::Settings;

const REPLAY_URL: &str = "memory://replay";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReplayError {
    #[snafu(display("failed to read {path:?} on `{stage}`: {source}"))]
    ReadFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("transcript {path:?} is not a message list on `{stage}`: {source}"))]
    ParseTranscript {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("chunk on line {line} of {path:?} is not JSON on `{stage}`: {source}"))]
    ParseChunk {
        stage: &'static str,
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode chunk on `{stage}`: {source}"))]
    EncodeChunk {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode replay report on `{stage}`: {source}"))]
    EncodeReport {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("replay timed out on `{stage}`"))]
    TimedOut {
        stage: &'static str,
        source: tokio::time::error::Elapsed,
    },
    #[snafu(display("dialog subscription closed on `{stage}`"))]
    SubscriptionClosed { stage: &'static str },
}

pub type ReplayResult<T> = Result<T, ReplayError>;

pub struct ReplayInput {
    pub dialog_id: String,
    pub history: Vec<HistoricalMessage>,
    pub chunks: Vec<Value>,
    /// Chunks with a sequence id at or below this are served by catch-up instead of live.
    pub live_from: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub messages: Vec<ProcessedMessage>,
    pub updates: Vec<ChatUpdate>,
}

impl ReplayReport {
    pub fn to_json_pretty(&self) -> ReplayResult<String> {
        serde_json::to_string_pretty(self).context(EncodeReportSnafu {
            stage: "encode-report",
        })
    }
}

pub fn load_transcript(path: &Path) -> ReplayResult<Vec<HistoricalMessage>> {
    let content = std::fs::read_to_string(path).context(ReadFileSnafu {
        stage: "read-transcript",
        path: path.to_path_buf(),
    })?;
    serde_json::from_str(&content).context(ParseTranscriptSnafu {
        stage: "parse-transcript",
        path: path.to_path_buf(),
    })
}

pub fn load_chunks(path: &Path) -> ReplayResult<Vec<Value>> {
    let content = std::fs::read_to_string(path).context(ReadFileSnafu {
        stage: "read-chunks",
        path: path.to_path_buf(),
    })?;
    parse_chunks(&content, path)
}

/// One JSON chunk per line; blank lines are skipped.
pub fn parse_chunks(content: &str, path: &Path) -> ReplayResult<Vec<Value>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).context(ParseChunkSnafu {
                stage: "parse-chunk-line",
                path: path.to_path_buf(),
                line: index + 1,
            })
        })
        .collect()
}

fn chat_type_of(chunk: &Value) -> ChatType {
    chunk
        .get("chatType")
        .cloned()
        .and_then(|chat_type| serde_json::from_value(chat_type).ok())
        .unwrap_or(ChatType::Client)
}

fn sequence_of(chunk: &Value) -> Option<i64> {
    chunk.get("sequenceId").and_then(Value::as_i64)
}

pub async fn replay(settings: &Settings, input: ReplayInput) -> ReplayResult<ReplayReport> {
    let options = settings.reconcile_options(None, ApprovalHandlers::default());
    let outcome = reconcile(&input.history, &options);
    tracing::info!(
        dialog_id = %input.dialog_id,
        history = input.history.len(),
        messages = outcome.messages.len(),
        "reconciled transcript"
    );
    if input.chunks.is_empty() {
        return Ok(ReplayReport {
            messages: outcome.messages,
            updates: Vec::new(),
        });
    }

    let (live, mut updates) = LiveDialog::new(
        input.dialog_id.clone(),
        settings.processor_options(ApprovalHandlers::default()),
    );
    live.seed(
        extract_resume_state(&outcome.messages),
        outcome.escalated_approvals.clone(),
    );

    let mut recorded = RecordedChunks::new();
    let mut published = Vec::new();
    for chunk in input.chunks {
        let chat_type = chat_type_of(&chunk);
        if !settings.chat_types.contains(&chat_type) {
            tracing::warn!(
                chat_type = chat_type.as_str(),
                "skipping chunk of unconfigured chat type"
            );
            continue;
        }
        let caught_up = input
            .live_from
            .is_some_and(|live_from| sequence_of(&chunk).is_some_and(|seq| seq <= live_from));
        if caught_up {
            recorded.record(chat_type, chunk);
        } else {
            published.push((chat_type, chunk));
        }
    }

    let broker = MemoryBroker::new();
    let factory = Arc::new(MemoryTransportFactory::new(broker.clone()));
    let registry = ConnectionRegistry::with_grace(
        factory,
        settings.client.clone(),
        settings.shared_close_delay(),
    );
    if !recorded.is_empty() {
        live.begin_catch_up();
    }
    let subscription = DialogSubscription::start(
        &registry,
        SubscriptionOptions::new(REPLAY_URL)
            .with_dialog(input.dialog_id.clone())
            .with_topics(settings.topics()),
        live.clone(),
    );

    let wait = settings.client.connect_timeout();
    let mut status = subscription.watch_status();
    let subscribed = tokio::time::timeout(wait, status.wait_for(|status| status.is_subscribed))
        .await
        .context(TimedOutSnafu {
            stage: "await-subscription",
        })?
        .is_ok();
    ensure!(
        subscribed,
        SubscriptionClosedSnafu {
            stage: "await-subscription",
        }
    );

    if !recorded.is_empty() {
        live.run_catch_up(&recorded, &settings.chat_types, None).await;
    }

    let total = published.len();
    for (chat_type, chunk) in published {
        let payload = serde_json::to_vec(&chunk).context(EncodeChunkSnafu {
            stage: "encode-live-chunk",
        })?;
        broker.publish(&subject_for(&input.dialog_id, chat_type.topic()), payload);
    }

    let mut received = live.received_chunks();
    let delivered = tokio::time::timeout(wait, received.wait_for(|count| *count >= total))
        .await
        .context(TimedOutSnafu {
            stage: "await-live-delivery",
        })?
        .is_ok();
    ensure!(
        delivered,
        SubscriptionClosedSnafu {
            stage: "await-live-delivery",
        }
    );

    subscription.shutdown().await;
    let updates = std::iter::from_fn(|| updates.try_recv().ok()).collect();
    Ok(ReplayReport {
        messages: outcome.messages,
        updates,
    })
}

#[cfg(test)]
mod tests {
    use dialog_core::{MessageRole, OwnerType, Segment, ToolPhase};
    use serde_json::json;

    use super::*;

    fn open_turn_history() -> Vec<HistoricalMessage> {
        vec![
            HistoricalMessage::new(
                "u1",
                OwnerType::Client,
                "2026-01-01T10:00:00Z",
                vec![json!({"type": "TEXT", "text": "restart nginx"})],
            ),
            HistoricalMessage::new(
                "a1",
                OwnerType::Assistant,
                "2026-01-01T10:00:01Z",
                vec![
                    json!({"type": "MESSAGE_START"}),
                    json!({"type": "EXECUTING_TOOL", "integratedToolType": "fleet", "toolFunction": "restart"}),
                ],
            ),
        ]
    }

    #[test]
    fn chunk_lines_report_their_position() {
        let path = Path::new("chunks.jsonl");
        let chunks = parse_chunks("{\"type\":\"TEXT\"}\n\n{\"type\":\"MESSAGE_END\"}\n", path)
            .expect("chunks");
        assert_eq!(chunks.len(), 2);

        let error = parse_chunks("{}\nnot json\n", path).expect_err("bad line");
        assert!(matches!(error, ReplayError::ParseChunk { line: 2, .. }));
    }

    #[test]
    fn chunk_chat_type_defaults_to_client() {
        assert_eq!(chat_type_of(&json!({"type": "TEXT"})), ChatType::Client);
        assert_eq!(
            chat_type_of(&json!({"chatType": "ADMIN_AI_CHAT"})),
            ChatType::Admin
        );
        assert_eq!(chat_type_of(&json!({"chatType": 7})), ChatType::Client);
    }

    #[tokio::test]
    async fn transcript_only_replay_reconciles() {
        let report = replay(
            &Settings::default(),
            ReplayInput {
                dialog_id: "d".to_string(),
                history: open_turn_history(),
                chunks: Vec::new(),
                live_from: None,
            },
        )
        .await
        .expect("replay");

        assert_eq!(report.messages.len(), 2);
        assert_eq!(report.messages[0].role, MessageRole::User);
        assert!(report.updates.is_empty());
    }

    #[tokio::test]
    async fn live_chunks_continue_the_open_turn() {
        let report = replay(
            &Settings::default(),
            ReplayInput {
                dialog_id: "d".to_string(),
                history: open_turn_history(),
                chunks: vec![
                    json!({"type": "EXECUTED_TOOL", "integratedToolType": "fleet", "toolFunction": "restart", "success": true}),
                    json!({"type": "TEXT", "text": "Done."}),
                    json!({"type": "MESSAGE_END"}),
                ],
                live_from: None,
            },
        )
        .await
        .expect("replay");

        assert_eq!(report.updates.len(), 3);
        assert_eq!(report.updates[2], ChatUpdate::StreamEnded);
        let ChatUpdate::Segments { segments } = &report.updates[1] else {
            panic!("expected segments, got {:?}", report.updates[1]);
        };
        assert!(matches!(
            &segments[0],
            Segment::ToolExecution { data } if data.phase == ToolPhase::Executed
        ));
        assert_eq!(segments[1], Segment::text("Done."));
    }

    #[tokio::test]
    async fn early_chunks_are_served_by_catch_up() {
        let report = replay(
            &Settings::default(),
            ReplayInput {
                dialog_id: "d".to_string(),
                history: Vec::new(),
                chunks: vec![
                    json!({"type": "MESSAGE_START", "sequenceId": 1}),
                    json!({"type": "TEXT", "text": "one", "sequenceId": 2}),
                    json!({"type": "TEXT", "text": " two", "sequenceId": 3}),
                ],
                live_from: Some(2),
            },
        )
        .await
        .expect("replay");

        assert_eq!(report.updates.first(), Some(&ChatUpdate::StreamStarted));
        assert_eq!(
            report.updates.last(),
            Some(&ChatUpdate::Segments {
                segments: vec![Segment::text("one two")]
            })
        );
    }
}
