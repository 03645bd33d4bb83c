//! Fetching missed chunks for a dialog before live delivery resumes.

use std::collections::HashMap;

use dialog_core::{BufferedChunk, ChatType};
use dialog_transport::BoxFuture;
use futures::future::join_all;
use serde_json::Value;

use crate::error::SessionResult;

/// Source of persisted stream chunks, typically the dialog API.
pub trait ChunkSource: Send + Sync {
    /// Chunks of one chat type, oldest first. `from_sequence` excludes everything at or
    /// before that sequence id.
    fn fetch<'a>(
        &'a self,
        dialog_id: &'a str,
        chat_type: ChatType,
        from_sequence: Option<i64>,
    ) -> BoxFuture<'a, SessionResult<Vec<Value>>>;
}

/// Fetches every chat type concurrently and tags each chunk with the topic it belongs to.
///
/// A failed fetch is logged and contributes nothing, so one broken chat type does not
/// hold back the others.
pub async fn catch_up(
    source: &dyn ChunkSource,
    dialog_id: &str,
    chat_types: &[ChatType],
    from_sequence: Option<i64>,
) -> Vec<BufferedChunk> {
    let fetches = chat_types.iter().map(|chat_type| async move {
        (
            *chat_type,
            source.fetch(dialog_id, *chat_type, from_sequence).await,
        )
    });

    let mut fetched = Vec::new();
    for (chat_type, outcome) in join_all(fetches).await {
        match outcome {
            Ok(chunks) => {
                tracing::debug!(
                    dialog_id = %dialog_id,
                    chat_type = chat_type.as_str(),
                    count = chunks.len(),
                    "fetched catch-up chunks"
                );
                fetched.extend(
                    chunks
                        .into_iter()
                        .map(|chunk| BufferedChunk::new(chunk, chat_type.topic())),
                );
            }
            Err(error) => {
                tracing::warn!(
                    dialog_id = %dialog_id,
                    chat_type = chat_type.as_str(),
                    error = %error,
                    "catch-up fetch failed"
                );
            }
        }
    }
    fetched
}

/// Chunks recorded per chat type, served back with sequence filtering.
#[derive(Debug, Clone, Default)]
pub struct RecordedChunks {
    chunks: HashMap<ChatType, Vec<Value>>,
}

impl RecordedChunks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, chat_type: ChatType, chunk: Value) {
        self.chunks.entry(chat_type).or_default().push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChunkSource for RecordedChunks {
    fn fetch<'a>(
        &'a self,
        _dialog_id: &'a str,
        chat_type: ChatType,
        from_sequence: Option<i64>,
    ) -> BoxFuture<'a, SessionResult<Vec<Value>>> {
        Box::pin(async move {
            let chunks = self
                .chunks
                .get(&chat_type)
                .map(|chunks| {
                    chunks
                        .iter()
                        .filter(|chunk| {
                            let sequence = chunk.get("sequenceId").and_then(Value::as_i64);
                            match (from_sequence, sequence) {
                                (Some(from), Some(sequence)) => sequence > from,
                                _ => true,
                            }
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(chunks)
        })
    }
}
