use std::collections::HashSet;

use serde_json::Value;

use crate::action::MessageKind;
use crate::types::Topic;

/// A raw chunk together with the topic it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedChunk {
    pub chunk: Value,
    pub topic: Topic,
}

impl BufferedChunk {
    pub fn new(chunk: Value, topic: Topic) -> Self {
        Self { chunk, topic }
    }

    pub fn sequence_id(&self) -> Option<i64> {
        self.chunk.get("sequenceId").and_then(Value::as_i64)
    }

    fn kind(&self) -> Option<&str> {
        self.chunk.get("type").and_then(Value::as_str)
    }

    fn field(&self, key: &str) -> &str {
        self.chunk.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    /// Identity of a chunk within one catch-up batch.
    pub fn dedup_key(&self) -> String {
        let sequence = self
            .sequence_id()
            .map_or_else(|| "na".to_string(), |seq| seq.to_string());
        let request_id = match self.field("approvalRequestId") {
            "" => self.field("approval_request_id"),
            id => id,
        };
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.topic,
            sequence,
            self.kind().unwrap_or("na"),
            self.field("text"),
            self.field("integratedToolType"),
            self.field("toolFunction"),
            request_id,
        )
    }
}

/// Merges fetched history chunks with live chunks received while the fetch was running.
///
/// While buffering, live chunks are held back. Completing the catch-up orders fetched and
/// buffered chunks by sequence id, drops duplicates and keeps only the chunks of the last
/// turn that has not ended yet. Afterwards live chunks pass straight through.
#[derive(Debug, Clone, Default)]
pub struct ChunkCatchup {
    buffer: Vec<BufferedChunk>,
    buffering: bool,
    completed: bool,
    last_sequence_id: Option<i64>,
    processed: HashSet<(Topic, i64)>,
}

impl ChunkCatchup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_buffering(&mut self) {
        self.buffer.clear();
        self.buffering = true;
        self.completed = false;
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn last_sequence_id(&self) -> Option<i64> {
        self.last_sequence_id
    }

    /// Number of distinct `(topic, sequence id)` pairs delivered by catch-up merges.
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Offers a live chunk. Returns the chunks to process now (empty while buffering).
    pub fn accept(&mut self, chunk: Value, topic: Topic) -> Vec<BufferedChunk> {
        let item = BufferedChunk::new(chunk, topic);
        if self.buffering {
            self.buffer.push(item);
            return Vec::new();
        }
        self.observe(&item);
        vec![item]
    }

    /// Finishes catch-up with the fetched chunks and returns everything to process, in order.
    pub fn complete(&mut self, fetched: Vec<BufferedChunk>) -> Vec<BufferedChunk> {
        if fetched.is_empty() {
            return self.abort();
        }

        let mut merged = fetched;
        merged.append(&mut self.buffer);
        merged.sort_by_key(|item| item.sequence_id().unwrap_or(0));

        let mut seen = HashSet::new();
        merged.retain(|item| seen.insert(item.dedup_key()));

        let pending = open_turn(merged);
        for item in &pending {
            if let Some(seq) = item.sequence_id() {
                self.processed.insert((item.topic, seq));
            }
            self.observe(item);
        }

        self.buffering = false;
        self.completed = true;
        tracing::debug!(
            delivered = pending.len(),
            last_sequence_id = ?self.last_sequence_id,
            "catch-up merged"
        );
        pending
    }

    /// Stops buffering without fetched data and releases buffered chunks in sequence order.
    pub fn abort(&mut self) -> Vec<BufferedChunk> {
        let mut buffered = std::mem::take(&mut self.buffer);
        buffered.sort_by_key(|item| item.sequence_id().unwrap_or(0));
        for item in &buffered {
            self.observe(item);
        }
        self.buffering = false;
        self.completed = true;
        buffered
    }

    /// Rearms catch-up after a reconnect and returns the sequence id to resume from.
    pub fn rearm(&mut self) -> Option<i64> {
        self.start_buffering();
        self.last_sequence_id
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn observe(&mut self, item: &BufferedChunk) {
        if let Some(seq) = item.sequence_id() {
            self.last_sequence_id = Some(seq);
        }
    }
}

/// Keeps the chunks from the last unterminated `MESSAGE_START`, or those after the last
/// `MESSAGE_END`, or everything when the batch has no boundary.
fn open_turn(chunks: Vec<BufferedChunk>) -> Vec<BufferedChunk> {
    let last_end = chunks
        .iter()
        .rev()
        .find_map(|item| boundary_sequence(item, MessageKind::MessageEnd));
    let last_start = chunks
        .iter()
        .rev()
        .filter_map(|item| boundary_sequence(item, MessageKind::MessageStart))
        .find(|seq| last_end.is_none_or(|end| *seq > end));

    match (last_start, last_end) {
        (Some(start), _) => chunks
            .into_iter()
            .filter(|item| item.sequence_id().is_some_and(|seq| seq >= start))
            .collect(),
        (None, Some(end)) => chunks
            .into_iter()
            .filter(|item| item.sequence_id().is_some_and(|seq| seq > end))
            .collect(),
        (None, None) => chunks,
    }
}

fn boundary_sequence(item: &BufferedChunk, kind: MessageKind) -> Option<i64> {
    if item.kind() == Some(kind.as_str()) {
        item.sequence_id()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn chunk(seq: i64, kind: &str) -> BufferedChunk {
        BufferedChunk::new(json!({ "type": kind, "sequenceId": seq }), Topic::Message)
    }

    fn text(seq: i64, value: &str) -> BufferedChunk {
        BufferedChunk::new(
            json!({ "type": "TEXT", "sequenceId": seq, "text": value }),
            Topic::Message,
        )
    }

    fn sequences(items: &[BufferedChunk]) -> Vec<Option<i64>> {
        items.iter().map(BufferedChunk::sequence_id).collect()
    }

    #[test]
    fn live_chunks_are_held_until_catch_up_completes() {
        let mut catchup = ChunkCatchup::new();
        catchup.start_buffering();
        assert!(catchup.accept(text(5, "live").chunk, Topic::Message).is_empty());

        let merged = catchup.complete(vec![chunk(3, "MESSAGE_START"), text(4, "old")]);
        assert_eq!(sequences(&merged), [Some(3), Some(4), Some(5)]);
        assert!(catchup.is_complete());
        assert!(!catchup.is_buffering());
        assert_eq!(catchup.last_sequence_id(), Some(5));
        assert_eq!(catchup.processed_count(), 3);

        let passed = catchup.accept(text(6, "next").chunk, Topic::Message);
        assert_eq!(passed.len(), 1);
        assert_eq!(catchup.last_sequence_id(), Some(6));
    }

    #[test]
    fn duplicates_between_fetch_and_buffer_are_dropped() {
        let mut catchup = ChunkCatchup::new();
        catchup.start_buffering();
        catchup.accept(text(2, "b").chunk, Topic::Message);
        catchup.accept(text(1, "a").chunk, Topic::AdminMessage);

        let merged = catchup.complete(vec![text(1, "a"), text(2, "b")]);
        let keys: Vec<_> = merged.iter().map(|item| (item.topic, item.sequence_id())).collect();
        assert_eq!(
            keys,
            [
                (Topic::Message, Some(1)),
                (Topic::AdminMessage, Some(1)),
                (Topic::Message, Some(2)),
            ]
        );
    }

    #[test]
    fn only_the_unfinished_turn_is_replayed() {
        let mut catchup = ChunkCatchup::new();
        catchup.start_buffering();
        let merged = catchup.complete(vec![
            chunk(1, "MESSAGE_START"),
            text(2, "done"),
            chunk(3, "MESSAGE_END"),
            chunk(4, "MESSAGE_START"),
            text(5, "in progress"),
        ]);
        assert_eq!(sequences(&merged), [Some(4), Some(5)]);

        let mut catchup = ChunkCatchup::new();
        catchup.start_buffering();
        let merged = catchup.complete(vec![
            chunk(1, "MESSAGE_START"),
            chunk(2, "MESSAGE_END"),
            text(3, "trailing"),
        ]);
        assert_eq!(sequences(&merged), [Some(3)]);
    }

    #[test]
    fn empty_fetch_flushes_buffer_in_order() {
        let mut catchup = ChunkCatchup::new();
        catchup.start_buffering();
        catchup.accept(text(9, "late").chunk, Topic::Message);
        catchup.accept(text(8, "early").chunk, Topic::Message);

        let flushed = catchup.complete(Vec::new());
        assert_eq!(sequences(&flushed), [Some(8), Some(9)]);
        assert!(catchup.is_complete());
    }

    #[test]
    fn rearm_resumes_from_last_sequence() {
        let mut catchup = ChunkCatchup::new();
        catchup.accept(text(12, "x").chunk, Topic::Message);
        assert_eq!(catchup.rearm(), Some(12));
        assert!(catchup.is_buffering());

        catchup.reset();
        assert_eq!(catchup.last_sequence_id(), None);
        assert!(!catchup.is_buffering());
    }

    #[test]
    fn dedup_key_accepts_either_request_id_spelling() {
        let camel = BufferedChunk::new(
            json!({ "type": "APPROVAL_RESULT", "approvalRequestId": "r1" }),
            Topic::Message,
        );
        let snake = BufferedChunk::new(
            json!({ "type": "APPROVAL_RESULT", "approval_request_id": "r1" }),
            Topic::Message,
        );
        assert_eq!(camel.dedup_key(), snake.dedup_key());
        assert_eq!(camel.dedup_key(), "message:na:APPROVAL_RESULT::::r1");
    }
}
