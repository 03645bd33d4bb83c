//! Live wiring of one dialog: subscription deliveries flow through catch-up buffering into
//! the chunk processor, and the resulting updates are published for the UI.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dialog_core::{
    ApprovalHandlers, ApprovalStatus, BufferedChunk, ChatType, ChatUpdate, ChunkCatchup,
    IncompleteState, PendingApproval, ProcessorOptions, RealtimeChunkProcessor, Segment, Topic,
};
use dialog_transport::DialogListener;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::catchup::{ChunkSource, catch_up};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LiveCore {
    processor: RealtimeChunkProcessor,
    catchup: ChunkCatchup,
    /// Resume point recorded when the transport announced a reconnect.
    resume: Option<Option<i64>>,
}

struct LiveState {
    dialog_id: String,
    core: Mutex<LiveCore>,
    updates: mpsc::UnboundedSender<ChatUpdate>,
    received: watch::Sender<usize>,
    resync: Mutex<Option<mpsc::UnboundedSender<Option<i64>>>>,
}

/// The processing side of a dialog subscription.
///
/// Clones share state; a clone is what gets installed as the subscription listener.
#[derive(Clone)]
pub struct LiveDialog {
    state: Arc<LiveState>,
}

impl LiveDialog {
    pub fn new(
        dialog_id: impl Into<String>,
        options: ProcessorOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ChatUpdate>) {
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (received, _) = watch::channel(0);
        let dialog = Self {
            state: Arc::new(LiveState {
                dialog_id: dialog_id.into(),
                core: Mutex::new(LiveCore {
                    processor: RealtimeChunkProcessor::new(options),
                    catchup: ChunkCatchup::new(),
                    resume: None,
                }),
                updates,
                received,
                resync: Mutex::new(None),
            }),
        };
        (dialog, updates_rx)
    }

    pub fn dialog_id(&self) -> &str {
        &self.state.dialog_id
    }

    /// Continues a turn left open in the transcript and re-announces escalated approvals.
    pub fn seed(
        &self,
        incomplete: Option<IncompleteState>,
        escalated: IndexMap<String, PendingApproval>,
    ) {
        let mut core = lock(&self.state.core);
        let updates = core.processor.seed(incomplete, escalated);
        self.publish(updates);
    }

    pub fn set_handlers(&self, handlers: ApprovalHandlers) {
        lock(&self.state.core).processor.set_handlers(handlers);
    }

    /// Holds back live chunks until [`LiveDialog::finish_catch_up`] or
    /// [`LiveDialog::abort_catch_up`].
    pub fn begin_catch_up(&self) {
        lock(&self.state.core).catchup.start_buffering();
    }

    pub fn finish_catch_up(&self, fetched: Vec<BufferedChunk>) {
        let mut core = lock(&self.state.core);
        let ready = core.catchup.complete(fetched);
        self.process(&mut core, ready);
    }

    pub fn abort_catch_up(&self) {
        let mut core = lock(&self.state.core);
        let ready = core.catchup.abort();
        self.process(&mut core, ready);
    }

    /// Fetches missed chunks and merges them with whatever arrived live meanwhile.
    pub async fn run_catch_up(
        &self,
        source: &dyn ChunkSource,
        chat_types: &[ChatType],
        from_sequence: Option<i64>,
    ) {
        let fetched = catch_up(source, self.dialog_id(), chat_types, from_sequence).await;
        self.finish_catch_up(fetched);
    }

    /// Runs a catch-up from the last seen sequence id after every reconnect.
    ///
    /// Without a running resync task, reconnects simply release the buffered chunks.
    pub fn spawn_resync(
        &self,
        source: Arc<dyn ChunkSource>,
        chat_types: Vec<ChatType>,
    ) -> JoinHandle<()> {
        let (resync_tx, mut resync_rx) = mpsc::unbounded_channel();
        *lock(&self.state.resync) = Some(resync_tx);
        let dialog = self.clone();
        tokio::spawn(async move {
            while let Some(from_sequence) = resync_rx.recv().await {
                tracing::info!(
                    dialog_id = %dialog.dialog_id(),
                    from_sequence = ?from_sequence,
                    "resyncing dialog after reconnect"
                );
                dialog
                    .run_catch_up(source.as_ref(), &chat_types, from_sequence)
                    .await;
            }
        })
    }

    pub fn last_sequence_id(&self) -> Option<i64> {
        lock(&self.state.core).catchup.last_sequence_id()
    }

    pub fn is_catching_up(&self) -> bool {
        lock(&self.state.core).catchup.is_buffering()
    }

    pub fn segments(&self) -> Vec<Segment> {
        lock(&self.state.core).processor.segments()
    }

    pub fn escalated_approvals(&self) -> IndexMap<String, PendingApproval> {
        lock(&self.state.core).processor.escalated_approvals().clone()
    }

    /// Applies a status decided locally, e.g. after the user clicked approve.
    pub fn update_approval_status(&self, request_id: &str, status: ApprovalStatus) {
        let mut core = lock(&self.state.core);
        let segments = core.processor.update_approval_status(request_id, status);
        self.publish(vec![ChatUpdate::Segments { segments }]);
    }

    /// Live chunks received so far, buffered ones included.
    pub fn received_chunks(&self) -> watch::Receiver<usize> {
        self.state.received.subscribe()
    }

    pub fn reset(&self) {
        let mut core = lock(&self.state.core);
        core.processor.reset();
        core.catchup.reset();
        core.resume = None;
    }

    fn process(&self, core: &mut LiveCore, ready: Vec<BufferedChunk>) {
        for item in ready {
            let updates = core.processor.process_chunk(&item.chunk);
            self.publish(updates);
        }
    }

    fn publish(&self, updates: Vec<ChatUpdate>) {
        for update in updates {
            if self.state.updates.send(update).is_err() {
                tracing::debug!(dialog_id = %self.state.dialog_id, "update receiver dropped");
                return;
            }
        }
    }
}

impl DialogListener for LiveDialog {
    fn on_event(&self, chunk: Value, topic: Topic) {
        let mut core = lock(&self.state.core);
        let ready = core.catchup.accept(chunk, topic);
        self.process(&mut core, ready);
        drop(core);
        self.state.received.send_modify(|count| *count += 1);
    }

    fn on_connect(&self) {
        let resume = lock(&self.state.core).resume.take();
        let Some(from_sequence) = resume else {
            return;
        };

        let requested = lock(&self.state.resync)
            .as_ref()
            .is_some_and(|resync| resync.send(from_sequence).is_ok());
        if !requested {
            self.abort_catch_up();
        }
    }

    fn on_disconnect(&self) {
        tracing::info!(dialog_id = %self.state.dialog_id, "dialog transport disconnected");
    }

    fn on_subscribed(&self) {
        tracing::debug!(dialog_id = %self.state.dialog_id, "dialog subscribed");
    }

    fn on_before_reconnect(&self) {
        let mut core = lock(&self.state.core);
        if core.resume.is_none() {
            let from_sequence = core.catchup.rearm();
            core.resume = Some(from_sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dialog_core::{
        ChatType, HistoricalMessage, OwnerType, ReconcileOptions, ToolPhase,
        extract_resume_state, reconcile,
    };
    use dialog_transport::{
        ClientOptions, ConnectionRegistry, DialogSubscription, MemoryBroker,
        MemoryTransportFactory, SubscriptionOptions, subject_for,
    };
    use serde_json::json;

    use super::*;
    use crate::catchup::RecordedChunks;

    const URL: &str = "memory://chat";

    fn drain(updates: &mut mpsc::UnboundedReceiver<ChatUpdate>) -> Vec<ChatUpdate> {
        std::iter::from_fn(|| updates.try_recv().ok()).collect()
    }

    fn texts(updates: &[ChatUpdate]) -> Vec<String> {
        updates
            .iter()
            .filter_map(|update| match update {
                ChatUpdate::Segments { segments } => match segments.last() {
                    Some(Segment::Text { text }) => Some(text.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn chunks_held_during_catch_up_merge_with_fetched_history() {
        let (live, mut updates) = LiveDialog::new("d", ProcessorOptions::default());
        live.begin_catch_up();

        live.on_event(json!({"type": "TEXT", "text": " world", "sequenceId": 3}), Topic::Message);
        assert!(drain(&mut updates).is_empty());
        assert!(live.is_catching_up());

        live.finish_catch_up(vec![
            BufferedChunk::new(
                json!({"type": "MESSAGE_START", "sequenceId": 1}),
                Topic::Message,
            ),
            BufferedChunk::new(
                json!({"type": "TEXT", "text": "hello", "sequenceId": 2}),
                Topic::Message,
            ),
            BufferedChunk::new(
                json!({"type": "TEXT", "text": " world", "sequenceId": 3}),
                Topic::Message,
            ),
        ]);

        let seen = drain(&mut updates);
        assert_eq!(seen.first(), Some(&ChatUpdate::StreamStarted));
        assert_eq!(texts(&seen), ["hello", "hello world"]);
        assert_eq!(live.last_sequence_id(), Some(3));
        assert_eq!(*live.received_chunks().borrow(), 1);
    }

    #[test]
    fn seeded_turn_continues_from_transcript() {
        let history = vec![
            HistoricalMessage::new(
                "u1",
                OwnerType::Client,
                "t1",
                vec![json!({"type": "TEXT", "text": "list files"})],
            ),
            HistoricalMessage::new(
                "a1",
                OwnerType::Assistant,
                "t2",
                vec![
                    json!({"type": "TEXT", "text": "Let me check"}),
                    json!({"type": "EXECUTING_TOOL", "integratedToolType": "fleet", "toolFunction": "ls"}),
                ],
            ),
        ];
        let outcome = reconcile(&history, &ReconcileOptions::default());
        let incomplete = extract_resume_state(&outcome.messages);
        assert!(incomplete.is_some());

        let (live, mut updates) = LiveDialog::new("d", ProcessorOptions::default());
        live.seed(incomplete, outcome.escalated_approvals);
        live.on_event(
            json!({"type": "EXECUTED_TOOL", "integratedToolType": "fleet", "toolFunction": "ls", "result": "a.txt"}),
            Topic::Message,
        );

        let seen = drain(&mut updates);
        let [ChatUpdate::Segments { segments }] = seen.as_slice() else {
            panic!("expected one segments update, got {seen:?}");
        };
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], Segment::text("Let me check"));
        assert!(matches!(
            &segments[1],
            Segment::ToolExecution { data } if data.phase == ToolPhase::Executed
        ));
    }

    #[test]
    fn reconnect_without_resync_task_releases_buffer() {
        let (live, mut updates) = LiveDialog::new("d", ProcessorOptions::default());
        live.on_event(json!({"type": "TEXT", "text": "a", "sequenceId": 1}), Topic::Message);
        drain(&mut updates);

        live.on_disconnect();
        live.on_before_reconnect();
        live.on_event(json!({"type": "TEXT", "text": "b", "sequenceId": 2}), Topic::Message);
        assert!(drain(&mut updates).is_empty());

        live.on_connect();
        assert_eq!(texts(&drain(&mut updates)), ["ab"]);
        assert!(!live.is_catching_up());
    }

    #[test]
    fn locally_decided_status_is_published() {
        let (live, mut updates) = LiveDialog::new("d", ProcessorOptions::default());
        live.on_event(
            json!({"type": "APPROVAL_REQUEST", "approvalRequestId": "r1", "command": "ls", "approvalType": "CLIENT"}),
            Topic::Message,
        );
        drain(&mut updates);

        live.update_approval_status("r1", ApprovalStatus::Approved);
        let seen = drain(&mut updates);
        assert!(matches!(
            seen.as_slice(),
            [ChatUpdate::Segments { segments }]
                if segments[0].approval_status() == Some(ApprovalStatus::Approved)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_deliveries_and_resync_reach_updates() {
        let broker = MemoryBroker::new();
        let factory = Arc::new(MemoryTransportFactory::new(broker.clone()));
        let registry = ConnectionRegistry::with_grace(
            factory.clone(),
            ClientOptions::default(),
            Duration::from_millis(100),
        );

        let (live, mut updates) = LiveDialog::new("d-1", ProcessorOptions::default());
        let mut missed = RecordedChunks::new();
        missed.record(ChatType::Client, json!({"type": "TEXT", "text": "b", "sequenceId": 2}));
        let resync = live.spawn_resync(Arc::new(missed), vec![ChatType::Client]);

        let subscription = DialogSubscription::start(
            &registry,
            SubscriptionOptions::new(URL).with_dialog("d-1"),
            live.clone(),
        );
        let mut status = subscription.watch_status();
        status
            .wait_for(|status| status.is_subscribed)
            .await
            .expect("subscribed");

        let subject = subject_for("d-1", Topic::Message);
        broker.publish(&subject, br#"{"type":"MESSAGE_START","sequenceId":0}"#.to_vec());
        broker.publish(&subject, br#"{"type":"TEXT","text":"a","sequenceId":1}"#.to_vec());
        let mut received = live.received_chunks();
        received.wait_for(|count| *count >= 2).await.expect("received");

        let client = factory.last_client().expect("client");
        client.simulate_disconnect();
        client.simulate_reconnect();
        status
            .wait_for(|status| status.reconnection_count == 1 && status.is_connected)
            .await
            .expect("reconnected");

        for _ in 0..10 {
            if !live.is_catching_up() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(texts(&drain(&mut updates)), ["a", "ab"]);

        subscription.shutdown().await;
        resync.abort();
    }
}
