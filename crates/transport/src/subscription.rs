//! Topic subscriptions for one dialog on top of the shared connection.
//!
//! A single driver task owns all subscription state. Status changes, connect outcomes,
//! dialog switches and decoded deliveries are all handled on that task, so the listener is
//! never invoked concurrently and deliveries of one subject keep transport order.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dialog_core::Topic;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ConnectionStatus, StatusEvent, Subscription, subject_for};
use crate::error::{TransportError, TransportResult};
use crate::registry::{ConnectionRegistry, SharedConnection};

/// Receives decoded chunks and lifecycle notifications.
pub trait DialogListener: Send + Sync {
    fn on_event(&self, _chunk: Value, _topic: Topic) {}
    fn on_connect(&self) {}
    fn on_disconnect(&self) {}
    fn on_subscribed(&self) {}
    fn on_before_reconnect(&self) {}
}

struct NoopListener;

impl DialogListener for NoopListener {}

/// Swappable listener slot read at call time, so replacing the listener takes effect for
/// the running subscription.
pub struct ListenerCell {
    current: ArcSwap<Box<dyn DialogListener>>,
}

impl ListenerCell {
    pub fn new(listener: impl DialogListener + 'static) -> Self {
        Self {
            current: ArcSwap::new(boxed(listener)),
        }
    }

    pub fn set(&self, listener: impl DialogListener + 'static) {
        self.current.store(boxed(listener));
    }

    pub fn clear(&self) {
        self.set(NoopListener);
    }

    fn get(&self) -> Arc<Box<dyn DialogListener>> {
        self.current.load_full()
    }
}

fn boxed(listener: impl DialogListener + 'static) -> Arc<Box<dyn DialogListener>> {
    let listener: Box<dyn DialogListener> = Box::new(listener);
    Arc::new(listener)
}

impl Default for ListenerCell {
    fn default() -> Self {
        Self::new(NoopListener)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub url: String,
    pub dialog_id: Option<String>,
    pub topics: Vec<Topic>,
}

impl SubscriptionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dialog_id: None,
            topics: vec![Topic::Message],
        }
    }

    pub fn with_dialog(mut self, dialog_id: impl Into<String>) -> Self {
        self.dialog_id = Some(dialog_id.into());
        self
    }

    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = topics;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub is_connected: bool,
    pub is_subscribed: bool,
    /// Connects that followed a disconnect.
    pub reconnection_count: u32,
}

enum Command {
    SwitchDialog(Option<String>),
}

struct Delivery {
    generation: u64,
    topic: Topic,
    chunk: Value,
}

/// A live subscription to the topics of one dialog.
///
/// Dropping it stops the driver, which unsubscribes and releases the shared connection.
pub struct DialogSubscription {
    listener: Arc<ListenerCell>,
    status: watch::Receiver<SubscriptionStatus>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl DialogSubscription {
    /// Acquires the shared connection for `options.url` and starts the driver task.
    pub fn start(
        registry: &ConnectionRegistry,
        options: SubscriptionOptions,
        listener: impl DialogListener + 'static,
    ) -> Self {
        let listener = Arc::new(ListenerCell::new(listener));
        let connection = registry.acquire(&options.url);
        let status_events = connection.client().status();
        let (status_tx, status) = watch::channel(SubscriptionStatus::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let attempt = connection.clone();
        tokio::spawn(async move {
            let _ = connect_tx.send(attempt.connect().await);
        });

        let driver = Driver {
            registry: registry.clone(),
            connection,
            listener: listener.clone(),
            status_tx,
            topics: options.topics,
            dialog_id: options.dialog_id,
            generation: 0,
            subscriptions: None,
            delivery_tx,
            connected: false,
            was_disconnected: false,
        };
        let handle = tokio::spawn(driver.run(
            status_events,
            command_rx,
            connect_rx,
            delivery_rx,
            shutdown.clone(),
        ));

        Self {
            listener,
            status,
            commands,
            shutdown,
            driver: Some(handle),
        }
    }

    pub fn set_listener(&self, listener: impl DialogListener + 'static) {
        self.listener.set(listener);
    }

    pub fn listener(&self) -> Arc<ListenerCell> {
        self.listener.clone()
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Moves the subscription to another dialog; `None` unsubscribes from all topics.
    pub fn switch_dialog(&self, dialog_id: Option<String>) {
        let _ = self.commands.send(Command::SwitchDialog(dialog_id));
    }

    /// Stops the driver and waits until the connection has been released.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(driver) = self.driver.take()
            && let Err(error) = driver.await
        {
            tracing::warn!(error = %error, "dialog subscription driver failed");
        }
    }
}

impl Drop for DialogSubscription {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Driver {
    registry: ConnectionRegistry,
    connection: SharedConnection,
    listener: Arc<ListenerCell>,
    status_tx: watch::Sender<SubscriptionStatus>,
    topics: Vec<Topic>,
    dialog_id: Option<String>,
    /// Bumped per subscription set so deliveries from a replaced set are ignored.
    generation: u64,
    subscriptions: Option<CancellationToken>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    connected: bool,
    was_disconnected: bool,
}

impl Driver {
    async fn run(
        mut self,
        mut status_events: broadcast::Receiver<StatusEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connect_rx: mpsc::UnboundedReceiver<TransportResult<()>>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        shutdown: CancellationToken,
    ) {
        let mut status_open = true;
        let mut connect_pending = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = status_events.recv(), if status_open => match event {
                    Ok(event) => self.on_status(event, &shutdown),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            url = %self.connection.url(),
                            skipped,
                            "status events lagged"
                        );
                    }
                    Err(RecvError::Closed) => status_open = false,
                },
                outcome = connect_rx.recv(), if connect_pending => {
                    connect_pending = false;
                    match outcome {
                        Some(Ok(())) => self.on_connected(&shutdown),
                        Some(Err(error)) => self.on_connect_failed(error).await,
                        None => {}
                    }
                }
                Some(command) = commands.recv() => match command {
                    Command::SwitchDialog(dialog_id) => self.switch_dialog(dialog_id, &shutdown),
                },
                Some(delivery) = deliveries.recv() => {
                    if delivery.generation == self.generation && self.subscriptions.is_some() {
                        self.listener.get().on_event(delivery.chunk, delivery.topic);
                    }
                }
            }
        }

        self.unsubscribe_all();
        self.set_connected(false);
        self.registry.release(self.connection.url());
        tracing::debug!(url = %self.connection.url(), "dialog subscription stopped");
    }

    fn on_status(&mut self, event: StatusEvent, shutdown: &CancellationToken) {
        tracing::debug!(
            url = %self.connection.url(),
            status = ?event.status,
            data = ?event.data,
            "transport status"
        );
        if event.status == ConnectionStatus::Connected {
            self.on_connected(shutdown);
        } else if event.status.is_disconnected() {
            self.set_connected(false);
            self.was_disconnected = true;
            let listener = self.listener.get();
            listener.on_disconnect();
            listener.on_before_reconnect();
        }
    }

    fn on_connected(&mut self, shutdown: &CancellationToken) {
        if self.connected {
            return;
        }
        if self.was_disconnected {
            self.was_disconnected = false;
            self.status_tx
                .send_modify(|status| status.reconnection_count += 1);
        }
        self.set_connected(true);
        self.listener.get().on_connect();
        if self.subscriptions.is_none() {
            self.subscribe(shutdown);
        }
    }

    async fn on_connect_failed(&mut self, error: TransportError) {
        tracing::warn!(url = %self.connection.url(), error = %error, "shared connect failed");
        self.set_connected(false);
        self.listener.get().on_disconnect();
        if let Err(error) = self.connection.client().close().await {
            tracing::warn!(
                url = %self.connection.url(),
                error = %error,
                "close after failed connect failed"
            );
        }
    }

    fn switch_dialog(&mut self, dialog_id: Option<String>, shutdown: &CancellationToken) {
        if dialog_id == self.dialog_id && self.subscriptions.is_some() {
            return;
        }
        self.unsubscribe_all();
        self.dialog_id = dialog_id;
        if self.connected {
            self.subscribe(shutdown);
        }
    }

    fn subscribe(&mut self, shutdown: &CancellationToken) {
        let Some(dialog_id) = self.dialog_id.clone() else {
            return;
        };

        self.generation += 1;
        let set = shutdown.child_token();
        let client = self.connection.client().clone();
        for &topic in &self.topics {
            let subject = subject_for(&dialog_id, topic);
            match client.subscribe_bytes(&subject) {
                Ok(subscription) => {
                    tokio::spawn(forward(
                        subscription,
                        topic,
                        self.generation,
                        self.delivery_tx.clone(),
                        set.clone(),
                    ));
                }
                Err(error) => {
                    tracing::warn!(subject = %subject, error = %error, "topic subscribe failed");
                }
            }
        }

        self.subscriptions = Some(set);
        self.status_tx.send_modify(|status| status.is_subscribed = true);
        tracing::info!(dialog_id = %dialog_id, topics = self.topics.len(), "subscribed to dialog");
        self.listener.get().on_subscribed();
    }

    fn unsubscribe_all(&mut self) {
        if let Some(set) = self.subscriptions.take() {
            set.cancel();
        }
        self.status_tx
            .send_modify(|status| status.is_subscribed = false);
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        self.status_tx
            .send_modify(|status| status.is_connected = connected);
    }
}

async fn forward(
    mut subscription: Subscription,
    topic: Topic,
    generation: u64,
    deliveries: mpsc::UnboundedSender<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = subscription.recv() => {
                let Some(bytes) = payload else {
                    break;
                };
                let Some(chunk) = decode(subscription.subject(), &bytes) else {
                    continue;
                };
                if deliveries.send(Delivery { generation, topic, chunk }).is_err() {
                    break;
                }
            }
        }
    }
}

fn decode(subject: &str, bytes: &[u8]) -> Option<Value> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(error) => {
            tracing::debug!(subject = %subject, error = %error, "dropping non-UTF-8 payload");
            return None;
        }
    };
    match serde_json::from_str(text) {
        Ok(chunk) => Some(chunk),
        Err(error) => {
            tracing::debug!(subject = %subject, error = %error, "dropping undecodable payload");
            None
        }
    }
}
