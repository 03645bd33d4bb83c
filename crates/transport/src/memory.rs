//! In-process transport: a subject-keyed broker and a client factory bound to it.
//!
//! Used by the replay tool and by tests as a stand-in for the websocket transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::client::{
    BoxFuture, ClientOptions, ConnectionStatus, StatusEvent, Subscription, TransportClient,
    TransportFactory,
};
use crate::error::{ConnectFailedSnafu, NotConnectedSnafu, TransportResult};

const STATUS_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Subscribers = Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>;

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    subscribers: HashMap<String, Subscribers>,
}

/// Fan-out of published payloads to every live subscriber of a subject.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `payload` and returns how many subscribers received it.
    pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let mut state = lock(&self.state);
        let Some(subscribers) = state.subscribers.get_mut(subject) else {
            return 0;
        };
        subscribers.retain(|(_, sender)| sender.send(payload.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        lock(&self.state)
            .subscribers
            .get(subject)
            .map_or(0, |subscribers| {
                subscribers
                    .iter()
                    .filter(|(_, sender)| !sender.is_closed())
                    .count()
            })
    }

    fn register(&self, subject: &str) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state
            .subscribers
            .entry(subject.to_string())
            .or_default()
            .push((id, tx));
        (id, rx)
    }

    fn remove(&self, subject: &str, id: u64) {
        let mut state = lock(&self.state);
        if let Some(subscribers) = state.subscribers.get_mut(subject) {
            subscribers.retain(|(subscriber, _)| *subscriber != id);
            if subscribers.is_empty() {
                state.subscribers.remove(subject);
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    fail_connects: AtomicUsize,
}

/// A client whose "network" is a [`MemoryBroker`].
pub struct MemoryClient {
    url: String,
    options: ClientOptions,
    broker: MemoryBroker,
    connected: AtomicBool,
    status_tx: broadcast::Sender<StatusEvent>,
    counters: Arc<Counters>,
    connect_delay: Duration,
}

impl MemoryClient {
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.status_tx.send(event);
    }

    /// Drops the link as a network failure would, without closing the client.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(StatusEvent::new(ConnectionStatus::Disconnected));
        self.emit(StatusEvent::new(ConnectionStatus::Reconnecting));
    }

    pub fn simulate_reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(StatusEvent::new(ConnectionStatus::Connected));
    }
}

impl TransportClient for MemoryClient {
    fn url(&self) -> &str {
        &self.url
    }

    fn connect<'a>(&'a self) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.counters.connect_calls.fetch_add(1, Ordering::SeqCst);
            self.emit(StatusEvent::new(ConnectionStatus::Connecting));
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }

            let failing = self
                .counters
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                self.emit(StatusEvent::new(ConnectionStatus::Error).with_data("connect refused"));
                return ConnectFailedSnafu {
                    stage: "memory-connect",
                    url: self.url.clone(),
                    details: "connect refused",
                }
                .fail();
            }

            self.connected.store(true, Ordering::SeqCst);
            self.emit(StatusEvent::new(ConnectionStatus::Connected));
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.counters.close_calls.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            self.emit(StatusEvent::new(ConnectionStatus::Closed));
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    fn subscribe_bytes(&self, subject: &str) -> TransportResult<Subscription> {
        if !self.is_connected() {
            return NotConnectedSnafu {
                stage: "memory-subscribe",
                subject,
            }
            .fail();
        }

        let (id, messages) = self.broker.register(subject);
        let (unsubscribe_tx, unsubscribe_rx) = oneshot::channel::<()>();
        let broker = self.broker.clone();
        let owned_subject = subject.to_string();
        tokio::spawn(async move {
            let _ = unsubscribe_rx.await;
            broker.remove(&owned_subject, id);
        });
        Ok(Subscription::new(subject, messages, unsubscribe_tx))
    }
}

/// Creates [`MemoryClient`]s on a shared broker and keeps them inspectable.
#[derive(Default)]
pub struct MemoryTransportFactory {
    broker: MemoryBroker,
    counters: Arc<Counters>,
    connect_delay: Duration,
    clients: Mutex<Vec<Arc<MemoryClient>>>,
}

impl MemoryTransportFactory {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            ..Self::default()
        }
    }

    /// Makes every connect take `delay` before it resolves.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.counters.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn connect_calls(&self) -> usize {
        self.counters.connect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.counters.close_calls.load(Ordering::SeqCst)
    }

    pub fn last_client(&self) -> Option<Arc<MemoryClient>> {
        lock(&self.clients).last().cloned()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, url: &str, options: &ClientOptions) -> Arc<dyn TransportClient> {
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let client = Arc::new(MemoryClient {
            url: url.to_string(),
            options: options.clone(),
            broker: self.broker.clone(),
            connected: AtomicBool::new(false),
            status_tx,
            counters: self.counters.clone(),
            connect_delay: self.connect_delay,
        });
        lock(&self.clients).push(client.clone());
        tracing::debug!(url = %url, client = %options.name, "created in-memory transport client");
        client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers_until_unsubscribed() {
        let factory = MemoryTransportFactory::new(MemoryBroker::new());
        let client = factory.create("memory://test", &ClientOptions::default());
        assert!(client.subscribe_bytes("chat.d.message").is_err());

        client.connect().await.expect("connect");
        let mut subscription = client.subscribe_bytes("chat.d.message").expect("subscribe");
        assert_eq!(factory.broker().publish("chat.d.message", b"one".to_vec()), 1);
        assert_eq!(factory.broker().publish("chat.d.other", b"lost".to_vec()), 0);
        assert_eq!(subscription.recv().await.as_deref(), Some(&b"one"[..]));

        drop(subscription);
        tokio::task::yield_now().await;
        assert_eq!(factory.broker().subscriber_count("chat.d.message"), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let factory = MemoryTransportFactory::new(MemoryBroker::new());
        factory.fail_next_connects(1);
        let client = factory.create("memory://test", &ClientOptions::default());
        let mut status = client.status();

        assert!(client.connect().await.is_err());
        assert!(client.connect().await.is_ok());
        assert_eq!(factory.connect_calls(), 2);

        let seen: Vec<_> = std::iter::from_fn(|| status.try_recv().ok())
            .map(|event| event.status)
            .collect();
        assert_eq!(
            seen,
            [
                ConnectionStatus::Connecting,
                ConnectionStatus::Error,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
    }
}
