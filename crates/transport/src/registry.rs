//! The process-wide shared transport connection.
//!
//! At most one connection exists at a time. Acquirers share it by reference count; when the
//! count drops to zero the connection survives a grace period so a quick re-acquire reuses
//! it instead of reconnecting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::Shared;
use snafu::ResultExt;
use tokio::task::JoinHandle;

use crate::client::{BoxFuture, ClientOptions, TransportClient, TransportFactory};
use crate::error::{SharedConnectSnafu, TransportError, TransportResult};

pub const DEFAULT_SHARED_CLOSE_DELAY: Duration = Duration::from_millis(3_000);

type ConnectFuture = Shared<BoxFuture<'static, Result<(), Arc<TransportError>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ConnectionInner {
    url: String,
    client: Arc<dyn TransportClient>,
    connecting: Mutex<Option<ConnectFuture>>,
}

/// Handle to the shared connection for one URL.
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<ConnectionInner>,
}

impl SharedConnection {
    fn new(url: &str, client: Arc<dyn TransportClient>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                url: url.to_string(),
                client,
                connecting: Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn client(&self) -> &Arc<dyn TransportClient> {
        &self.inner.client
    }

    /// True when both handles refer to the same underlying connection.
    pub fn same(&self, other: &SharedConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connects, joining the attempt already in flight if there is one.
    ///
    /// A failed attempt is forgotten so the next call starts a fresh one.
    pub async fn connect(&self) -> TransportResult<()> {
        let pending = {
            let mut connecting = lock(&self.inner.connecting);
            connecting
                .get_or_insert_with(|| {
                    let client = self.inner.client.clone();
                    async move { client.connect().await.map_err(Arc::new) }
                        .boxed()
                        .shared()
                })
                .clone()
        };

        let outcome = pending.clone().await;
        if outcome.is_err() {
            // Another caller may already have started a retry in this slot.
            let mut connecting = lock(&self.inner.connecting);
            if connecting
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&pending))
            {
                connecting.take();
            }
        }
        outcome.context(SharedConnectSnafu {
            stage: "await-shared-connect",
            url: self.inner.url.clone(),
        })
    }

    async fn close(self, reason: &'static str) {
        tracing::debug!(url = %self.inner.url, reason, "closing shared connection");
        if let Err(error) = self.inner.client.close().await {
            tracing::warn!(url = %self.inner.url, error = %error, "shared connection close failed");
        }
    }
}

struct SharedSlot {
    url: String,
    connection: SharedConnection,
    ref_count: usize,
    close_timer: Option<JoinHandle<()>>,
    generation: u64,
}

#[derive(Default)]
struct RegistryState {
    slot: Option<SharedSlot>,
    generation: u64,
}

struct RegistryInner {
    factory: Arc<dyn TransportFactory>,
    options: ClientOptions,
    grace: Duration,
    state: Mutex<RegistryState>,
}

/// Owner of the single shared connection.
///
/// Clones share the same slot. Methods that may close a connection spawn onto the current
/// tokio runtime.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, options: ClientOptions) -> Self {
        Self::with_grace(factory, options, DEFAULT_SHARED_CLOSE_DELAY)
    }

    pub fn with_grace(
        factory: Arc<dyn TransportFactory>,
        options: ClientOptions,
        grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                factory,
                options,
                grace,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    /// Takes a reference on the connection for `url`, creating it if needed.
    ///
    /// A connection to a different URL is closed immediately, skipping its grace period.
    pub fn acquire(&self, url: &str) -> SharedConnection {
        let mut replaced = None;
        let connection = {
            let mut state = lock(&self.inner.state);
            if state.slot.as_ref().is_some_and(|slot| slot.url != url) {
                replaced = state.slot.take();
            }
            if state.slot.is_none() {
                state.generation += 1;
            }
            let generation = state.generation;
            let slot = state.slot.get_or_insert_with(|| {
                tracing::debug!(url = %url, "created shared connection");
                let client = self.inner.factory.create(url, &self.inner.options);
                SharedSlot {
                    url: url.to_string(),
                    connection: SharedConnection::new(url, client),
                    ref_count: 0,
                    close_timer: None,
                    generation,
                }
            });
            slot.ref_count += 1;
            if let Some(timer) = slot.close_timer.take() {
                timer.abort();
            }
            slot.connection.clone()
        };

        if let Some(old) = replaced {
            if let Some(timer) = old.close_timer {
                timer.abort();
            }
            tracing::info!(from = %old.url, to = %url, "switching shared connection endpoint");
            tokio::spawn(old.connection.close("endpoint-switch"));
        }
        connection
    }

    /// Drops a reference; the last one arms the grace-period close.
    pub fn release(&self, url: &str) {
        let mut state = lock(&self.inner.state);
        let Some(slot) = state.slot.as_mut().filter(|slot| slot.url == url) else {
            return;
        };
        slot.ref_count = slot.ref_count.saturating_sub(1);
        if slot.ref_count > 0 {
            return;
        }

        if let Some(timer) = slot.close_timer.take() {
            timer.abort();
        }
        let generation = slot.generation;
        let registry = self.clone();
        slot.close_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(registry.inner.grace).await;
            registry.expire(generation).await;
        }));
    }

    async fn expire(&self, generation: u64) {
        let expired = {
            let mut state = lock(&self.inner.state);
            let idle = state
                .slot
                .as_ref()
                .is_some_and(|slot| slot.generation == generation && slot.ref_count == 0);
            if idle { state.slot.take() } else { None }
        };
        if let Some(slot) = expired {
            slot.connection.close("grace-expired").await;
        }
    }

    pub fn ref_count(&self, url: &str) -> usize {
        lock(&self.inner.state)
            .slot
            .as_ref()
            .filter(|slot| slot.url == url)
            .map_or(0, |slot| slot.ref_count)
    }

    pub fn current_url(&self) -> Option<String> {
        lock(&self.inner.state)
            .slot
            .as_ref()
            .map(|slot| slot.url.clone())
    }
}
