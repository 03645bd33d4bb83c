use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dialog_core::Topic;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::{broadcast, mpsc, oneshot};
use url::Url;

use crate::error::{InvalidUrlSnafu, TransportResult, UnsupportedSchemeSnafu};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
    Error,
}

impl ConnectionStatus {
    /// Statuses after which the transport can no longer deliver messages.
    pub fn is_disconnected(self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    pub data: Option<String>,
}

impl StatusEvent {
    pub fn new(status: ConnectionStatus) -> Self {
        Self { status, data: None }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Ordered byte deliveries for one subject. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    messages: mpsc::UnboundedReceiver<Vec<u8>>,
    unsubscribe_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(
        subject: impl Into<String>,
        messages: mpsc::UnboundedReceiver<Vec<u8>>,
        unsubscribe_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            subject: subject.into(),
            messages,
            unsubscribe_tx: Some(unsubscribe_tx),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.messages.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.messages.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) -> bool {
        self.unsubscribe_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe_tx) = self.unsubscribe_tx.take() {
            let _ = unsubscribe_tx.send(());
        }
    }
}

/// The pub/sub client a dialog subscription runs on.
///
/// Reconnection after an established connection drops is the client's own concern; it
/// reports progress through [`TransportClient::status`].
pub trait TransportClient: Send + Sync {
    fn url(&self) -> &str;
    fn connect<'a>(&'a self) -> BoxFuture<'a, TransportResult<()>>;
    fn close<'a>(&'a self) -> BoxFuture<'a, TransportResult<()>>;
    fn is_connected(&self) -> bool;
    /// Subscribes to status changes; dropping the receiver unsubscribes.
    fn status(&self) -> broadcast::Receiver<StatusEvent>;
    fn subscribe_bytes(&self, subject: &str) -> TransportResult<Subscription>;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, url: &str, options: &ClientOptions) -> Arc<dyn TransportClient>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub name: String,
    pub user: String,
    pub pass: String,
    pub connect_timeout_ms: u64,
    pub reconnect_time_wait_ms: u64,
    pub ping_interval_ms: u64,
    pub max_ping_out: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: "openframe-frontend".to_string(),
            user: "machine".to_string(),
            pass: String::new(),
            connect_timeout_ms: 10_000,
            reconnect_time_wait_ms: 2_000,
            ping_interval_ms: 30_000,
            max_ping_out: 3,
        }
    }
}

impl ClientOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_time_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_time_wait_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// `chat.<dialogId>.<topic>`
pub fn subject_for(dialog_id: &str, topic: Topic) -> String {
    format!("chat.{dialog_id}.{topic}")
}

/// Derives the websocket endpoint from an API base URL.
///
/// `https` bases map to `wss`, everything else to `ws`; the token, when given, travels as
/// the `authorization` query parameter.
pub fn build_ws_url(api_base: &str, token: Option<&str>) -> TransportResult<String> {
    let base = Url::parse(api_base).context(InvalidUrlSnafu {
        stage: "parse-api-base",
        url: api_base.to_string(),
    })?;
    let mut endpoint = base.join("/ws/nats").context(InvalidUrlSnafu {
        stage: "join-ws-path",
        url: api_base.to_string(),
    })?;

    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    ensure!(
        endpoint.set_scheme(scheme).is_ok(),
        UnsupportedSchemeSnafu {
            stage: "set-ws-scheme",
            url: api_base.to_string(),
            scheme,
        }
    );

    if let Some(token) = token.filter(|token| !token.is_empty()) {
        endpoint
            .query_pairs_mut()
            .append_pair("authorization", token);
    }
    Ok(endpoint.into())
}
