use std::sync::Arc;

use snafu::Snafu;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("endpoint URL '{url}' is invalid"))]
    InvalidUrl {
        stage: &'static str,
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("endpoint URL '{url}' cannot be switched to scheme '{scheme}'"))]
    UnsupportedScheme {
        stage: &'static str,
        url: String,
        scheme: &'static str,
    },
    #[snafu(display("connect to '{url}' failed: {details}"))]
    ConnectFailed {
        stage: &'static str,
        url: String,
        details: String,
    },
    #[snafu(display("shared connect to '{url}' failed on `{stage}`, {source}"))]
    SharedConnect {
        stage: &'static str,
        url: String,
        source: Arc<TransportError>,
    },
    #[snafu(display("cannot subscribe to '{subject}' while disconnected"))]
    NotConnected {
        stage: &'static str,
        subject: String,
    },
    #[snafu(display("close of '{url}' failed: {details}"))]
    CloseFailed {
        stage: &'static str,
        url: String,
        details: String,
    },
}
