use snafu::Snafu;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display(
        "fetching `{chat_type}` chunks of dialog '{dialog_id}' failed on `{stage}`: {details}"
    ))]
    FetchChunks {
        stage: &'static str,
        dialog_id: String,
        chat_type: &'static str,
        details: String,
    },
}
