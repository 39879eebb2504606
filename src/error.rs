use thiserror::Error;

/// Server-side failures the API maps onto status codes.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The room is past its lock boundary; surfaced to users as
    /// "this chat has ended" and never retried.
    #[error("locked")]
    Locked,
    #[error("unknown_event")]
    UnknownEvent,
    #[error("empty_message")]
    EmptyMessage,
    #[error("message_too_long")]
    MessageTooLong,
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// Outcome classification for a single long-poll attempt.
///
/// `Aborted` covers the client-side request timeout and explicit teardown.
/// It never counts toward the connection's error budget. `Malformed` is
/// retried exactly like `Transport`.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("aborted")]
    Aborted,
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl PollError {
    /// Whether this attempt counts toward the consecutive-failure budget.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, PollError::Aborted)
    }
}

/// Failures of the short request/response send path. There is no retry here;
/// `Locked` is returned synchronously to the caller.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("chat has ended")]
    Locked,
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport: {0}")]
    Transport(String),
}
