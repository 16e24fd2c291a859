use std::time::Duration;

/// Core error type for the bot.
///
/// Adapter crates should map their SDK errors into this type so the supervisor
/// can turn every connectivity failure into a state transition plus a retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{op} timed out after {}ms", after.as_millis())]
    Timeout { op: &'static str, after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether the failure is expected to clear up on its own.
    ///
    /// Auth failures are still retried by the supervisor (the token may be
    /// refreshed upstream), they are just not considered transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
