//! Error type for the daemon surface.
//!
//! Everything a daemon operation can fail with lands in [`PybsError`]; the
//! RPC layer turns it into a JSON-RPC error envelope, the dispatcher logs it
//! and keeps ticking.

use crate::jobstore::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PybsError {
    /// Bad input from a client: missing header field, unknown config key,
    /// nonexistent script file.
    #[error("{0}")]
    Validation(String),

    /// Job id unknown to `remove` or `run`.
    #[error("job {0} not found")]
    NotFound(i64),

    /// Database trouble, from the job store.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The job subprocess could not be started at all.
    #[error("failed to spawn job process: {0}")]
    Spawn(String),

    /// An output/error capture file could not be written. Captures are
    /// advisory; callers log and continue.
    #[error("failed to write capture file: {0}")]
    Capture(#[source] std::io::Error),

    /// A notifier transport failed. Logged and swallowed by the supervisor.
    #[error("notification failed: {0}")]
    Notify(String),
}

impl PybsError {
    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        PybsError::Validation(msg.into())
    }
}
