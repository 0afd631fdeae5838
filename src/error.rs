use std::time::Duration;

use thiserror::Error;

/// Failure reported by the service while a handle was being queried or
/// finished. The operation's real outcome may be unknown at that point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server error: {message}")]
pub struct ServerError {
    pub message: String,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CmdError {
    /// The service refused the command; never retried here.
    #[error("command rejected: {0}")]
    Submission(String),

    /// The attempt budget ran out before the handle reached a terminal state.
    /// The operation is most likely still alive on the server.
    #[error("command unfinished after {attempts} attempts ({:.1}s)", .waited.as_secs_f64())]
    LockTimeout { attempts: u32, waited: Duration },

    #[error(transparent)]
    Server(#[from] ServerError),

    /// The callback was closed and can no longer wait on its handle.
    #[error("callback closed")]
    Closed,
}

impl CmdError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, CmdError::LockTimeout { .. })
    }
}

pub type CmdResult<T> = std::result::Result<T, CmdError>;
