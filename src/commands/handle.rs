use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CmdResult, ServerError};
use crate::transport::{Response, Status};

/// Opaque identity the service uses to locate an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a server-side operation:
/// `Submitted -> Running* -> {Completed | Cancelled | Lost}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Submitted,
    Running,
    Completed,
    Cancelled,
    Lost,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandleState::Completed | HandleState::Cancelled | HandleState::Lost
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_move_to(self, next: HandleState) -> bool {
        match self {
            HandleState::Submitted => next != HandleState::Submitted,
            HandleState::Running => next != HandleState::Submitted,
            _ => false,
        }
    }
}

/// Terminal notification pushed to registered callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { response: Response, status: Status },
    Cancelled { status: Status },
    Lost(ServerError),
}

impl Outcome {
    pub fn state(&self) -> HandleState {
        match self {
            Outcome::Completed { .. } => HandleState::Completed,
            Outcome::Cancelled { .. } => HandleState::Cancelled,
            Outcome::Lost(_) => HandleState::Lost,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Outcome::Completed { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            Outcome::Completed { status, .. } | Outcome::Cancelled { status } => Some(status),
            Outcome::Lost(_) => None,
        }
    }
}

/// Receiving end of a handle's notification channel. Called from the
/// service's delivery path, so implementations must not block for long.
pub trait CallbackSink: Send + Sync {
    fn step(&self, complete: u32, total: u32);

    fn finished(&self, outcome: Outcome);
}

/// Token returned by [`Handle::add_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration(pub u64);

/// Client-side capability over a server-side operation. It does not own the
/// execution; the operation lives independently on the service.
#[async_trait]
pub trait Handle: Send + Sync {
    fn id(&self) -> HandleId;

    /// Latest known status without blocking on the operation.
    async fn status(&self) -> CmdResult<Status>;

    /// The response, once the operation completed.
    async fn response(&self) -> CmdResult<Option<Response>>;

    /// Ask the service to abort. `false` when the operation is already
    /// terminal; acceptance does not mean it has stopped yet.
    async fn cancel(&self) -> CmdResult<bool>;

    /// Subscribe to step and terminal notifications. A sink registered after
    /// the operation finished is not notified; pull with `status`/`response`.
    fn add_callback(&self, sink: Arc<dyn CallbackSink>) -> CmdResult<Registration>;

    fn remove_callback(&self, registration: Registration);

    /// Release the server-side handle. Further queries fail.
    fn close(&self);
}
