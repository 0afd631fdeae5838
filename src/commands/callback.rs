use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::commands::driver::{LoopPolicy, LoopState, PollDriver};
use crate::commands::handle::{CallbackSink, Handle, HandleId, Outcome, Registration};
use crate::error::{CmdError, CmdResult, ServerError};
use crate::transport::{Response, Status, StatusFlag};

/// Extension point for custom handling of a handle's lifecycle.
///
/// The callback always stores the outcome before any hook runs, so
/// [`CmdCallback::response`] keeps working no matter what a hook does.
/// Hooks run on the delivery path: a panic inside one is caught and logged.
pub trait CallbackHooks: Send + Sync {
    fn step(&self, _complete: u32, _total: u32) {}

    /// Runs exactly once, after the response and status were stored.
    fn finished(&self, _response: &Response, _status: &Status) {}

    fn cancelled(&self, status: &Status) {
        info!(step = status.current_step, steps = status.steps, "command cancelled");
    }

    /// The handle became invalid before a response could be delivered.
    fn failed(&self, error: &ServerError) {
        warn!(error = %error, "command handle lost");
    }
}

/// Default hooks: keep the outcome, nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl CallbackHooks for NoHooks {}

/// Adapts a closure into a `finished` hook.
pub struct OnFinished<F>(pub F);

impl<F> CallbackHooks for OnFinished<F>
where
    F: Fn(&Response, &Status) + Send + Sync,
{
    fn finished(&self, response: &Response, status: &Status) {
        (self.0)(response, status)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

/// State shared between the delivery path and the waiting caller.
struct Shared {
    handle_id: HandleId,
    hooks: Box<dyn CallbackHooks>,
    outcome: Mutex<Option<Outcome>>,
    done: watch::Sender<bool>,
    /// Held across the closed check, the store and the hooks; `close` takes
    /// it too, so no hook is still running once `close` has returned.
    delivery: Mutex<()>,
    closed: AtomicBool,
}

impl Shared {
    /// First writer wins. Returns whether this outcome was the one stored.
    fn deliver(&self, outcome: Outcome) -> bool {
        let _delivering = lock(&self.delivery);
        if self.closed.load(Ordering::Acquire) {
            debug!(handle_id = %self.handle_id, "dropping notification after close");
            return false;
        }
        {
            let mut slot = lock(&self.outcome);
            if let Some(existing) = slot.as_ref() {
                debug!(
                    handle_id = %self.handle_id,
                    existing = ?existing.state(),
                    ignored = ?outcome.state(),
                    "handle already terminal"
                );
                return false;
            }
            *slot = Some(outcome.clone());
        }

        let result = catch_unwind(AssertUnwindSafe(|| match &outcome {
            Outcome::Completed { response, status } => self.hooks.finished(response, status),
            Outcome::Cancelled { status } => self.hooks.cancelled(status),
            Outcome::Lost(err) => self.hooks.failed(err),
        }));
        if result.is_err() {
            error!(handle_id = %self.handle_id, "callback hook panicked");
        }

        self.done.send_replace(true);
        true
    }

    fn outcome(&self) -> Option<Outcome> {
        lock(&self.outcome).clone()
    }

    fn is_finished(&self) -> bool {
        lock(&self.outcome).is_some()
    }

    /// Marks the callback closed once any in-flight delivery has finished.
    /// Returns false if it was already closed.
    fn shut(&self) -> bool {
        let _delivering = lock(&self.delivery);
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl CallbackSink for Shared {
    fn step(&self, complete: u32, total: u32) {
        let _delivering = lock(&self.delivery);
        if self.closed.load(Ordering::Acquire) || self.is_finished() {
            return;
        }
        debug!(handle_id = %self.handle_id, complete, total, "step");
        if catch_unwind(AssertUnwindSafe(|| self.hooks.step(complete, total))).is_err() {
            error!(handle_id = %self.handle_id, "step hook panicked");
        }
    }

    fn finished(&self, outcome: Outcome) {
        self.deliver(outcome);
    }
}

/// Read-only view of a callback's stored outcome. Cheap to clone; useful
/// for hooks that need to look at the callback they are attached to.
#[derive(Clone)]
pub struct CallbackObserver {
    shared: Arc<Shared>,
}

impl CallbackObserver {
    pub fn response(&self) -> Option<Response> {
        self.shared.outcome().and_then(|o| o.response().cloned())
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }
}

/// Bridges a handle's asynchronous lifecycle to the caller.
///
/// Registers itself on the handle at construction and unregisters exactly
/// once, either on [`close`](CmdCallback::close) or on drop. With
/// `close_handle` set, the handle itself is closed at the same point.
pub struct CmdCallback {
    handle: Arc<dyn Handle>,
    shared: Arc<Shared>,
    registration: Registration,
    close_handle: bool,
}

impl CmdCallback {
    pub async fn new(handle: Arc<dyn Handle>, close_handle: bool) -> CmdResult<Self> {
        Self::with_hooks(handle, close_handle, NoHooks).await
    }

    /// Callback with a closure run after the response was stored.
    pub async fn on_finished<F>(
        handle: Arc<dyn Handle>,
        close_handle: bool,
        f: F,
    ) -> CmdResult<Self>
    where
        F: Fn(&Response, &Status) + Send + Sync + 'static,
    {
        Self::with_hooks(handle, close_handle, OnFinished(f)).await
    }

    pub async fn with_hooks<H>(
        handle: Arc<dyn Handle>,
        close_handle: bool,
        hooks: H,
    ) -> CmdResult<Self>
    where
        H: CallbackHooks + 'static,
    {
        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            handle_id: handle.id(),
            hooks: Box::new(hooks),
            outcome: Mutex::new(None),
            done,
            delivery: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let sink: Arc<dyn CallbackSink> = shared.clone();
        let registration = handle.add_callback(sink)?;
        let callback = Self {
            handle,
            shared,
            registration,
            close_handle,
        };
        debug!(handle_id = %callback.shared.handle_id, close_handle, "callback registered");

        // The operation may have finished before we subscribed.
        callback.poll().await?;
        Ok(callback)
    }

    pub fn handle(&self) -> &Arc<dyn Handle> {
        &self.handle
    }

    pub fn observer(&self) -> CallbackObserver {
        CallbackObserver {
            shared: self.shared.clone(),
        }
    }

    /// Wait until the handle is terminal, at most `max_attempts` waits of
    /// `interval_ms` each.
    ///
    /// Returns normally once completed or cancelled. Fails with
    /// [`CmdError::LockTimeout`] when the budget runs out; the caller may
    /// loop again or cancel. A lost handle surfaces as [`CmdError::Server`].
    pub async fn wait_loop(&self, max_attempts: u32, interval_ms: u64) -> CmdResult<()> {
        self.wait_with(LoopPolicy::new(max_attempts, interval_ms))
            .await
    }

    pub async fn wait_with(&self, policy: LoopPolicy) -> CmdResult<()> {
        let mut driver = PollDriver::new(policy);
        loop {
            match driver.state() {
                LoopState::Waiting => {
                    let notified = self.block(policy.interval()).await?;
                    driver.advance(notified);
                    if !notified {
                        debug!(
                            handle_id = %self.shared.handle_id,
                            attempt = driver.attempts(),
                            max_attempts = policy.max_attempts,
                            "still waiting"
                        );
                    }
                }
                LoopState::Notified => return self.terminal_result(),
                LoopState::Exhausted => {
                    if self.is_finished() {
                        return self.terminal_result();
                    }
                    let err = driver.timeout_error();
                    warn!(handle_id = %self.shared.handle_id, "{err}");
                    return Err(err);
                }
            }
        }
    }

    /// One attempt: wait up to `interval` for a terminal notification, then
    /// pull from the handle once. Returns whether the handle is terminal.
    pub async fn block(&self, interval: Duration) -> CmdResult<bool> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CmdError::Closed);
        }
        if self.is_finished() {
            return Ok(true);
        }

        let mut rx = self.shared.done.subscribe();
        let signalled = timeout(interval, async move {
            rx.wait_for(|done| *done).await.is_ok()
        })
        .await
        .unwrap_or(false);
        if signalled {
            return Ok(true);
        }

        self.poll().await?;
        Ok(self.is_finished())
    }

    /// Pull the handle's state and deliver it if terminal. A server error
    /// from the handle marks it lost.
    pub async fn poll(&self) -> CmdResult<()> {
        if self.is_finished() {
            return Ok(());
        }

        let outcome = match self.handle.response().await {
            Ok(Some(response)) => match self.handle.status().await {
                Ok(status) => Some(Outcome::Completed { response, status }),
                Err(CmdError::Server(err)) => Some(Outcome::Lost(err)),
                Err(other) => return Err(other),
            },
            Ok(None) => match self.handle.status().await {
                Ok(status) if status.has_flag(StatusFlag::Cancelled) && status.is_stopped() => {
                    Some(Outcome::Cancelled { status })
                }
                Ok(_) => None,
                Err(CmdError::Server(err)) => Some(Outcome::Lost(err)),
                Err(other) => return Err(other),
            },
            Err(CmdError::Server(err)) => Some(Outcome::Lost(err)),
            Err(other) => return Err(other),
        };

        if let Some(outcome) = outcome {
            self.shared.deliver(outcome);
        }
        Ok(())
    }

    fn terminal_result(&self) -> CmdResult<()> {
        match self.shared.outcome() {
            Some(Outcome::Lost(err)) => Err(CmdError::Server(err)),
            Some(_) => Ok(()),
            None => Err(CmdError::Closed),
        }
    }

    /// Stored response; `None` until the handle completed.
    pub fn response(&self) -> Option<Response> {
        self.shared.outcome().and_then(|o| o.response().cloned())
    }

    pub fn status(&self) -> Option<Status> {
        self.shared.outcome().and_then(|o| o.status().cloned())
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.outcome()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        match self.shared.outcome() {
            Some(Outcome::Cancelled { .. }) => true,
            Some(Outcome::Completed { status, .. }) => status.has_flag(StatusFlag::Cancelled),
            _ => false,
        }
    }

    pub fn is_failure(&self) -> bool {
        match self.shared.outcome() {
            Some(Outcome::Lost(_)) => true,
            Some(outcome) => outcome
                .status()
                .is_some_and(|s| s.has_flag(StatusFlag::Failure)),
            None => false,
        }
    }

    /// Unregister from the handle, closing it too when this callback owns
    /// cleanup. Idempotent; also runs on drop.
    pub fn close(&self) {
        if !self.shared.shut() {
            return;
        }
        self.handle.remove_callback(self.registration);
        if self.close_handle {
            self.handle.close();
        }
        debug!(
            handle_id = %self.shared.handle_id,
            close_handle = self.close_handle,
            "callback closed"
        );
    }
}

impl Drop for CmdCallback {
    fn drop(&mut self) {
        self.close();
    }
}
