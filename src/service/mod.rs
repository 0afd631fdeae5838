//! In-process stand-in for the remote object service.
//!
//! Each submitted request runs on its own tokio task, one step per batch
//! child, and reports progress and its terminal outcome to the callbacks
//! registered on its handle.

pub mod store;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::commands::handle::{CallbackSink, Handle, HandleId, HandleState, Outcome, Registration};
use crate::config::ServiceConfig;
use crate::error::{CmdError, CmdResult, ServerError};
use crate::transport::{Request, Response, Status, StatusFlag};

pub use store::ObjectStore;

/// Accepts commands and hands back a handle on the running operation.
#[async_trait]
pub trait Session: Send + Sync {
    async fn submit(&self, request: Request) -> CmdResult<Arc<dyn Handle>>;
}

/// How submitted operations behave. Anything but `Normal` is for exercising
/// the slow and failing paths of a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    #[default]
    Normal,
    /// Never finishes on its own; only cancellation ends it.
    Stall,
    /// The handle is lost after the first step delay.
    Lose,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

struct Op {
    state: HandleState,
    status: Status,
    response: Option<Response>,
    lost: Option<ServerError>,
    cancel_requested: bool,
    closed: bool,
    sinks: BTreeMap<u64, Arc<dyn CallbackSink>>,
}

/// Handle on an operation run by [`LocalService`].
pub struct LocalHandle {
    id: HandleId,
    request: Request,
    op: Mutex<Op>,
    cancel: Notify,
    next_registration: AtomicU64,
}

impl LocalHandle {
    fn new(request: Request) -> Self {
        let status = Status::new(request.steps());
        Self {
            id: HandleId::new(),
            request,
            op: Mutex::new(Op {
                state: HandleState::Submitted,
                status,
                response: None,
                lost: None,
                cancel_requested: false,
                closed: false,
                sinks: BTreeMap::new(),
            }),
            cancel: Notify::new(),
            next_registration: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> HandleState {
        lock(&self.op).state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn callback_count(&self) -> usize {
        lock(&self.op).sinks.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.op).closed
    }

    fn cancel_requested(&self) -> bool {
        lock(&self.op).cancel_requested
    }

    fn mark_running(&self) {
        let mut op = lock(&self.op);
        if op.state.can_move_to(HandleState::Running) {
            op.state = HandleState::Running;
        }
    }

    fn step(&self, complete: u32) {
        let (sinks, total) = {
            let mut op = lock(&self.op);
            if op.state.is_terminal() {
                return;
            }
            op.status.current_step = complete;
            (op.sinks.values().cloned().collect::<Vec<_>>(), op.status.steps)
        };
        for sink in sinks {
            sink.step(complete, total);
        }
    }

    /// Single authoritative terminal transition; later attempts lose.
    fn finish(&self, outcome: Outcome) -> bool {
        let next = outcome.state();
        let sinks = {
            let mut op = lock(&self.op);
            if !op.state.can_move_to(next) {
                debug!(handle_id = %self.id, state = ?op.state, ignored = ?next, "already terminal");
                return false;
            }
            op.state = next;
            op.status.stop_time = Some(Utc::now());
            match &outcome {
                Outcome::Completed { response, .. } => {
                    if response.is_err() {
                        op.status.set_flag(StatusFlag::Failure);
                    }
                    op.response = Some(response.clone());
                }
                Outcome::Cancelled { .. } => op.status.set_flag(StatusFlag::Cancelled),
                Outcome::Lost(err) => {
                    op.status.set_flag(StatusFlag::Failure);
                    op.lost = Some(err.clone());
                }
            }
            op.sinks.values().cloned().collect::<Vec<_>>()
        };

        // Deliver the stored status, not the caller's placeholder.
        let delivered = match outcome {
            Outcome::Completed { response, .. } => Outcome::Completed {
                response,
                status: lock(&self.op).status.clone(),
            },
            Outcome::Cancelled { .. } => Outcome::Cancelled {
                status: lock(&self.op).status.clone(),
            },
            lost => lost,
        };
        info!(handle_id = %self.id, state = ?next, "operation finished");
        for sink in sinks {
            sink.finished(delivered.clone());
        }
        true
    }

    fn complete(&self, response: Response) -> bool {
        if !self.request.accepts(&response) {
            warn!(handle_id = %self.id, kind = ?response.kind(), "response does not match request");
            return self.lose(ServerError::new(format!(
                "{:?} response for {:?} request",
                response.kind(),
                self.request.kind()
            )));
        }
        let status = lock(&self.op).status.clone();
        self.finish(Outcome::Completed { response, status })
    }

    fn finish_cancelled(&self) -> bool {
        let status = lock(&self.op).status.clone();
        self.finish(Outcome::Cancelled { status })
    }

    fn lose(&self, err: ServerError) -> bool {
        self.finish(Outcome::Lost(err))
    }

    fn check_open(op: &Op) -> CmdResult<()> {
        if op.closed {
            return Err(ServerError::new("handle closed").into());
        }
        match &op.lost {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Handle for LocalHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    async fn status(&self) -> CmdResult<Status> {
        let op = lock(&self.op);
        Self::check_open(&op)?;
        Ok(op.status.clone())
    }

    async fn response(&self) -> CmdResult<Option<Response>> {
        let op = lock(&self.op);
        Self::check_open(&op)?;
        Ok(op.response.clone())
    }

    async fn cancel(&self) -> CmdResult<bool> {
        {
            let mut op = lock(&self.op);
            Self::check_open(&op)?;
            if op.state.is_terminal() {
                return Ok(false);
            }
            op.cancel_requested = true;
        }
        info!(handle_id = %self.id, "cancel requested");
        self.cancel.notify_one();
        Ok(true)
    }

    fn add_callback(&self, sink: Arc<dyn CallbackSink>) -> CmdResult<Registration> {
        let mut op = lock(&self.op);
        Self::check_open(&op)?;
        let key = self.next_registration.fetch_add(1, Ordering::Relaxed);
        op.sinks.insert(key, sink);
        Ok(Registration(key))
    }

    fn remove_callback(&self, registration: Registration) {
        lock(&self.op).sinks.remove(&registration.0);
    }

    fn close(&self) {
        let mut op = lock(&self.op);
        op.closed = true;
        op.sinks.clear();
        debug!(handle_id = %self.id, "handle closed");
    }
}

/// [`Session`] backed by an in-memory [`ObjectStore`].
#[derive(Clone)]
pub struct LocalService {
    store: Arc<Mutex<ObjectStore>>,
    step_delay: Duration,
    behavior: Behavior,
}

impl LocalService {
    pub fn new(store: ObjectStore, step_delay: Duration) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            step_delay,
            behavior: Behavior::Normal,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        let mut store = ObjectStore::new();
        for group in &config.groups {
            store.add_group(group.as_str());
        }
        let owner = config.groups.first().map(String::as_str).unwrap_or("default");
        for (target_type, ids) in &config.objects {
            for id in ids {
                store.insert(target_type, *id, owner);
            }
        }
        Self::new(store, config.step_delay()).with_behavior(config.behavior)
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn store(&self) -> MutexGuard<'_, ObjectStore> {
        lock(&self.store)
    }

    /// Submit and keep the concrete handle, for callers that want to
    /// inspect server-side state.
    pub async fn submit_local(&self, request: Request) -> CmdResult<Arc<LocalHandle>> {
        request.validate()?;
        if let Request::Chgrp { group, .. } = &request {
            if !self.store().has_group(group) {
                return Err(CmdError::Submission(format!("unknown group {group}")));
            }
        }

        let handle = Arc::new(LocalHandle::new(request));
        info!(
            handle_id = %handle.id,
            kind = ?handle.request.kind(),
            behavior = ?self.behavior,
            "command submitted"
        );
        tokio::spawn(run(
            handle.clone(),
            self.store.clone(),
            self.step_delay,
            self.behavior,
        ));
        Ok(handle)
    }
}

#[async_trait]
impl Session for LocalService {
    async fn submit(&self, request: Request) -> CmdResult<Arc<dyn Handle>> {
        let handle: Arc<dyn Handle> = self.submit_local(request).await?;
        Ok(handle)
    }
}

/// Sleep one step, waking early on a cancel request. Returns whether the
/// operation should stop because it was cancelled.
async fn step_wait(handle: &LocalHandle, step_delay: Duration) -> bool {
    tokio::select! {
        _ = sleep(step_delay) => {}
        _ = handle.cancel.notified() => {}
    }
    if handle.cancel_requested() {
        handle.finish_cancelled();
        return true;
    }
    false
}

async fn run(
    handle: Arc<LocalHandle>,
    store: Arc<Mutex<ObjectStore>>,
    step_delay: Duration,
    behavior: Behavior,
) {
    handle.mark_running();
    match behavior {
        Behavior::Stall => {
            handle.cancel.notified().await;
            handle.finish_cancelled();
        }
        Behavior::Lose => {
            if !step_wait(&handle, step_delay).await {
                handle.lose(ServerError::new("operation lost by server"));
            }
        }
        Behavior::Normal => {
            let parts: Vec<Request> = match handle.request() {
                Request::DoAll { requests } => requests.clone(),
                single => vec![single.clone()],
            };
            let mut responses = Vec::with_capacity(parts.len());
            for (i, part) in parts.iter().enumerate() {
                if step_wait(&handle, step_delay).await {
                    return;
                }
                responses.push(lock(&store).apply(part));
                handle.step(i as u32 + 1);
            }
            let response = match handle.request() {
                Request::DoAll { .. } => Response::DoAllRsp { responses },
                _ => responses.pop().unwrap_or(Response::Ok),
            };
            handle.complete(response);
        }
    }
}
