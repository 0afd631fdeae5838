use async_trait::async_trait;
use cmd_callback::commands::handle::{CallbackSink, HandleId, HandleState, Registration};
use cmd_callback::commands::{CallbackHooks, CallbackObserver, CmdCallback, Handle, Outcome};
use cmd_callback::commands::report::DeleteReporter;
use cmd_callback::error::{CmdError, CmdResult, ServerError};
use cmd_callback::service::{Behavior, LocalService, ObjectStore, Session};
use cmd_callback::transport::{Request, Response, Status};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::time::{sleep, Duration, Instant};

fn service(step_delay_ms: u64) -> LocalService {
    let mut store = ObjectStore::new();
    store.insert("/Image", 1, "lab");
    store.insert("/Image", 2, "lab");
    LocalService::new(store, Duration::from_millis(step_delay_ms))
}

/// Handle whose notifications are pushed by the test.
#[derive(Default)]
struct ScriptedHandle {
    id: HandleId,
    sinks: Mutex<BTreeMap<u64, Arc<dyn CallbackSink>>>,
    next: AtomicU32,
    removed: AtomicU32,
    closed: AtomicU32,
}

impl ScriptedHandle {
    fn push(&self, outcome: Outcome) {
        let sinks: Vec<_> = self.sinks.lock().unwrap().values().cloned().collect();
        for sink in sinks {
            sink.finished(outcome.clone());
        }
    }

    fn step(&self, complete: u32, total: u32) {
        let sinks: Vec<_> = self.sinks.lock().unwrap().values().cloned().collect();
        for sink in sinks {
            sink.step(complete, total);
        }
    }
}

#[async_trait]
impl Handle for ScriptedHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    async fn status(&self) -> CmdResult<Status> {
        Ok(Status::new(1))
    }

    async fn response(&self) -> CmdResult<Option<Response>> {
        Ok(None)
    }

    async fn cancel(&self) -> CmdResult<bool> {
        Ok(true)
    }

    fn add_callback(&self, sink: Arc<dyn CallbackSink>) -> CmdResult<Registration> {
        let key = self.next.fetch_add(1, Ordering::SeqCst) as u64;
        self.sinks.lock().unwrap().insert(key, sink);
        Ok(Registration(key))
    }

    fn remove_callback(&self, registration: Registration) {
        self.sinks.lock().unwrap().remove(&registration.0);
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn completed(actual_deletes: u64, warning: &str) -> Outcome {
    Outcome::Completed {
        response: Response::DeleteRsp {
            actual_deletes,
            warning: warning.to_string(),
        },
        status: Status::new(1),
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// Completion arrives during the third wait.
#[tokio::test(start_paused = true)]
async fn delete_completes_before_budget() {
    let svc = service(1200);
    let handle = svc.submit(Request::delete("/Image", 1)).await.unwrap();
    let cb = CmdCallback::new(handle, true).await.unwrap();
    assert!(cb.response().is_none());

    let start = Instant::now();
    cb.wait_loop(10, 500).await.expect("loop should finish");
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");

    let rsp = cb.response().expect("response after loop");
    let report = rsp.as_delete().expect("delete outcome");
    assert_eq!(report.actual_deletes, 1);
    assert_eq!(report.warning(), None);
    assert!(!cb.is_cancelled());
    assert!(!svc.store().contains("/Image", 1));
}

// Nothing ever completes; exhaust, cancel, then await the cancel.
#[tokio::test(start_paused = true)]
async fn stalled_command_times_out_then_cancels() {
    let svc = service(100).with_behavior(Behavior::Stall);
    let handle = svc.submit(Request::delete("/Image", 1)).await.unwrap();
    let cb = CmdCallback::new(handle.clone(), true).await.unwrap();

    let start = Instant::now();
    let err = cb.wait_loop(10, 500).await.unwrap_err();
    let elapsed = start.elapsed();
    assert_eq!(
        err,
        CmdError::LockTimeout {
            attempts: 10,
            waited: Duration::from_millis(5000)
        }
    );
    assert!(elapsed >= Duration::from_millis(5000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(5100), "{elapsed:?}");
    assert!(cb.response().is_none());

    assert!(handle.cancel().await.unwrap());
    cb.wait_loop(10, 500).await.expect("cancellation notification");
    assert!(cb.is_cancelled());
    assert!(cb.response().is_none());
    assert!(!handle.cancel().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn timeout_is_never_early() {
    for max in [1u32, 2, 5, 7] {
        let svc = service(100).with_behavior(Behavior::Stall);
        let handle = svc.submit(Request::delete("/Image", 1)).await.unwrap();
        let cb = CmdCallback::new(handle, true).await.unwrap();

        let start = Instant::now();
        let err = cb.wait_loop(max, 200).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(200) * max);
        assert!(matches!(err, CmdError::LockTimeout { attempts, .. } if attempts == max));
    }
}

struct OrderedReport {
    observer: Arc<OnceLock<CallbackObserver>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl CallbackHooks for OrderedReport {
    fn finished(&self, response: &Response, _status: &Status) {
        let stored = self
            .observer
            .get()
            .map(|o| o.response().is_some())
            .unwrap_or(false);
        let mut events = self.events.lock().unwrap();
        events.push(format!("stored={stored}"));
        if let Some(report) = response.as_delete() {
            events.push(format!(
                "deleted={} warning={}",
                report.actual_deletes,
                report.warning().unwrap_or("")
            ));
        }
    }
}

// Storage first, then the hook, each exactly once.
#[tokio::test]
async fn finished_hook_runs_after_storage() {
    let handle = Arc::new(ScriptedHandle::default());
    let observer = Arc::new(OnceLock::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let hooks = OrderedReport {
        observer: observer.clone(),
        events: events.clone(),
    };
    let cb = CmdCallback::with_hooks(handle.clone(), true, hooks)
        .await
        .unwrap();
    let _ = observer.set(cb.observer());

    let pusher = handle.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        pusher.push(completed(3, "orphans skipped"));
    });

    cb.wait_loop(10, 500).await.unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "stored=true".to_string(),
            "deleted=3 warning=orphans skipped".to_string()
        ]
    );
    assert_eq!(
        cb.response().and_then(|r| r.as_delete().map(|d| d.actual_deletes)),
        Some(3)
    );
}

#[tokio::test]
async fn delete_reporter_prints_once() {
    let handle = Arc::new(ScriptedHandle::default());
    let buf = SharedBuf::default();
    let cb = CmdCallback::with_hooks(handle.clone(), true, DeleteReporter::new(buf.clone()))
        .await
        .unwrap();

    handle.push(completed(3, "orphans skipped"));
    handle.push(completed(4, ""));
    cb.wait_loop(1, 10).await.unwrap();

    assert_eq!(buf.contents(), "Report:  deleted=3, warning=orphans skipped\n");
    assert_eq!(cb.response().unwrap().as_delete().unwrap().actual_deletes, 3);
}

#[derive(Default)]
struct Counts {
    finished: AtomicU32,
    cancelled: AtomicU32,
    failed: AtomicU32,
    steps: AtomicU32,
}

#[derive(Clone, Default)]
struct Counting(Arc<Counts>);

impl CallbackHooks for Counting {
    fn step(&self, _complete: u32, _total: u32) {
        self.0.steps.fetch_add(1, Ordering::SeqCst);
    }

    fn finished(&self, _response: &Response, _status: &Status) {
        self.0.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn cancelled(&self, _status: &Status) {
        self.0.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn failed(&self, _error: &ServerError) {
        self.0.failed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn finished_at_most_once_for_any_sequence() {
    let handle = Arc::new(ScriptedHandle::default());
    let counts = Counting::default();
    let cb = CmdCallback::with_hooks(handle.clone(), false, counts.clone())
        .await
        .unwrap();

    handle.step(1, 2);
    handle.push(completed(1, ""));
    handle.push(Outcome::Cancelled {
        status: Status::new(1),
    });
    handle.push(Outcome::Lost(ServerError::new("late")));
    handle.push(completed(9, ""));
    handle.step(2, 2);

    assert_eq!(counts.0.finished.load(Ordering::SeqCst), 1);
    assert_eq!(counts.0.cancelled.load(Ordering::SeqCst), 0);
    assert_eq!(counts.0.failed.load(Ordering::SeqCst), 0);
    assert_eq!(counts.0.steps.load(Ordering::SeqCst), 1);
    assert_eq!(
        cb.outcome().map(|o| o.state()),
        Some(HandleState::Completed)
    );
}

// The handle is lost; the hook reports it and the loop surfaces it.
#[tokio::test(start_paused = true)]
async fn lost_handle_is_reported_not_fatal() {
    let svc = service(300).with_behavior(Behavior::Lose);
    let handle = svc.submit(Request::delete("/Image", 1)).await.unwrap();
    let buf = SharedBuf::default();
    let cb = CmdCallback::with_hooks(handle, true, DeleteReporter::new(buf.clone()))
        .await
        .unwrap();

    let err = cb.wait_loop(10, 500).await.unwrap_err();
    assert!(matches!(err, CmdError::Server(_)));
    assert!(cb.response().is_none());
    assert!(cb.is_failure());
    assert_eq!(buf.contents(), "Something happened to the handle?!?\n");
}

#[tokio::test(start_paused = true)]
async fn cleanup_runs_once_on_every_path() {
    // success
    let handle = Arc::new(ScriptedHandle::default());
    {
        let cb = CmdCallback::new(handle.clone(), true).await.unwrap();
        handle.push(completed(1, ""));
        cb.wait_loop(3, 100).await.unwrap();
        cb.close();
    }
    assert_eq!(handle.removed.load(Ordering::SeqCst), 1);
    assert_eq!(handle.closed.load(Ordering::SeqCst), 1);

    // timeout
    let handle = Arc::new(ScriptedHandle::default());
    {
        let cb = CmdCallback::new(handle.clone(), true).await.unwrap();
        assert!(cb.wait_loop(3, 100).await.unwrap_err().is_lock_timeout());
    }
    assert_eq!(handle.removed.load(Ordering::SeqCst), 1);
    assert_eq!(handle.closed.load(Ordering::SeqCst), 1);

    // released without looping
    let handle = Arc::new(ScriptedHandle::default());
    drop(CmdCallback::new(handle.clone(), true).await.unwrap());
    assert_eq!(handle.removed.load(Ordering::SeqCst), 1);
    assert_eq!(handle.closed.load(Ordering::SeqCst), 1);
    assert!(handle.sinks.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn no_delivery_after_close() {
    let handle = Arc::new(ScriptedHandle::default());
    let counts = Counting::default();
    let cb = CmdCallback::with_hooks(handle.clone(), false, counts.clone())
        .await
        .unwrap();
    let observer = cb.observer();
    cb.close();

    // A transport that still holds the sink must not reach the hooks.
    let sink: Arc<dyn CallbackSink> = {
        let keep = Arc::new(ScriptedHandle::default());
        let cb2 = CmdCallback::with_hooks(keep.clone(), false, counts.clone())
            .await
            .unwrap();
        let sink = keep.sinks.lock().unwrap().values().next().cloned().unwrap();
        drop(cb2);
        sink
    };
    sink.finished(completed(1, ""));
    handle.push(completed(1, ""));

    assert_eq!(counts.0.finished.load(Ordering::SeqCst), 0);
    assert!(!observer.is_finished());
    assert_eq!(cb.wait_loop(1, 10).await, Err(CmdError::Closed));
}

#[tokio::test(start_paused = true)]
async fn two_callbacks_on_one_handle() {
    let svc = service(200);
    let handle = svc.submit(Request::delete("/Image", 2)).await.unwrap();
    let driver = CmdCallback::new(handle.clone(), false).await.unwrap();
    let watcher = CmdCallback::new(handle.clone(), false).await.unwrap();

    driver.wait_loop(5, 100).await.unwrap();
    assert_eq!(driver.response(), watcher.response());
    assert!(watcher.is_finished());
}

#[tokio::test(start_paused = true)]
async fn batch_steps_reach_the_hook() {
    let svc = service(100);
    let counts = Counting::default();
    let handle = svc
        .submit(Request::DoAll {
            requests: vec![
                Request::delete("/Image", 1),
                Request::Chgrp {
                    target_type: "/Image".into(),
                    id: 2,
                    group: "lab".into(),
                },
            ],
        })
        .await
        .unwrap();
    let cb = CmdCallback::with_hooks(handle, true, counts.clone())
        .await
        .unwrap();

    cb.wait_loop(10, 500).await.unwrap();
    assert_eq!(counts.0.steps.load(Ordering::SeqCst), 2);
    assert_eq!(counts.0.finished.load(Ordering::SeqCst), 1);
    match cb.response() {
        Some(Response::DoAllRsp { responses }) => {
            assert_eq!(responses.len(), 2);
            assert_eq!(responses[1], Response::Ok);
        }
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(cb.status().map(|s| s.current_step), Some(2));
}

#[tokio::test]
async fn rejected_submission_is_distinct() {
    let svc = service(100);
    let err = svc.submit(Request::delete("", 1)).await.err().unwrap();
    assert!(matches!(err, CmdError::Submission(_)));
    assert!(!err.is_lock_timeout());
}
