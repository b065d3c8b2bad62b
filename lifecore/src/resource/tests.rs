//! Tests for resource state lifecycle

use super::*;
use parking_lot::Mutex;
use tracing_test::traced_test;

/// Backend resolving every call inline, with a few scripted misbehaviours.
#[derive(Default)]
struct ScriptedBackend {
    fail_open: AtomicBool,
    drop_load: AtomicBool,
    close_defers: AtomicU32,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedBackend {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

impl ResourceBackend for ScriptedBackend {
    fn managing_type_name(&self) -> &'static str {
        "Scripted"
    }

    fn short_id(&self) -> u32 {
        42
    }

    fn open(self: Arc<Self>, completion: OpenCompletion) {
        self.calls.lock().push("open");
        if self.fail_open.load(Ordering::SeqCst) {
            completion.failed();
        } else {
            completion.succeeded();
        }
    }

    fn load(self: Arc<Self>, completion: LoadCompletion) {
        self.calls.lock().push("load");
        if self.drop_load.load(Ordering::SeqCst) {
            drop(completion);
        } else {
            completion.succeeded();
        }
    }

    fn unload(self: Arc<Self>, completion: UnloadCompletion) {
        self.calls.lock().push("unload");
        completion.done();
    }

    fn close(self: Arc<Self>, completion: CloseCompletion) {
        self.calls.lock().push("close");
        let deferred = self
            .close_defers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if deferred {
            completion.defer();
        } else {
            completion.done();
        }
    }
}

fn scripted() -> (Arc<ScriptedBackend>, ResourceState<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::default());
    let state = ResourceState::new(Arc::clone(&backend));
    (backend, state)
}

#[tokio::test]
async fn test_acquire_then_release_walks_full_cycle() {
    let (backend, state) = scripted();

    assert!(state.acquire(OperationOrigin::Normal).await);
    let snapshot = state.snapshot().await.unwrap();
    assert_eq!(snapshot.state, LifecycleState::Loaded);
    assert_eq!(snapshot.load_count, 1);
    assert_eq!(state.opened_instances(), 1);
    assert!(!state.can_delete().await);

    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Deleted
    );
    assert_eq!(backend.calls(), vec!["open", "load", "unload", "close"]);
    assert_eq!(state.opened_instances(), 0);
    assert!(state.can_delete().await);

    state.term().await;
    assert!(state.is_termed());
}

#[tokio::test]
async fn test_second_acquire_reuses_loaded_resource() {
    let (backend, state) = scripted();

    assert!(state.acquire(OperationOrigin::Normal).await);
    assert!(state.acquire(OperationOrigin::Normal).await);
    assert_eq!(backend.calls(), vec!["open", "load"]);

    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Retained
    );
    assert_eq!(backend.calls(), vec!["open", "load"]);
    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Deleted
    );
    state.term().await;
}

#[tokio::test]
async fn test_open_failure_rolls_back_and_retry_succeeds() {
    let (backend, state) = scripted();
    backend.fail_open.store(true, Ordering::SeqCst);

    assert!(!state.acquire(OperationOrigin::Normal).await);
    let snapshot = state.snapshot().await.unwrap();
    assert_eq!(snapshot.state, LifecycleState::Closed);
    assert_eq!(snapshot.load_count, 1); // a failed acquire is still a use
    assert_eq!(state.stats().snapshot().total_errors, 1);

    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Deleted
    );

    backend.fail_open.store(false, Ordering::SeqCst);
    assert!(state.acquire(OperationOrigin::Normal).await);
    assert_eq!(backend.calls(), vec!["open", "open", "load"]);

    state.release(OperationOrigin::Normal).await;
    state.term().await;
}

#[traced_test]
#[tokio::test]
async fn test_dropped_load_completion_fails_acquire() {
    let (backend, state) = scripted();
    backend.drop_load.store(true, Ordering::SeqCst);

    assert!(!state.acquire(OperationOrigin::Normal).await);
    assert_eq!(
        state.snapshot().await.unwrap().state,
        LifecycleState::Opened
    );
    assert!(logs_contain("without resolving it"));

    state.release(OperationOrigin::Normal).await;
    assert_eq!(
        state.snapshot().await.unwrap().state,
        LifecycleState::Closed
    );
    state.term().await;
}

#[traced_test]
#[tokio::test]
async fn test_unbalanced_release_does_not_block_later_operations() {
    let (backend, state) = scripted();

    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Retained
    );
    assert!(logs_contain("Release without a matching acquire"));

    assert!(state.acquire(OperationOrigin::Normal).await);
    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Deleted
    );
    assert_eq!(backend.calls(), vec!["open", "load", "unload", "close"]);
    state.term().await;
}

#[tokio::test]
async fn test_unbalanced_streaming_release_keeps_counts() {
    let (_backend, state) = scripted();

    assert!(state.acquire(OperationOrigin::Normal).await);
    state.release(OperationOrigin::Streaming).await;

    let snapshot = state.snapshot().await.unwrap();
    assert_eq!(snapshot.load_count, 1);
    assert_eq!(snapshot.streaming_count, 0);

    state.release(OperationOrigin::Normal).await;
    state.term().await;
}

#[traced_test]
#[tokio::test]
async fn test_normal_release_cannot_undo_streaming_hold() {
    let (backend, state) = scripted();

    assert!(state.acquire(OperationOrigin::Streaming).await);
    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Retained
    );
    assert!(logs_contain("Release without a matching acquire"));

    let snapshot = state.snapshot().await.unwrap();
    assert_eq!(snapshot.state, LifecycleState::Loaded);
    assert_eq!(snapshot.load_count, 1);
    assert_eq!(snapshot.streaming_count, 1);
    assert_eq!(state.opened_instances(), 1);

    assert_eq!(
        state.release(OperationOrigin::Streaming).await,
        ReleaseOutcome::Deleted
    );
    assert_eq!(backend.calls(), vec!["open", "load", "unload", "close"]);
    state.term().await;
}

#[tokio::test]
async fn test_deferred_close_is_retried() {
    let (backend, state) = scripted();
    backend.close_defers.store(2, Ordering::SeqCst);

    assert!(state.acquire(OperationOrigin::Normal).await);
    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Deleted
    );
    assert_eq!(
        backend.calls(),
        vec!["open", "load", "unload", "close", "close", "close"]
    );
    state.term().await;
}

#[tokio::test]
async fn test_callbacks_fire_in_admission_order() {
    let (_backend, state) = scripted();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();

    for i in 0..5 {
        let fired = Arc::clone(&fired);
        let (tx, rx) = oneshot::channel();
        state.acquire_async(OperationOrigin::Normal, move |acquired| {
            fired.lock().push(i);
            let _ = tx.send(acquired);
        });
        waiters.push(rx);
    }

    let results = futures::future::join_all(waiters).await;
    assert!(results.into_iter().all(|r| r == Ok(true)));
    assert_eq!(*fired.lock(), vec![0, 1, 2, 3, 4]);

    for _ in 0..5 {
        state.release(OperationOrigin::Normal).await;
    }
    state.term().await;
}

#[traced_test]
#[tokio::test]
async fn test_calls_after_term_fail_fast() {
    let (backend, state) = scripted();
    state.term().await;

    assert!(!state.acquire(OperationOrigin::Normal).await);
    assert_eq!(
        state.release(OperationOrigin::Normal).await,
        ReleaseOutcome::Retained
    );
    assert!(state.snapshot().await.is_none());
    assert!(backend.calls().is_empty());
    assert!(logs_contain("Acquire on a terminated state"));

    state.term().await;
    assert!(logs_contain("State already terminated"));
}

#[traced_test]
#[tokio::test]
async fn test_term_with_active_use_leaks() {
    let backend = Arc::new(ScriptedBackend::default());
    let config = LifecycleConfig::fast_shutdown().unwrap();
    let state = ResourceState::with_monitoring(
        backend,
        config,
        Arc::new(LifecycleStats::new()),
        ShutdownSignal::new(),
    );

    assert!(state.acquire(OperationOrigin::Normal).await);
    state.term().await;

    assert!(logs_contain("leaking them"));
    assert!(logs_contain("Term unclosed resource state"));
    assert!(logs_contain("load count still active"));
}

#[traced_test]
#[tokio::test]
async fn test_term_at_exit_is_quiet() {
    let shutdown = ShutdownSignal::new();
    let state = ResourceState::with_monitoring(
        Arc::new(ScriptedBackend::default()),
        LifecycleConfig::fast_shutdown().unwrap(),
        Arc::new(LifecycleStats::new()),
        shutdown.clone(),
    );

    assert!(state.acquire(OperationOrigin::Normal).await);
    shutdown.request_exit();
    state.term().await;

    assert!(logs_contain("at exit"));
    assert!(!logs_contain("leaking them"));
}

#[traced_test]
#[tokio::test]
async fn test_drop_without_term_is_reported() {
    {
        let (_backend, _state) = scripted();
    }
    assert!(logs_contain("never terminated"));
}

#[tokio::test]
async fn test_stats_track_operations() {
    let (_backend, state) = scripted();

    state.acquire(OperationOrigin::Normal).await;
    state.release(OperationOrigin::Normal).await;

    let stats = state.stats().snapshot();
    assert_eq!(stats.operations_completed, 2);
    assert_eq!(stats.operations_in_flight, 0);
    assert_eq!(stats.total_errors, 0);
    state.term().await;
}
