//! Property tests for resource lifecycle ordering and counting.
//!
//! Random sequences of acquires and releases are fired at a state without
//! waiting in between, against a backend with random latency. Whatever the
//! interleaving, the answers must come back in admission order, the counts
//! must add up and the resource must end up closed once every use is gone.

use std::sync::Arc;
use std::time::Duration;

use lifecore::resource::{
    LifecycleState, OperationOrigin, ReleaseOutcome, ReleaseReply, ResourceState,
};
use lifecore_memory::{BackendCall, Latency, MockBackend};
use parking_lot::Mutex;
use proptest::prelude::*;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy)]
enum Request {
    Acquire(OperationOrigin),
    Release(OperationOrigin),
}

fn arb_origin() -> impl Strategy<Value = OperationOrigin> {
    prop_oneof![
        3 => Just(OperationOrigin::Normal),
        1 => Just(OperationOrigin::Streaming),
    ]
}

/// Sequences where every release has a matching earlier acquire of the
/// same origin.
fn arb_balanced_requests() -> impl Strategy<Value = Vec<Request>> {
    prop::collection::vec((any::<bool>(), arb_origin()), 1..24).prop_map(|raw| {
        let mut normal = 0u32;
        let mut streaming = 0u32;
        raw.into_iter()
            .map(|(acquire, origin)| {
                let held = match origin {
                    OperationOrigin::Normal => &mut normal,
                    OperationOrigin::Streaming => &mut streaming,
                };
                if acquire || *held == 0 {
                    *held += 1;
                    Request::Acquire(origin)
                } else {
                    *held -= 1;
                    Request::Release(origin)
                }
            })
            .collect()
    })
}

fn arb_latency() -> impl Strategy<Value = Latency> {
    prop_oneof![
        Just(Latency::None),
        (0u64..3).prop_map(|ms| Latency::Fixed(Duration::from_millis(ms))),
        Just(Latency::Random {
            min: Duration::ZERO,
            max: Duration::from_millis(2),
        }),
    ]
}

/// Fire every request without waiting, then wait for all answers.
/// Returns the admission indices in the order the callbacks fired.
async fn fire_all(state: &ResourceState<MockBackend>, requests: &[Request]) -> Vec<usize> {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let mut answers = Vec::new();

    for (i, request) in requests.iter().enumerate() {
        let fired = Arc::clone(&fired);
        let (tx, rx) = oneshot::channel::<()>();
        match *request {
            Request::Acquire(origin) => state.acquire_async(origin, move |_| {
                fired.lock().push(i);
                let _ = tx.send(());
            }),
            Request::Release(origin) => {
                state.release_async(origin, ReleaseReply::send, move |_| {
                    fired.lock().push(i);
                    let _ = tx.send(());
                });
            }
        }
        answers.push(rx);
    }

    futures::future::join_all(answers).await;
    let order = fired.lock().clone();
    order
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_callbacks_fire_in_admission_order(
        requests in arb_balanced_requests(),
        latency in arb_latency(),
        streamed in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut backend = MockBackend::new(1).with_latency(latency);
            if streamed {
                backend = backend.streamed();
            }
            let state = ResourceState::new(Arc::new(backend));

            let order = fire_all(&state, &requests).await;
            let expected: Vec<usize> = (0..requests.len()).collect();
            prop_assert_eq!(order, expected);

            let held_normal = requests.iter().fold(0i64, |n, r| match r {
                Request::Acquire(OperationOrigin::Normal) => n + 1,
                Request::Release(OperationOrigin::Normal) => n - 1,
                _ => n,
            });
            let held_streaming = requests.iter().fold(0i64, |n, r| match r {
                Request::Acquire(OperationOrigin::Streaming) => n + 1,
                Request::Release(OperationOrigin::Streaming) => n - 1,
                _ => n,
            });
            let snapshot = state.snapshot().await.unwrap();
            prop_assert_eq!(i64::from(snapshot.load_count), held_normal + held_streaming);
            prop_assert_eq!(i64::from(snapshot.streaming_count), held_streaming);
            prop_assert_eq!(i64::from(state.opened_instances()), held_normal + held_streaming);

            state.term().await;
            Ok(())
        })?;
    }

    #[test]
    fn prop_releasing_everything_closes_the_resource(
        requests in arb_balanced_requests(),
        latency in arb_latency(),
        streamed in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut backend = MockBackend::new(2).with_latency(latency);
            if streamed {
                backend = backend.streamed();
            }
            let backend = Arc::new(backend);
            let state = ResourceState::new(Arc::clone(&backend));

            fire_all(&state, &requests).await;

            // Balance whatever is still held.
            let mut remaining = Vec::new();
            for request in &requests {
                match *request {
                    Request::Acquire(origin) => remaining.push(origin),
                    Request::Release(origin) => {
                        if let Some(pos) = remaining.iter().position(|o| *o == origin) {
                            remaining.remove(pos);
                        }
                    }
                }
            }
            let mut last = None;
            for origin in remaining {
                last = Some(state.release(origin).await);
            }
            if let Some(outcome) = last {
                prop_assert_eq!(outcome, ReleaseOutcome::Deleted);
            }

            let snapshot = state.snapshot().await.unwrap();
            prop_assert_eq!(snapshot.state, LifecycleState::Closed);
            prop_assert_eq!(snapshot.load_count, 0);
            prop_assert_eq!(snapshot.streaming_count, 0);
            prop_assert!(snapshot.is_deletable());

            // Every open was matched by a close, every load by an unload.
            prop_assert_eq!(
                backend.call_count(BackendCall::Open),
                backend.call_count(BackendCall::Close)
            );
            prop_assert_eq!(
                backend.call_count(BackendCall::Load),
                backend.call_count(BackendCall::Unload)
            );

            state.term().await;
            Ok(())
        })?;
    }
}
