//! In-memory mock backend for `LifeCore`
//!
//! This crate provides [`MockBackend`], a [`ResourceBackend`] whose every
//! outcome is scripted: open and load can be made to fail, unload and close
//! to defer a given number of times, each call can be delayed or held at a
//! manual gate, and every call and state transition is recorded. It is
//! meant for tests and development where no real resource exists.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lifecore::backend::ResourceBackend;
use lifecore::resource::{
    CloseCompletion, LifecycleState, LoadCompletion, OpenCompletion, StateSnapshot,
    UnloadCompletion,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, Semaphore};
use tracing::trace;

/// One of the four backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    /// `open`
    Open,
    /// `load`
    Load,
    /// `unload`
    Unload,
    /// `close`
    Close,
}

/// Delay applied before a completion is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Latency {
    /// Resolve inline, before the backend call returns.
    #[default]
    None,
    /// Resolve after a fixed delay.
    Fixed(Duration),
    /// Resolve after a delay drawn uniformly from `min..=max`.
    Random {
        /// Shortest delay
        min: Duration,
        /// Longest delay
        max: Duration,
    },
}

impl Latency {
    fn sample(self) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed(delay) => Some(delay),
            Self::Random { min, max } if max <= min => Some(min),
            Self::Random { min, max } => {
                let lo = u64::try_from(min.as_micros()).unwrap_or(u64::MAX);
                let hi = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
                Some(Duration::from_micros(rand::rng().random_range(lo..=hi)))
            }
        }
    }
}

type Predicate = Arc<dyn Fn(&StateSnapshot) -> bool + Send + Sync>;

#[derive(Default)]
struct Predicates {
    can_open: Option<Predicate>,
    can_load: Option<Predicate>,
    can_unload: Option<Predicate>,
    can_close: Option<Predicate>,
}

/// Scriptable backend for tests.
///
/// Build it with the `with_*` methods, then share it with a resource state
/// through an `Arc`. Outcomes can still be changed afterwards with the
/// `set_*` methods.
pub struct MockBackend {
    managing_type: &'static str,
    short_id: u32,
    streamed: bool,
    latency: Latency,
    predicates: Predicates,
    gates: HashMap<BackendCall, Arc<Semaphore>>,
    open_succeeds: AtomicBool,
    load_succeeds: AtomicBool,
    unload_defers: AtomicU32,
    close_defers: AtomicU32,
    unload_closes: AtomicBool,
    calls: Mutex<Vec<BackendCall>>,
    transitions: Mutex<Vec<(LifecycleState, LifecycleState)>>,
    call_made: Notify,
}

impl MockBackend {
    /// A backend for resource `short_id` that succeeds at everything,
    /// immediately.
    pub fn new(short_id: u32) -> Self {
        Self {
            managing_type: "Mock",
            short_id,
            streamed: false,
            latency: Latency::None,
            predicates: Predicates::default(),
            gates: HashMap::new(),
            open_succeeds: AtomicBool::new(true),
            load_succeeds: AtomicBool::new(true),
            unload_defers: AtomicU32::new(0),
            close_defers: AtomicU32::new(0),
            unload_closes: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            transitions: Mutex::new(Vec::new()),
            call_made: Notify::new(),
        }
    }

    /// Diagnostic tag reported as the managing type.
    #[must_use]
    pub const fn with_managing_type(mut self, managing_type: &'static str) -> Self {
        self.managing_type = managing_type;
        self
    }

    /// Mark the resource as streamed.
    #[must_use]
    pub const fn streamed(mut self) -> Self {
        self.streamed = true;
        self
    }

    /// Delay every completion.
    #[must_use]
    pub const fn with_latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    /// Hold `call` until [`open_gate`](Self::open_gate) lets it through.
    #[must_use]
    pub fn with_gate(mut self, call: BackendCall) -> Self {
        self.gates.insert(call, Arc::new(Semaphore::new(0)));
        self
    }

    /// Make every open fail.
    #[must_use]
    pub fn with_failing_open(self) -> Self {
        self.set_open_succeeds(false);
        self
    }

    /// Make every load fail.
    #[must_use]
    pub fn with_failing_load(self) -> Self {
        self.set_load_succeeds(false);
        self
    }

    /// Defer the next `count` unloads.
    #[must_use]
    pub fn with_unload_defers(self, count: u32) -> Self {
        self.set_unload_defers(count);
        self
    }

    /// Defer the next `count` closes.
    #[must_use]
    pub fn with_close_defers(self, count: u32) -> Self {
        self.set_close_defers(count);
        self
    }

    /// Report every successful unload as having closed the resource too.
    #[must_use]
    pub fn with_unload_to_closed(self) -> Self {
        self.unload_closes.store(true, Ordering::SeqCst);
        self
    }

    /// Replace the open rule.
    #[must_use]
    pub fn with_can_open<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&StateSnapshot) -> bool + Send + Sync + 'static,
    {
        self.predicates.can_open = Some(Arc::new(predicate));
        self
    }

    /// Replace the load rule.
    #[must_use]
    pub fn with_can_load<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&StateSnapshot) -> bool + Send + Sync + 'static,
    {
        self.predicates.can_load = Some(Arc::new(predicate));
        self
    }

    /// Replace the unload rule.
    #[must_use]
    pub fn with_can_unload<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&StateSnapshot) -> bool + Send + Sync + 'static,
    {
        self.predicates.can_unload = Some(Arc::new(predicate));
        self
    }

    /// Replace the close rule.
    #[must_use]
    pub fn with_can_close<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&StateSnapshot) -> bool + Send + Sync + 'static,
    {
        self.predicates.can_close = Some(Arc::new(predicate));
        self
    }

    /// Whether opens succeed from now on.
    pub fn set_open_succeeds(&self, succeeds: bool) {
        self.open_succeeds.store(succeeds, Ordering::SeqCst);
    }

    /// Whether loads succeed from now on.
    pub fn set_load_succeeds(&self, succeeds: bool) {
        self.load_succeeds.store(succeeds, Ordering::SeqCst);
    }

    /// Defer the next `count` unloads.
    pub fn set_unload_defers(&self, count: u32) {
        self.unload_defers.store(count, Ordering::SeqCst);
    }

    /// Defer the next `count` closes.
    pub fn set_close_defers(&self, count: u32) {
        self.close_defers.store(count, Ordering::SeqCst);
    }

    /// Let one held `call` through. Permits accumulate, so a gate may be
    /// opened before the call reaches it.
    ///
    /// # Panics
    ///
    /// Panics if `call` was not gated with [`with_gate`](Self::with_gate).
    pub fn open_gate(&self, call: BackendCall) {
        let Some(gate) = self.gates.get(&call) else {
            panic!("{call:?} is not gated");
        };
        gate.add_permits(1);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// How many times `call` was received.
    pub fn call_count(&self, call: BackendCall) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    /// Every state change reported so far, in order.
    pub fn transitions(&self) -> Vec<(LifecycleState, LifecycleState)> {
        self.transitions.lock().clone()
    }

    /// Wait until `call` has been received at least `count` times.
    pub async fn wait_for_call(&self, call: BackendCall, count: usize) {
        loop {
            let notified = self.call_made.notified();
            if self.call_count(call) >= count {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, call: BackendCall) {
        trace!(short_id = self.short_id, ?call, "Mock backend call");
        self.calls.lock().push(call);
        self.call_made.notify_waiters();
    }

    /// Resolve through `resolve`, inline or on a spawned task when the call
    /// is delayed or gated.
    fn resolve_with<F>(&self, call: BackendCall, resolve: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.latency.sample();
        let gate = self.gates.get(&call).cloned();
        if delay.is_none() && gate.is_none() {
            resolve();
            return;
        }

        tokio::spawn(async move {
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            resolve();
        });
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ResourceBackend for MockBackend {
    fn managing_type_name(&self) -> &'static str {
        self.managing_type
    }

    fn short_id(&self) -> u32 {
        self.short_id
    }

    fn is_streamed(&self) -> bool {
        self.streamed
    }

    fn can_open(&self, snapshot: &StateSnapshot) -> bool {
        self.predicates
            .can_open
            .as_ref()
            .map_or_else(|| snapshot.default_can_open(), |p| p(snapshot))
    }

    fn can_load(&self, snapshot: &StateSnapshot) -> bool {
        self.predicates.can_load.as_ref().map_or_else(
            || snapshot.default_can_load(self.streamed),
            |p| p(snapshot),
        )
    }

    fn can_unload(&self, snapshot: &StateSnapshot) -> bool {
        self.predicates.can_unload.as_ref().map_or_else(
            || snapshot.default_can_unload(self.streamed),
            |p| p(snapshot),
        )
    }

    fn can_close(&self, snapshot: &StateSnapshot) -> bool {
        self.predicates
            .can_close
            .as_ref()
            .map_or_else(|| snapshot.default_can_close(), |p| p(snapshot))
    }

    fn on_transition(&self, from: LifecycleState, to: LifecycleState) {
        self.transitions.lock().push((from, to));
    }

    fn open(self: Arc<Self>, completion: OpenCompletion) {
        self.record(BackendCall::Open);
        let succeeds = self.open_succeeds.load(Ordering::SeqCst);
        self.resolve_with(BackendCall::Open, move || {
            if succeeds {
                completion.succeeded();
            } else {
                completion.failed();
            }
        });
    }

    fn load(self: Arc<Self>, completion: LoadCompletion) {
        self.record(BackendCall::Load);
        let succeeds = self.load_succeeds.load(Ordering::SeqCst);
        self.resolve_with(BackendCall::Load, move || {
            if succeeds {
                completion.succeeded();
            } else {
                completion.failed();
            }
        });
    }

    fn unload(self: Arc<Self>, completion: UnloadCompletion) {
        self.record(BackendCall::Unload);
        let defers = take_one(&self.unload_defers);
        let closes = self.unload_closes.load(Ordering::SeqCst);
        self.resolve_with(BackendCall::Unload, move || {
            if defers {
                completion.defer();
            } else if closes {
                completion.done_and_closed();
            } else {
                completion.done();
            }
        });
    }

    fn close(self: Arc<Self>, completion: CloseCompletion) {
        self.record(BackendCall::Close);
        let defers = take_one(&self.close_defers);
        self.resolve_with(BackendCall::Close, move || {
            if defers {
                completion.defer();
            } else {
                completion.done();
            }
        });
    }
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend")
            .field("managing_type", &self.managing_type)
            .field("short_id", &self.short_id)
            .field("streamed", &self.streamed)
            .field("latency", &self.latency)
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_latency_is_exact() {
        let delay = Duration::from_millis(3);
        assert_eq!(Latency::Fixed(delay).sample(), Some(delay));
        assert_eq!(Latency::None.sample(), None);
    }

    #[test]
    fn test_random_latency_stays_in_range() {
        let min = Duration::from_micros(100);
        let max = Duration::from_micros(900);
        for _ in 0..100 {
            let delay = Latency::Random { min, max }.sample().unwrap();
            assert!(delay >= min && delay <= max);
        }
        assert_eq!(Latency::Random { min: max, max: min }.sample(), Some(max));
    }

    #[test]
    fn test_predicate_override() {
        let backend = MockBackend::new(1).with_can_load(|_| false);
        let snapshot = StateSnapshot {
            state: LifecycleState::Opened,
            load_count: 1,
            ..StateSnapshot::default()
        };
        assert!(!backend.can_load(&snapshot));
        assert!(backend.can_close(&StateSnapshot {
            state: LifecycleState::Opened,
            ..StateSnapshot::default()
        }));
    }

    #[test]
    fn test_defer_counter_runs_out() {
        let counter = AtomicU32::new(2);
        assert!(take_one(&counter));
        assert!(take_one(&counter));
        assert!(!take_one(&counter));
    }
}
