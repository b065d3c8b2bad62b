//! Single-consumer serial execution context.
//!
//! An [`ExecutionQueue`] owns a piece of state `S` inside a spawned tokio
//! task and runs `FnOnce(&mut S)` jobs one at a time, in submission order.
//! The worker is the only code that ever touches `S`, so the state needs no
//! lock. Queues for different resources run in parallel on the runtime's
//! worker threads.
//!
//! The state receives a [`QueueHandle`] at construction so it can post
//! follow-up jobs to itself, and backend completions post through clones of
//! the same handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, trace, trace_span, Instrument, Span};

use crate::errors::{QueueError, QueueResult};

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Message<S> {
    Run { name: &'static str, job: Job<S> },
    Close,
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_QUEUE: u64;
}

/// Cloneable handle used to post jobs onto an [`ExecutionQueue`].
pub struct QueueHandle<S> {
    id: u64,
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Message<S>>,
    closed: Arc<AtomicBool>,
}

impl<S> Clone for QueueHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: Arc::clone(&self.name),
            sender: self.sender.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<S> std::fmt::Debug for QueueHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<S: Send + 'static> QueueHandle<S> {
    /// Run `job` eventually, after every job submitted before it.
    ///
    /// On a closed queue the job is dropped without running and
    /// `QueueError::Closed` is returned.
    pub fn async_op<F>(&self, name: &'static str, job: F) -> QueueResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        self.sender
            .send(Message::Run {
                name,
                job: Box::new(job),
            })
            .map_err(|_| self.closed_error())
    }

    /// Run `job` and wait for its result.
    ///
    /// Calling this from the queue's own worker would deadlock, so it is
    /// refused with `QueueError::Reentrant`.
    pub async fn async_wait<R, F>(&self, name: &'static str, job: F) -> QueueResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        if self.is_running_in_this_context() {
            return Err(QueueError::Reentrant {
                queue: self.name.to_string(),
            });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.async_op(name, move |state| {
            let _ = reply_tx.send(job(state));
        })?;

        reply_rx.await.map_err(|_| QueueError::WorkerGone {
            queue: self.name.to_string(),
            job: name,
        })
    }
}

impl<S> QueueHandle<S> {
    /// Whether the caller is currently running inside this queue's worker.
    pub fn is_running_in_this_context(&self) -> bool {
        CURRENT_QUEUE
            .try_with(|current| *current == self.id)
            .unwrap_or(false)
    }

    /// Whether the queue stopped accepting jobs.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    /// Diagnostic name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn closed_error(&self) -> QueueError {
        QueueError::Closed {
            queue: self.name.to_string(),
        }
    }
}

/// A serial execution context owning its state.
///
/// Dropping the queue closes it; jobs already submitted still run.
pub struct ExecutionQueue<S> {
    handle: QueueHandle<S>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> ExecutionQueue<S> {
    /// Spawn a worker owning the state built by `init`.
    ///
    /// The worker runs inside the caller's current span. Must be called
    /// from within a tokio runtime.
    pub fn new<F>(name: impl Into<String>, init: F) -> Self
    where
        F: FnOnce(QueueHandle<S>) -> S,
    {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = Arc::from(name.into());
        let (sender, receiver) = mpsc::unbounded_channel();

        let handle = QueueHandle {
            id,
            name: Arc::clone(&name),
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        };

        let state = init(handle.clone());
        let worker = run_worker(name, state, receiver).instrument(Span::current());
        let worker = tokio::spawn(CURRENT_QUEUE.scope(id, worker));

        Self {
            handle,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// A new posting handle for this queue.
    pub fn handle(&self) -> QueueHandle<S> {
        self.handle.clone()
    }

    /// See [`QueueHandle::async_op`].
    pub fn async_op<F>(&self, name: &'static str, job: F) -> QueueResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.handle.async_op(name, job)
    }

    /// See [`QueueHandle::async_wait`].
    pub async fn async_wait<R, F>(&self, name: &'static str, job: F) -> QueueResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        self.handle.async_wait(name, job).await
    }

    /// Wait for the worker to finish after [`close_and_delete`](Self::close_and_delete).
    ///
    /// Returns immediately when called from the worker itself.
    pub async fn join(&self) {
        if self.handle.is_running_in_this_context() {
            return;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    error!(queue = %self.handle.name, "Execution queue worker panicked");
                }
            }
        }
    }
}

impl<S> ExecutionQueue<S> {
    /// See [`QueueHandle::is_running_in_this_context`].
    pub fn is_running_in_this_context(&self) -> bool {
        self.handle.is_running_in_this_context()
    }

    /// See [`QueueHandle::is_closed`].
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Diagnostic name of the queue.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Stop accepting jobs. Jobs already queued still run, then the worker
    /// drops the state and exits.
    ///
    /// Returns `false` if the queue was already closed.
    pub fn close_and_delete(&self) -> bool {
        if self.handle.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        trace!(queue = %self.handle.name, "Closing execution queue");
        // The worker may already be gone, in which case there is nothing left to stop.
        let _ = self.handle.sender.send(Message::Close);
        true
    }
}

impl<S> Drop for ExecutionQueue<S> {
    fn drop(&mut self) {
        self.close_and_delete();
    }
}

async fn run_worker<S>(
    queue: Arc<str>,
    mut state: S,
    mut receiver: mpsc::UnboundedReceiver<Message<S>>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Run { name, job } => {
                let _span = trace_span!("queue_job", queue = %queue, job = name).entered();
                job(&mut state);
            }
            Message::Close => receiver.close(),
        }
    }
    trace!(queue = %queue, "Execution queue drained");
}
