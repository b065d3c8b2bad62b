//! Error types for `LifeCore`.
//!
//! The lifecycle operations themselves never return errors: acquire and
//! release report their outcome through their completion callback, and
//! contract violations are logged and answered immediately. The types here
//! cover the plumbing around them.
//!
//! # Error Categories
//!
//! - **QueueError**: a job could not be run on a resource's execution queue
//! - **FileToolsError**: reading a resource file into memory failed
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use lifecore::errors::QueueError;
//!
//! match queue.async_wait("inspect", |state| state.len()).await {
//!     Ok(len) => println!("{len} items"),
//!     Err(QueueError::Closed { queue }) => tracing::warn!(%queue, "queue already closed"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by an [`ExecutionQueue`](crate::execution_queue::ExecutionQueue).
///
/// # Error Handling Strategy
///
/// - **Closed**: the owning resource was terminated; treat the job as a no-op
/// - **Reentrant**: a blocking wait was issued from inside the queue itself,
///   which would deadlock; this is a caller bug
/// - **WorkerGone**: the worker stopped before answering (it panicked or the
///   runtime shut down)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue no longer accepts jobs.
    #[error("Execution queue '{queue}' is closed")]
    Closed {
        /// Name of the closed queue
        queue: String,
    },

    /// A blocking wait was requested from the queue's own worker.
    #[error("Execution queue '{queue}' cannot wait on itself")]
    Reentrant {
        /// Name of the queue
        queue: String,
    },

    /// The worker dropped the job without running it.
    #[error("Execution queue '{queue}' dropped job '{job}' before completion")]
    WorkerGone {
        /// Name of the queue
        queue: String,
        /// Debug name of the dropped job
        job: &'static str,
    },
}

/// Errors that can occur while reading a resource file into memory.
#[derive(Debug, Error)]
pub enum FileToolsError {
    /// The file could not be opened or read.
    #[error("Could not read file {path}: {source}")]
    Io {
        /// The file being read
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file exists but holds no data.
    #[error("Empty file {0}")]
    Empty(PathBuf),

    /// The blocking read task was cancelled or panicked.
    #[error("File read task for {path} failed: {reason}")]
    TaskFailed {
        /// The file being read
        path: PathBuf,
        /// Why the task failed
        reason: String,
    },
}

/// Type alias for queue results.
pub type QueueResult<T> = Result<T, QueueError>;

/// Type alias for file tool results.
pub type FileToolsResult<T> = Result<T, FileToolsError>;
