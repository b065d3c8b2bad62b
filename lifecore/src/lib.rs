//! `LifeCore` - Asynchronous, reference-counted resource lifecycle manager
//!
//! Expensive resources (sound banks, media files, plugins) go through an
//! open → load → unload → close lifecycle driven by any number of
//! concurrent users. This library keeps one [`ResourceState`] per resource,
//! serialises every transition on a private execution queue, and answers
//! each request strictly in the order it was admitted.
//!
//! The backend doing the real work implements [`ResourceBackend`]; a
//! [`ResourceRegistry`] owns the states and destroys them once nobody uses
//! them anymore.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod errors;
pub mod execution_queue;
pub mod file_tools;
pub mod monitor;
pub mod registry;
pub mod resource;

pub use backend::{FileBackend, FileLoader, ResourceBackend};
pub use config::{LifecycleConfig, ShutdownSignal};
pub use errors::{FileToolsError, QueueError};
pub use execution_queue::{ExecutionQueue, QueueHandle};
pub use monitor::{LifecycleStats, ResourceLeakDetector, StatsSnapshot};
pub use registry::ResourceRegistry;
pub use resource::{
    CloseCompletion, LifecycleState, LoadCompletion, OpenCompletion, OperationOrigin,
    ReleaseOutcome, ResourceState, StateSnapshot, UnloadCompletion,
};
