//! Type definitions for resource lifecycle management
//!
//! This module contains the lifecycle state enumeration, the origin of a
//! request, and the read-only snapshot handed to backend predicates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a managed resource.
///
/// The regular path is `Closed → Opening → Opened → Loading → Loaded` on the
/// way up and `Loaded → Unloading → Opened → Closing → Closed` on the way
/// down. The four merge states resolve an acquire racing a release:
///
/// - `WillReload`: an acquire arrived while unloading; the unload finishes
///   first.
/// - `WillReopen`: an acquire arrived while closing; the close finishes first.
/// - `CanReload` / `CanReopen`: the racing unload or close is over and the
///   waiting acquire may proceed from `Opened` / `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Nothing is open.
    #[default]
    Closed,
    /// The backend is opening the resource.
    Opening,
    /// Open but not loaded.
    Opened,
    /// The backend is loading the resource.
    Loading,
    /// Fully available.
    Loaded,
    /// The backend is unloading the resource.
    Unloading,
    /// The backend is closing the resource.
    Closing,
    /// Unloading, with an acquire waiting for it to finish.
    WillReload,
    /// Closing, with an acquire waiting for it to finish.
    WillReopen,
    /// A racing unload finished; equivalent to `Opened` for the next acquire.
    CanReload,
    /// A racing close finished; equivalent to `Closed` for the next acquire.
    CanReopen,
}

impl LifecycleState {
    /// Whether a backend call is outstanding. New work must wait.
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Opening
                | Self::Loading
                | Self::Unloading
                | Self::Closing
                | Self::WillReload
                | Self::WillReopen
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why an acquire or release was requested.
///
/// Streaming requests are tracked separately because a streamed resource
/// is only loaded while streaming users exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OperationOrigin {
    /// General use.
    #[default]
    Normal,
    /// A streaming user.
    Streaming,
}

/// Point-in-time view of a resource state, as seen from its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Current lifecycle phase
    pub state: LifecycleState,
    /// Active acquirers across all origins
    pub load_count: u32,
    /// Active streaming acquirers
    pub streaming_count: u32,
    /// Acquires admitted and not yet balanced by a finished release
    pub opened_instances: u32,
}

impl StateSnapshot {
    /// Default open rule: nothing is open and somebody wants it.
    pub const fn default_can_open(&self) -> bool {
        matches!(self.state, LifecycleState::Closed) && self.load_count > 0
    }

    /// Default load rule: opened, and for streamed resources only while a
    /// streaming user exists.
    pub const fn default_can_load(&self, streamed: bool) -> bool {
        matches!(self.state, LifecycleState::Opened) && (!streamed || self.streaming_count > 0)
    }

    /// Default unload rule: loaded and no longer needed by the relevant users.
    pub const fn default_can_unload(&self, streamed: bool) -> bool {
        matches!(self.state, LifecycleState::Loaded)
            && if streamed {
                self.streaming_count == 0
            } else {
                self.load_count == 0
            }
    }

    /// Default close rule: opened and unused.
    pub const fn default_can_close(&self) -> bool {
        matches!(self.state, LifecycleState::Opened) && self.load_count == 0
    }

    /// Whether the state may be destroyed.
    pub const fn is_deletable(&self) -> bool {
        self.opened_instances == 0
            && matches!(self.state, LifecycleState::Closed)
            && self.load_count == 0
    }
}

/// What happened to a state when a release finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    /// The state is still in use or not fully closed.
    Retained,
    /// The state became deletable and the delete callback ran.
    Deleted,
}
