//! Lifecycle configuration with type-safe validation.
//!
//! Every tunable is a `nutype` wrapper validated at construction, so a
//! `LifecycleConfig` that exists is always usable.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of rounds `term` waits for in-flight operations before giving up.
///
/// Validated to be between 1 and 1000 so termination is always bounded.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct TermDrainAttempts(u32);

/// Pause between two drain rounds of `term`, in milliseconds.
///
/// Zero means the rounds only flush the resource's queue.
#[nutype(
    validate(less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct TermWaitIntervalMs(u64);

impl TermWaitIntervalMs {
    /// Convert to Duration for use with `tokio::time::sleep`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Latency above which a finished operation is reported as slow.
///
/// Validated to be between 1ms and 1 hour.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct SlowOperationThresholdMs(u64);

impl SlowOperationThresholdMs {
    /// Convert to Duration for latency comparisons.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Configuration shared by every resource state of a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How many rounds `term` waits for in-flight operations.
    pub term_drain_attempts: TermDrainAttempts,
    /// Pause between two drain rounds.
    pub term_wait_interval: TermWaitIntervalMs,
    /// Operations slower than this are logged as warnings.
    pub slow_operation_threshold: SlowOperationThresholdMs,
}

impl LifecycleConfig {
    /// Create a configuration with safe defaults.
    ///
    /// # Errors
    ///
    /// Returns validation errors if any of the default values are invalid
    /// (which should never happen with proper constants).
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            term_drain_attempts: TermDrainAttempts::try_new(10)?,
            term_wait_interval: TermWaitIntervalMs::try_new(1)?,
            slow_operation_threshold: SlowOperationThresholdMs::try_new(5_000)?,
        })
    }

    /// Terminate quickly, leaking whatever is still in flight.
    ///
    /// Useful for process exit where waiting buys nothing.
    pub fn fast_shutdown() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            term_drain_attempts: TermDrainAttempts::try_new(1)?,
            term_wait_interval: TermWaitIntervalMs::try_new(0)?,
            slow_operation_threshold: SlowOperationThresholdMs::try_new(5_000)?,
        })
    }

    /// Give slow backends more time to finish before termination.
    pub fn patient_shutdown() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            term_drain_attempts: TermDrainAttempts::try_new(100)?,
            term_wait_interval: TermWaitIntervalMs::try_new(20)?,
            slow_operation_threshold: SlowOperationThresholdMs::try_new(30_000)?,
        })
    }

    /// Set the number of drain rounds.
    #[must_use]
    pub const fn with_term_drain_attempts(mut self, attempts: TermDrainAttempts) -> Self {
        self.term_drain_attempts = attempts;
        self
    }

    /// Set the pause between drain rounds.
    #[must_use]
    pub const fn with_term_wait_interval(mut self, interval: TermWaitIntervalMs) -> Self {
        self.term_wait_interval = interval;
        self
    }

    /// Set the slow operation threshold.
    #[must_use]
    pub const fn with_slow_operation_threshold(
        mut self,
        threshold: SlowOperationThresholdMs,
    ) -> Self {
        self.slow_operation_threshold = threshold;
        self
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::new().expect("Default lifecycle configuration should always be valid")
    }
}

/// Process-level "we are exiting" flag.
///
/// Shared by a registry and all of its states. Once exit is requested,
/// terminating a state that is still open is expected and logged quietly.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    /// Create a signal with no exit requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the shutdown as intentional.
    pub fn request_exit(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether an intentional exit is in progress.
    pub fn is_exit_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_config_validation() {
        assert!(TermDrainAttempts::try_new(10).is_ok());
        assert!(TermWaitIntervalMs::try_new(0).is_ok());
        assert!(SlowOperationThresholdMs::try_new(1).is_ok());

        assert!(TermDrainAttempts::try_new(0).is_err()); // Unbounded wait is not allowed
        assert!(TermDrainAttempts::try_new(1_001).is_err());
        assert!(TermWaitIntervalMs::try_new(10_001).is_err());
        assert!(SlowOperationThresholdMs::try_new(0).is_err());
    }

    #[test]
    fn test_presets() {
        let default = LifecycleConfig::default();
        let fast = LifecycleConfig::fast_shutdown().unwrap();
        let patient = LifecycleConfig::patient_shutdown().unwrap();

        let default_attempts: u32 = default.term_drain_attempts.into();
        let fast_attempts: u32 = fast.term_drain_attempts.into();
        let patient_attempts: u32 = patient.term_drain_attempts.into();
        assert_eq!(default_attempts, 10);
        assert!(fast_attempts < default_attempts);
        assert!(patient_attempts > default_attempts);

        assert_eq!(fast.term_wait_interval.as_duration(), Duration::ZERO);
    }

    #[test]
    fn test_builder_overrides() {
        let config = LifecycleConfig::default()
            .with_term_drain_attempts(TermDrainAttempts::try_new(3).unwrap())
            .with_slow_operation_threshold(SlowOperationThresholdMs::try_new(250).unwrap());

        let attempts: u32 = config.term_drain_attempts.into();
        assert_eq!(attempts, 3);
        assert_eq!(
            config.slow_operation_threshold.as_duration(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_config_serializes() {
        let config = LifecycleConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LifecycleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.term_drain_attempts, config.term_drain_attempts);
    }

    #[test]
    fn test_shutdown_signal_is_shared() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_exit_requested());
        signal.request_exit();
        assert!(clone.is_exit_requested());
    }
}
