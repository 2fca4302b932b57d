//! Operator configuration
//!
//! Built from command line flags in `main.rs`; the library only ever sees
//! [`OperatorConfig`].

use crate::error::{Error, Result};
use std::time::Duration;

// =============================================================================
// Backoff Configuration
// =============================================================================

/// Per-key exponential backoff applied after failed passes
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay after a failure
    pub initial_interval: Duration,
    /// Upper bound on the delay
    pub max_interval: Duration,
    /// Growth factor between consecutive failures
    pub multiplier: f64,
    /// Jitter, 0.0 disables it
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(300),
            multiplier: 2.0,
            randomization_factor: 0.1,
        }
    }
}

// =============================================================================
// Auto Scaling Configuration
// =============================================================================

/// Size bounds applied to every autoscaling group the operator creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoScalingConfig {
    pub min_size: u32,
    pub max_size: u32,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
        }
    }
}

// =============================================================================
// Operator Configuration
// =============================================================================

/// Configuration for the reconciliation engine
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Delay before a converged object is verified again
    pub resync_interval: Duration,
    /// Delay before an object waiting on a dependency is retried
    pub waiting_requeue: Duration,
    /// Timeout applied to each cloud call
    pub call_timeout: Duration,
    /// Failure backoff
    pub backoff: BackoffConfig,
    /// Autoscaling group size bounds
    pub auto_scaling: AutoScalingConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(300),
            waiting_requeue: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            auto_scaling: AutoScalingConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be at least 1".into()));
        }
        if self.auto_scaling.min_size > self.auto_scaling.max_size {
            return Err(Error::Configuration(format!(
                "autoscaling min size {} exceeds max size {}",
                self.auto_scaling.min_size, self.auto_scaling.max_size
            )));
        }
        if self.backoff.initial_interval > self.backoff.max_interval {
            return Err(Error::Configuration(
                "backoff initial interval exceeds max interval".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.backoff.randomization_factor) {
            return Err(Error::Configuration(
                "backoff randomization factor must be in [0, 1)".into(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Configuration("cloud call timeout must be non-zero".into()));
        }
        Ok(())
    }
}
