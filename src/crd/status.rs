//! Status model shared by every desired-state object

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome of the last reconcile pass, as seen by users of the object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    /// A dependency is unmet or an operation is in flight
    #[default]
    Waiting,
    /// The external resource matches the desired state
    Created,
    /// The external resource is confirmed absent
    Terminated,
    /// Non-retryable failure; needs an operator
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Waiting => write!(f, "Waiting"),
            Phase::Created => write!(f, "Created"),
            Phase::Terminated => write!(f, "Terminated"),
            Phase::Error => write!(f, "Error"),
        }
    }
}

/// Status subresource of every infrastructure object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Current phase
    #[serde(default)]
    pub phase: Phase,

    /// Why the object is waiting or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the phase or reason last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ResourceStatus {
    /// Build a status stamped with the current time
    pub fn new(phase: Phase, reason: Option<String>) -> Self {
        Self {
            phase,
            reason,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// Phase and reason match, ignoring the timestamp
    pub fn same_as(&self, phase: Phase, reason: Option<&str>) -> bool {
        self.phase == phase && self.reason.as_deref() == reason
    }
}
