//! Resource Controllers
//!
//! One controller per [`ResourceKind`]. Controllers recompute everything from
//! observation on every pass and never retry on their own; the dispatcher
//! turns their [`Outcome`] or error into a status and a requeue.

pub mod autoscaling_group;
pub mod context;
pub mod control_plane;
pub mod finalizer;
pub mod nat_gateway;

pub use autoscaling_group::AutoScalingGroupController;
pub use context::ReconcileContext;
pub use control_plane::{
    AutoScalingGroupProjection, ControlPlaneController, NatGatewayProjection, Projection,
};
pub use finalizer::FINALIZER;
pub use nat_gateway::NatGatewayController;

use crate::crd::{DesiredObject, Phase, ResourceKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Outcome
// =============================================================================

/// Unmet dependency or operation still in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitReason {
    /// No private subnets tagged for the cluster yet
    PrivateSubnets,
    /// The expected target group does not exist yet
    TargetGroup,
    /// A stale target group was detached; the expected one is attached next
    TargetGroupAttachment,
    /// The provider is still tearing down a group of the same name
    AutoScalingGroupDeleting,
    /// The NAT gateway is being provisioned
    NatGatewayPending,
    /// A failed NAT gateway is being removed before it is recreated
    NatGatewayReplacing,
}

impl std::fmt::Display for WaitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitReason::PrivateSubnets => write!(f, "waiting for private subnets"),
            WaitReason::TargetGroup => write!(f, "waiting for target group"),
            WaitReason::TargetGroupAttachment => {
                write!(f, "waiting for target group attachment")
            }
            WaitReason::AutoScalingGroupDeleting => {
                write!(f, "waiting for autoscaling group deletion to finish")
            }
            WaitReason::NatGatewayPending => write!(f, "waiting for NAT gateway to become available"),
            WaitReason::NatGatewayReplacing => write!(f, "waiting for failed NAT gateway removal"),
        }
    }
}

/// Successful result of a reconcile or finalize pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// External resource matches the desired state
    Created,
    /// External resource is absent or its deletion has been issued
    Terminated,
    /// Retry shortly
    Waiting(WaitReason),
}

impl Outcome {
    /// Phase recorded in the object status
    pub fn phase(&self) -> Phase {
        match self {
            Outcome::Created => Phase::Created,
            Outcome::Terminated => Phase::Terminated,
            Outcome::Waiting(_) => Phase::Waiting,
        }
    }

    /// Reason recorded in the object status
    pub fn reason(&self) -> Option<String> {
        match self {
            Outcome::Waiting(reason) => Some(reason.to_string()),
            _ => None,
        }
    }

    /// Label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Terminated => "terminated",
            Outcome::Waiting(_) => "waiting",
        }
    }
}

// =============================================================================
// Controller Contract
// =============================================================================

/// Reconciler for one kind of desired-state object.
///
/// Both methods must be idempotent: calling them again with nothing changed
/// issues no mutating cloud call.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Stable identifier used in logs and metrics
    fn name(&self) -> &'static str;

    /// Kind handled by this controller
    fn kind(&self) -> ResourceKind;

    /// Converge the external resource toward `object`
    async fn reconcile(&self, ctx: &ReconcileContext, object: &DesiredObject) -> Result<Outcome>;

    /// Drive the external resource to absent. Absent already is success.
    async fn finalize(&self, ctx: &ReconcileContext, object: &DesiredObject) -> Result<Outcome>;
}

pub type ControllerRef = Arc<dyn Controller>;

/// Error for an object routed to the wrong controller
pub(crate) fn unexpected_kind(expected: ResourceKind, object: &DesiredObject) -> Error {
    Error::InvalidObject {
        kind: object.kind().to_string(),
        name: object.name(),
        reason: format!("expected a {} object", expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_status() {
        assert_eq!(Outcome::Created.phase(), Phase::Created);
        assert_eq!(Outcome::Created.reason(), None);

        let waiting = Outcome::Waiting(WaitReason::PrivateSubnets);
        assert_eq!(waiting.phase(), Phase::Waiting);
        assert_eq!(waiting.reason().as_deref(), Some("waiting for private subnets"));
        assert_eq!(waiting.as_str(), "waiting");
    }
}
