//! Infrastructure CRDs
//!
//! Child objects projected from a ControlPlane. Each one names exactly one
//! external cloud resource, using the same deterministic name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::ResourceStatus;

// =============================================================================
// AutoScalingGroup CRD
// =============================================================================

/// AutoScalingGroup requests a cloud autoscaling group running the cluster's
/// control plane instances behind the cluster's target group.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kit.k8s.sh",
    version = "v1alpha1",
    kind = "AutoScalingGroup",
    plural = "autoscalinggroups",
    shortname = "asg",
    status = "ResourceStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clusterName"}"#,
    printcolumn = r#"{"name": "Instances", "type": "integer", "jsonPath": ".spec.instanceCount"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalingGroupSpec {
    /// Owning cluster
    pub cluster_name: String,

    /// Desired capacity of the group
    pub instance_count: u32,
}

// =============================================================================
// NatGateway CRD
// =============================================================================

/// NatGateway requests the NAT gateway giving the cluster's private subnets
/// outbound access.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kit.k8s.sh",
    version = "v1alpha1",
    kind = "NatGateway",
    plural = "natgateways",
    shortname = "ngw",
    status = "ResourceStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clusterName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NatGatewaySpec {
    /// Owning cluster
    #[serde(default)]
    pub cluster_name: String,
}
