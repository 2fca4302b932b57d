//! ControlPlane CRD
//!
//! The parent object. One ControlPlane implies a fixed set of child
//! infrastructure objects (NAT gateway, autoscaling group, ...), each
//! reconciled by its own controller.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::ResourceStatus;

// =============================================================================
// ControlPlane CRD
// =============================================================================

/// ControlPlane describes a Kubernetes control plane running on cloud compute.
/// Its name is the cluster name used to derive every child object's name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kit.k8s.sh",
    version = "v1alpha1",
    kind = "ControlPlane",
    plural = "controlplanes",
    shortname = "cp",
    status = "ResourceStatus",
    printcolumn = r#"{"name": "Instances", "type": "integer", "jsonPath": ".spec.instanceCount"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Number of control plane instances
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,
}

impl Default for ControlPlaneSpec {
    fn default() -> Self {
        Self {
            instance_count: default_instance_count(),
        }
    }
}

fn default_instance_count() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: ControlPlaneSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.instance_count, 3);
    }
}
