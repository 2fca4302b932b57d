//! Closed set of desired-state kinds
//!
//! Dispatch resolves a trigger to a controller by [`ResourceKind`], and
//! controllers receive a [`DesiredObject`], so no code ever inspects types at
//! runtime.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

use super::control_plane::ControlPlane;
use super::infrastructure::{AutoScalingGroup, NatGateway};
use super::status::ResourceStatus;

// =============================================================================
// Resource Kind
// =============================================================================

/// Kinds of desired-state objects handled by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ControlPlane,
    AutoScalingGroup,
    NatGateway,
}

impl ResourceKind {
    /// Every kind, in registration order
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::ControlPlane,
        ResourceKind::AutoScalingGroup,
        ResourceKind::NatGateway,
    ];

    /// Kind name as used by the API server
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ControlPlane => "ControlPlane",
            ResourceKind::AutoScalingGroup => "AutoScalingGroup",
            ResourceKind::NatGateway => "NatGateway",
        }
    }

    /// Suffix appended to the cluster name to name objects of this kind
    pub fn name_suffix(&self) -> &'static str {
        match self {
            ResourceKind::ControlPlane => "control-plane",
            ResourceKind::AutoScalingGroup => "asg",
            ResourceKind::NatGateway => "nat-gateway",
        }
    }

    /// Deterministic object (and external resource) name for a cluster
    pub fn object_name(&self, cluster_name: &str) -> String {
        format!("{}-{}", cluster_name, self.name_suffix())
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Object Key
// =============================================================================

/// Identity of one desired-state object; the unit of work in the queue
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a typed object
    pub fn for_resource<K: Resource>(kind: ResourceKind, object: &K) -> Self {
        Self::new(
            kind,
            object.meta().namespace.clone().unwrap_or_default(),
            object.meta().name.clone().unwrap_or_default(),
        )
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

// =============================================================================
// Desired Object
// =============================================================================

/// A desired-state object of any handled kind
#[derive(Debug, Clone)]
pub enum DesiredObject {
    ControlPlane(ControlPlane),
    AutoScalingGroup(AutoScalingGroup),
    NatGateway(NatGateway),
}

impl DesiredObject {
    /// Kind tag
    pub fn kind(&self) -> ResourceKind {
        match self {
            DesiredObject::ControlPlane(_) => ResourceKind::ControlPlane,
            DesiredObject::AutoScalingGroup(_) => ResourceKind::AutoScalingGroup,
            DesiredObject::NatGateway(_) => ResourceKind::NatGateway,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            DesiredObject::ControlPlane(o) => o.meta(),
            DesiredObject::AutoScalingGroup(o) => o.meta(),
            DesiredObject::NatGateway(o) => o.meta(),
        }
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            DesiredObject::ControlPlane(o) => o.meta_mut(),
            DesiredObject::AutoScalingGroup(o) => o.meta_mut(),
            DesiredObject::NatGateway(o) => o.meta_mut(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            DesiredObject::ControlPlane(o) => o.name_any(),
            DesiredObject::AutoScalingGroup(o) => o.name_any(),
            DesiredObject::NatGateway(o) => o.name_any(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.kind(),
            self.meta().namespace.clone().unwrap_or_default(),
            self.name(),
        )
    }

    /// Cluster this object belongs to. A ControlPlane is its own cluster.
    pub fn cluster_name(&self) -> String {
        match self {
            DesiredObject::ControlPlane(o) => o.name_any(),
            DesiredObject::AutoScalingGroup(o) => o.spec.cluster_name.clone(),
            DesiredObject::NatGateway(o) => o.spec.cluster_name.clone(),
        }
    }

    /// Deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn finalizers(&self) -> &[String] {
        self.meta().finalizers.as_deref().unwrap_or_default()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    pub fn status(&self) -> Option<&ResourceStatus> {
        match self {
            DesiredObject::ControlPlane(o) => o.status.as_ref(),
            DesiredObject::AutoScalingGroup(o) => o.status.as_ref(),
            DesiredObject::NatGateway(o) => o.status.as_ref(),
        }
    }

    pub fn set_status(&mut self, status: ResourceStatus) {
        match self {
            DesiredObject::ControlPlane(o) => o.status = Some(status),
            DesiredObject::AutoScalingGroup(o) => o.status = Some(status),
            DesiredObject::NatGateway(o) => o.status = Some(status),
        }
    }

    pub fn as_control_plane(&self) -> Option<&ControlPlane> {
        match self {
            DesiredObject::ControlPlane(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_auto_scaling_group(&self) -> Option<&AutoScalingGroup> {
        match self {
            DesiredObject::AutoScalingGroup(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_nat_gateway(&self) -> Option<&NatGateway> {
        match self {
            DesiredObject::NatGateway(o) => Some(o),
            _ => None,
        }
    }
}

impl From<ControlPlane> for DesiredObject {
    fn from(object: ControlPlane) -> Self {
        DesiredObject::ControlPlane(object)
    }
}

impl From<AutoScalingGroup> for DesiredObject {
    fn from(object: AutoScalingGroup) -> Self {
        DesiredObject::AutoScalingGroup(object)
    }
}

impl From<NatGateway> for DesiredObject {
    fn from(object: NatGateway) -> Self {
        DesiredObject::NatGateway(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AutoScalingGroupSpec, NatGatewaySpec};

    #[test]
    fn test_object_names_are_derived_from_cluster() {
        assert_eq!(ResourceKind::AutoScalingGroup.object_name("prod"), "prod-asg");
        assert_eq!(ResourceKind::NatGateway.object_name("prod"), "prod-nat-gateway");
    }

    #[test]
    fn test_key_display() {
        let key = ObjectKey::new(ResourceKind::NatGateway, "kit", "prod-nat-gateway");
        assert_eq!(key.to_string(), "NatGateway/kit/prod-nat-gateway");
    }

    #[test]
    fn test_desired_object_accessors() {
        let mut asg = AutoScalingGroup::new(
            "prod-asg",
            AutoScalingGroupSpec {
                cluster_name: "prod".into(),
                instance_count: 2,
            },
        );
        asg.metadata.namespace = Some("kit".into());
        asg.metadata.finalizers = Some(vec!["kit.k8s.sh/finalizer".into()]);

        let object = DesiredObject::from(asg);
        assert_eq!(object.kind(), ResourceKind::AutoScalingGroup);
        assert_eq!(object.cluster_name(), "prod");
        assert_eq!(
            object.key(),
            ObjectKey::new(ResourceKind::AutoScalingGroup, "kit", "prod-asg")
        );
        assert!(object.has_finalizer("kit.k8s.sh/finalizer"));
        assert!(!object.is_deleting());
        assert!(object.as_auto_scaling_group().is_some());
        assert!(object.as_nat_gateway().is_none());
    }

    #[test]
    fn test_status_round_trip_through_enum() {
        let mut object = DesiredObject::from(NatGateway::new(
            "prod-nat-gateway",
            NatGatewaySpec {
                cluster_name: "prod".into(),
            },
        ));
        assert!(object.status().is_none());
        object.set_status(ResourceStatus::new(crate::crd::Phase::Created, None));
        assert_eq!(object.status().map(|s| s.phase), Some(crate::crd::Phase::Created));
    }
}
