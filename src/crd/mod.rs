//! Custom Resource Definitions for the KIT operator
//!
//! This module contains all CRD types:
//! - ControlPlane: the parent object, one per cluster
//! - AutoScalingGroup: control plane instances behind a target group
//! - NatGateway: outbound access for private subnets

pub mod control_plane;
pub mod infrastructure;
pub mod object;
pub mod status;

pub use control_plane::*;
pub use infrastructure::*;
pub use object::*;
pub use status::*;

/// Label and cloud tag carrying the owning cluster's name
pub const CLUSTER_NAME_LABEL: &str = "kit.k8s.sh/cluster-name";
