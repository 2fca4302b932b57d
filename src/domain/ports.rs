//! Domain Ports - Core trait definitions for the operator
//!
//! These traits define the boundaries between the reconciliation engine and
//! external systems: the cloud provider APIs and the store holding
//! desired-state objects. Calls are plain request/response; none of them
//! retries on its own.

use crate::crd::{DesiredObject, ObjectKey, ResourceKind, ResourceStatus};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Auto Scaling Types
// =============================================================================

/// Lifecycle status the provider reports while a group is being deleted
pub const ASG_DELETE_IN_PROGRESS: &str = "Delete in progress";

/// An autoscaling group as described by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingGroupDescription {
    /// Group name
    pub name: String,
    /// Desired instance count
    pub desired_capacity: u32,
    /// Lower size bound
    pub min_size: u32,
    /// Upper size bound
    pub max_size: u32,
    /// Launch template used for new instances
    pub launch_template_name: String,
    /// Subnets the group places instances in
    pub subnet_ids: Vec<String>,
    /// Tags on the group
    pub tags: BTreeMap<String, String>,
    /// Provider lifecycle status, e.g. "Delete in progress"
    pub status: Option<String>,
}

impl AutoScalingGroupDescription {
    /// Check if the provider is already deleting this group
    pub fn is_deleting(&self) -> bool {
        self.status.as_deref() == Some(ASG_DELETE_IN_PROGRESS)
    }
}

/// Request to create an autoscaling group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAutoScalingGroupRequest {
    pub name: String,
    pub desired_capacity: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub launch_template_name: String,
    /// Comma separated subnet ids
    pub vpc_zone_identifier: String,
    pub tags: BTreeMap<String, String>,
}

// =============================================================================
// EC2 Types
// =============================================================================

/// A VPC subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Subnet id (e.g., subnet-0abc)
    pub id: String,
    /// Cluster the subnet was created for
    pub cluster_name: String,
    /// Availability zone
    pub availability_zone: String,
    /// Private subnets have no route to an internet gateway
    pub private: bool,
}

/// NAT gateway lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatGatewayState {
    Pending,
    Available,
    Deleting,
    Deleted,
    Failed,
}

impl std::fmt::Display for NatGatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatGatewayState::Pending => write!(f, "pending"),
            NatGatewayState::Available => write!(f, "available"),
            NatGatewayState::Deleting => write!(f, "deleting"),
            NatGatewayState::Deleted => write!(f, "deleted"),
            NatGatewayState::Failed => write!(f, "failed"),
        }
    }
}

/// A NAT gateway as described by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatGatewayDescription {
    /// Provider id (e.g., nat-0abc)
    pub id: String,
    /// Name tag
    pub name: String,
    pub state: NatGatewayState,
    pub tags: BTreeMap<String, String>,
}

/// Request to create a NAT gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNatGatewayRequest {
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

// =============================================================================
// ELBv2 Types
// =============================================================================

/// A load balancer target group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub name: String,
    pub arn: String,
}

// =============================================================================
// Cloud Ports
// =============================================================================

/// Port for autoscaling group operations
#[async_trait]
pub trait AutoScalingApi: Send + Sync {
    /// Describe groups with the given name. Zero, one or (inconsistently) more.
    async fn describe_auto_scaling_groups(
        &self,
        name: &str,
    ) -> Result<Vec<AutoScalingGroupDescription>>;

    /// Create a group. Fails with `ResourceExists` if the name is taken.
    async fn create_auto_scaling_group(&self, request: CreateAutoScalingGroupRequest) -> Result<()>;

    /// Delete a group; `force` terminates members without lifecycle hooks
    async fn delete_auto_scaling_group(&self, name: &str, force: bool) -> Result<()>;

    /// ARNs of target groups attached to a group
    async fn describe_load_balancer_target_groups(&self, group_name: &str) -> Result<Vec<String>>;

    /// Attach target groups to a group
    async fn attach_load_balancer_target_groups(
        &self,
        group_name: &str,
        target_group_arns: &[String],
    ) -> Result<()>;

    /// Detach target groups from a group
    async fn detach_load_balancer_target_groups(
        &self,
        group_name: &str,
        target_group_arns: &[String],
    ) -> Result<()>;
}

/// Port for EC2 operations
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Subnets tagged for a cluster
    async fn describe_subnets(&self, cluster_name: &str) -> Result<Vec<Subnet>>;

    /// NAT gateways with the given name tag, excluding deleted ones
    async fn describe_nat_gateways(&self, name: &str) -> Result<Vec<NatGatewayDescription>>;

    /// Create a NAT gateway. Fails with `ResourceExists` if the name is taken.
    async fn create_nat_gateway(&self, request: CreateNatGatewayRequest) -> Result<NatGatewayDescription>;

    /// Delete a NAT gateway by id
    async fn delete_nat_gateway(&self, id: &str) -> Result<()>;
}

/// Port for load balancer operations
#[async_trait]
pub trait Elbv2Api: Send + Sync {
    /// Find a target group by name. `None` if it does not exist.
    async fn find_target_group(&self, name: &str) -> Result<Option<TargetGroup>>;
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Port for the store holding desired-state objects
///
/// The store owns object removal: deleting an object with finalizers only
/// sets its deletion marker, and removing the last finalizer of a
/// deletion-marked object removes it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object. `None` if it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<DesiredObject>>;

    /// List every object of a kind
    async fn list(&self, kind: ResourceKind) -> Result<Vec<DesiredObject>>;

    /// Create an object. Fails with `ResourceExists` if the key is taken.
    async fn create(&self, object: DesiredObject) -> Result<DesiredObject>;

    /// Replace the status subresource
    async fn update_status(&self, key: &ObjectKey, status: &ResourceStatus) -> Result<()>;

    /// Add a finalizer token if missing
    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()>;

    /// Remove a finalizer token. Missing objects are not an error.
    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()>;

    /// Request deletion. Missing objects are not an error.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type AutoScalingApiRef = Arc<dyn AutoScalingApi>;
pub type Ec2ApiRef = Arc<dyn Ec2Api>;
pub type Elbv2ApiRef = Arc<dyn Elbv2Api>;
pub type ObjectStoreRef = Arc<dyn ObjectStore>;
