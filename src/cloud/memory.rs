//! Simulated cloud provider
//!
//! Keeps autoscaling groups, subnets, NAT gateways and target groups in
//! memory and behaves like the real APIs where it matters to the
//! controllers: creates reject taken names, deletes are asynchronous until
//! [`InMemoryCloud::settle`] runs, and describe calls can be made to lag
//! behind writes. Every call is recorded so tests can assert on call order.

use crate::domain::ports::{
    AutoScalingApi, AutoScalingGroupDescription, CreateAutoScalingGroupRequest,
    CreateNatGatewayRequest, Ec2Api, Elbv2Api, NatGatewayDescription, NatGatewayState, Subnet,
    TargetGroup, ASG_DELETE_IN_PROGRESS,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the simulated provider
#[derive(Debug, Clone)]
pub struct InMemoryCloudConfig {
    /// Region used in generated ARNs
    pub region: String,
    /// Account id used in generated ARNs
    pub account_id: String,
}

impl Default for InMemoryCloudConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            account_id: "000000000000".to_string(),
        }
    }
}

// =============================================================================
// Call Recording
// =============================================================================

/// Provider operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeAutoScalingGroups,
    CreateAutoScalingGroup,
    DeleteAutoScalingGroup,
    DescribeLoadBalancerTargetGroups,
    AttachLoadBalancerTargetGroups,
    DetachLoadBalancerTargetGroups,
    DescribeSubnets,
    DescribeNatGateways,
    CreateNatGateway,
    DeleteNatGateway,
    DescribeTargetGroups,
}

impl Operation {
    /// Provider service owning the operation
    pub fn service(&self) -> &'static str {
        match self {
            Operation::DescribeAutoScalingGroups
            | Operation::CreateAutoScalingGroup
            | Operation::DeleteAutoScalingGroup
            | Operation::DescribeLoadBalancerTargetGroups
            | Operation::AttachLoadBalancerTargetGroups
            | Operation::DetachLoadBalancerTargetGroups => "autoscaling",
            Operation::DescribeSubnets
            | Operation::DescribeNatGateways
            | Operation::CreateNatGateway
            | Operation::DeleteNatGateway => "ec2",
            Operation::DescribeTargetGroups => "elbv2",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    DescribeAutoScalingGroups { name: String },
    CreateAutoScalingGroup { name: String },
    DeleteAutoScalingGroup { name: String, force: bool },
    DescribeLoadBalancerTargetGroups { group: String },
    AttachLoadBalancerTargetGroups { group: String, arns: Vec<String> },
    DetachLoadBalancerTargetGroups { group: String, arns: Vec<String> },
    DescribeSubnets { cluster: String },
    DescribeNatGateways { name: String },
    CreateNatGateway { name: String },
    DeleteNatGateway { id: String },
    DescribeTargetGroups { name: String },
}

impl CloudCall {
    pub fn operation(&self) -> Operation {
        match self {
            CloudCall::DescribeAutoScalingGroups { .. } => Operation::DescribeAutoScalingGroups,
            CloudCall::CreateAutoScalingGroup { .. } => Operation::CreateAutoScalingGroup,
            CloudCall::DeleteAutoScalingGroup { .. } => Operation::DeleteAutoScalingGroup,
            CloudCall::DescribeLoadBalancerTargetGroups { .. } => {
                Operation::DescribeLoadBalancerTargetGroups
            }
            CloudCall::AttachLoadBalancerTargetGroups { .. } => {
                Operation::AttachLoadBalancerTargetGroups
            }
            CloudCall::DetachLoadBalancerTargetGroups { .. } => {
                Operation::DetachLoadBalancerTargetGroups
            }
            CloudCall::DescribeSubnets { .. } => Operation::DescribeSubnets,
            CloudCall::DescribeNatGateways { .. } => Operation::DescribeNatGateways,
            CloudCall::CreateNatGateway { .. } => Operation::CreateNatGateway,
            CloudCall::DeleteNatGateway { .. } => Operation::DeleteNatGateway,
            CloudCall::DescribeTargetGroups { .. } => Operation::DescribeTargetGroups,
        }
    }

    /// Calls that change provider state
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            CloudCall::DescribeAutoScalingGroups { .. }
                | CloudCall::DescribeLoadBalancerTargetGroups { .. }
                | CloudCall::DescribeSubnets { .. }
                | CloudCall::DescribeNatGateways { .. }
                | CloudCall::DescribeTargetGroups { .. }
        )
    }
}

/// Failure injected into the next call of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Request rate exceeded
    Throttle,
    /// Service returned a 5xx
    Unavailable,
}

// =============================================================================
// Provider State
// =============================================================================

#[derive(Debug, Clone)]
struct GroupRecord {
    description: AutoScalingGroupDescription,
    target_group_arns: Vec<String>,
}

/// In-memory implementation of every cloud port
pub struct InMemoryCloud {
    config: InMemoryCloudConfig,
    /// Autoscaling groups; a Vec so inconsistent duplicates can be seeded
    groups: RwLock<Vec<GroupRecord>>,
    /// Subnets
    subnets: RwLock<Vec<Subnet>>,
    /// NAT gateways, including deleted ones
    nat_gateways: RwLock<Vec<NatGatewayDescription>>,
    /// Target groups by name
    target_groups: RwLock<BTreeMap<String, TargetGroup>>,
    /// Recorded calls
    calls: Mutex<Vec<CloudCall>>,
    /// One-shot faults
    faults: Mutex<HashMap<Operation, Fault>>,
    /// Names whose next describe returns nothing
    stale_reads: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new(InMemoryCloudConfig::default())
    }
}

impl InMemoryCloud {
    /// Create an empty provider
    pub fn new(config: InMemoryCloudConfig) -> Self {
        Self {
            config,
            groups: RwLock::new(Vec::new()),
            subnets: RwLock::new(Vec::new()),
            nat_gateways: RwLock::new(Vec::new()),
            target_groups: RwLock::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
            stale_reads: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    // -------------------------------------------------------------------------
    // Seeding and inspection
    // -------------------------------------------------------------------------

    /// Add a subnet
    pub async fn add_subnet(&self, subnet: Subnet) {
        self.subnets.write().await.push(subnet);
    }

    /// Create a target group and return it
    pub async fn add_target_group(&self, name: &str) -> TargetGroup {
        let target_group = TargetGroup {
            name: name.to_string(),
            arn: format!(
                "arn:aws:elasticloadbalancing:{}:{}:targetgroup/{}/{:016x}",
                self.config.region,
                self.config.account_id,
                name,
                self.generate_id()
            ),
        };
        self.target_groups
            .write()
            .await
            .insert(name.to_string(), target_group.clone());
        target_group
    }

    /// Delete a target group. Attachments referencing it are left in place,
    /// as the real provider does.
    pub async fn remove_target_group(&self, name: &str) {
        self.target_groups.write().await.remove(name);
    }

    /// Insert a group directly, bypassing name checks
    pub async fn seed_auto_scaling_group(
        &self,
        description: AutoScalingGroupDescription,
        target_group_arns: Vec<String>,
    ) {
        self.groups.write().await.push(GroupRecord {
            description,
            target_group_arns,
        });
    }

    /// First group with the given name
    pub async fn auto_scaling_group(&self, name: &str) -> Option<AutoScalingGroupDescription> {
        self.groups
            .read()
            .await
            .iter()
            .find(|g| g.description.name == name)
            .map(|g| g.description.clone())
    }

    /// Target groups attached to the first group with the given name
    pub async fn attached_target_groups(&self, name: &str) -> Vec<String> {
        self.groups
            .read()
            .await
            .iter()
            .find(|g| g.description.name == name)
            .map(|g| g.target_group_arns.clone())
            .unwrap_or_default()
    }

    /// Number of groups with the given name
    pub async fn auto_scaling_group_count(&self, name: &str) -> usize {
        self.groups
            .read()
            .await
            .iter()
            .filter(|g| g.description.name == name)
            .count()
    }

    /// NAT gateways with the given name, including deleted ones
    pub async fn nat_gateways(&self, name: &str) -> Vec<NatGatewayDescription> {
        self.nat_gateways
            .read()
            .await
            .iter()
            .filter(|n| n.name == name)
            .cloned()
            .collect()
    }

    /// Put a NAT gateway into the failed state
    pub async fn mark_nat_gateway_failed(&self, id: &str) {
        if let Some(gateway) = self.nat_gateways.write().await.iter_mut().find(|n| n.id == id) {
            gateway.state = NatGatewayState::Failed;
        }
    }

    /// Fail the next call of an operation
    pub fn fail_next(&self, operation: Operation, fault: Fault) {
        self.faults.lock().insert(operation, fault);
    }

    /// Make the next describe of `name` miss, like an eventually consistent read
    pub fn stale_read_next(&self, name: &str) {
        self.stale_reads.lock().insert(name.to_string());
    }

    /// Complete asynchronous work: finish deletions and bring pending NAT
    /// gateways up
    pub async fn settle(&self) {
        self.groups
            .write()
            .await
            .retain(|g| !g.description.is_deleting());

        for gateway in self.nat_gateways.write().await.iter_mut() {
            gateway.state = match gateway.state {
                NatGatewayState::Pending => NatGatewayState::Available,
                NatGatewayState::Deleting => NatGatewayState::Deleted,
                state => state,
            };
        }
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().clone()
    }

    /// Calls that changed provider state, in order
    pub fn mutations(&self) -> Vec<CloudCall> {
        self.calls.lock().iter().filter(|c| c.is_mutation()).cloned().collect()
    }

    /// Number of calls of an operation
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn record(&self, call: CloudCall) -> Result<()> {
        let operation = call.operation();
        self.calls.lock().push(call);

        match self.faults.lock().remove(&operation) {
            Some(Fault::Throttle) => Err(Error::Throttled {
                service: operation.service().to_string(),
                operation: operation.to_string(),
            }),
            Some(Fault::Unavailable) => Err(Error::CloudApi {
                service: operation.service().to_string(),
                operation: operation.to_string(),
                reason: "service unavailable".to_string(),
            }),
            None => Ok(()),
        }
    }

    fn is_stale(&self, name: &str) -> bool {
        self.stale_reads.lock().remove(name)
    }

    fn generate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn group_not_found(operation: Operation, name: &str) -> Error {
        Error::CloudApi {
            service: operation.service().to_string(),
            operation: operation.to_string(),
            reason: format!("autoscaling group {} not found", name),
        }
    }
}

// =============================================================================
// Port Implementations
// =============================================================================

#[async_trait]
impl AutoScalingApi for InMemoryCloud {
    async fn describe_auto_scaling_groups(
        &self,
        name: &str,
    ) -> Result<Vec<AutoScalingGroupDescription>> {
        self.record(CloudCall::DescribeAutoScalingGroups {
            name: name.to_string(),
        })?;
        if self.is_stale(name) {
            return Ok(Vec::new());
        }

        Ok(self
            .groups
            .read()
            .await
            .iter()
            .filter(|g| g.description.name == name)
            .map(|g| g.description.clone())
            .collect())
    }

    async fn create_auto_scaling_group(&self, request: CreateAutoScalingGroupRequest) -> Result<()> {
        self.record(CloudCall::CreateAutoScalingGroup {
            name: request.name.clone(),
        })?;

        let mut groups = self.groups.write().await;
        if groups.iter().any(|g| g.description.name == request.name) {
            return Err(Error::ResourceExists {
                kind: "AutoScalingGroup".into(),
                name: request.name,
            });
        }

        info!(
            group = %request.name,
            capacity = request.desired_capacity,
            subnets = %request.vpc_zone_identifier,
            "Simulated autoscaling group created"
        );

        groups.push(GroupRecord {
            description: AutoScalingGroupDescription {
                name: request.name,
                desired_capacity: request.desired_capacity,
                min_size: request.min_size,
                max_size: request.max_size,
                launch_template_name: request.launch_template_name,
                subnet_ids: request
                    .vpc_zone_identifier
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
                tags: request.tags,
                status: None,
            },
            target_group_arns: Vec::new(),
        });

        Ok(())
    }

    async fn delete_auto_scaling_group(&self, name: &str, force: bool) -> Result<()> {
        self.record(CloudCall::DeleteAutoScalingGroup {
            name: name.to_string(),
            force,
        })?;

        let mut groups = self.groups.write().await;
        let group = groups
            .iter_mut()
            .find(|g| g.description.name == name)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "AutoScalingGroup".into(),
                name: name.into(),
            })?;

        debug!(group = %name, force, "Simulated autoscaling group deletion started");
        group.description.status = Some(ASG_DELETE_IN_PROGRESS.to_string());
        Ok(())
    }

    async fn describe_load_balancer_target_groups(&self, group_name: &str) -> Result<Vec<String>> {
        self.record(CloudCall::DescribeLoadBalancerTargetGroups {
            group: group_name.to_string(),
        })?;

        self.groups
            .read()
            .await
            .iter()
            .find(|g| g.description.name == group_name)
            .map(|g| g.target_group_arns.clone())
            .ok_or_else(|| {
                Self::group_not_found(Operation::DescribeLoadBalancerTargetGroups, group_name)
            })
    }

    async fn attach_load_balancer_target_groups(
        &self,
        group_name: &str,
        target_group_arns: &[String],
    ) -> Result<()> {
        self.record(CloudCall::AttachLoadBalancerTargetGroups {
            group: group_name.to_string(),
            arns: target_group_arns.to_vec(),
        })?;

        let mut groups = self.groups.write().await;
        let group = groups
            .iter_mut()
            .find(|g| g.description.name == group_name)
            .ok_or_else(|| {
                Self::group_not_found(Operation::AttachLoadBalancerTargetGroups, group_name)
            })?;

        for arn in target_group_arns {
            if !group.target_group_arns.contains(arn) {
                group.target_group_arns.push(arn.clone());
            }
        }
        Ok(())
    }

    async fn detach_load_balancer_target_groups(
        &self,
        group_name: &str,
        target_group_arns: &[String],
    ) -> Result<()> {
        self.record(CloudCall::DetachLoadBalancerTargetGroups {
            group: group_name.to_string(),
            arns: target_group_arns.to_vec(),
        })?;

        let mut groups = self.groups.write().await;
        let group = groups
            .iter_mut()
            .find(|g| g.description.name == group_name)
            .ok_or_else(|| {
                Self::group_not_found(Operation::DetachLoadBalancerTargetGroups, group_name)
            })?;

        group
            .target_group_arns
            .retain(|arn| !target_group_arns.contains(arn));
        Ok(())
    }
}

#[async_trait]
impl Ec2Api for InMemoryCloud {
    async fn describe_subnets(&self, cluster_name: &str) -> Result<Vec<Subnet>> {
        self.record(CloudCall::DescribeSubnets {
            cluster: cluster_name.to_string(),
        })?;

        Ok(self
            .subnets
            .read()
            .await
            .iter()
            .filter(|s| s.cluster_name == cluster_name)
            .cloned()
            .collect())
    }

    async fn describe_nat_gateways(&self, name: &str) -> Result<Vec<NatGatewayDescription>> {
        self.record(CloudCall::DescribeNatGateways {
            name: name.to_string(),
        })?;
        if self.is_stale(name) {
            return Ok(Vec::new());
        }

        Ok(self
            .nat_gateways
            .read()
            .await
            .iter()
            .filter(|n| n.name == name && n.state != NatGatewayState::Deleted)
            .cloned()
            .collect())
    }

    async fn create_nat_gateway(&self, request: CreateNatGatewayRequest) -> Result<NatGatewayDescription> {
        self.record(CloudCall::CreateNatGateway {
            name: request.name.clone(),
        })?;

        let mut gateways = self.nat_gateways.write().await;
        if gateways
            .iter()
            .any(|n| n.name == request.name && n.state != NatGatewayState::Deleted)
        {
            return Err(Error::ResourceExists {
                kind: "NatGateway".into(),
                name: request.name,
            });
        }

        let gateway = NatGatewayDescription {
            id: format!("nat-{:016x}", self.generate_id()),
            name: request.name,
            state: NatGatewayState::Pending,
            tags: request.tags,
        };
        info!(gateway = %gateway.name, id = %gateway.id, "Simulated NAT gateway created");

        gateways.push(gateway.clone());
        Ok(gateway)
    }

    async fn delete_nat_gateway(&self, id: &str) -> Result<()> {
        self.record(CloudCall::DeleteNatGateway { id: id.to_string() })?;

        let mut gateways = self.nat_gateways.write().await;
        let gateway = gateways
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "NatGateway".into(),
                name: id.into(),
            })?;

        if gateway.state != NatGatewayState::Deleted {
            gateway.state = NatGatewayState::Deleting;
        }
        Ok(())
    }
}

#[async_trait]
impl Elbv2Api for InMemoryCloud {
    async fn find_target_group(&self, name: &str) -> Result<Option<TargetGroup>> {
        self.record(CloudCall::DescribeTargetGroups {
            name: name.to_string(),
        })?;

        Ok(self.target_groups.read().await.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_request(name: &str) -> CreateAutoScalingGroupRequest {
        CreateAutoScalingGroupRequest {
            name: name.to_string(),
            desired_capacity: 2,
            min_size: 1,
            max_size: 4,
            launch_template_name: name.to_string(),
            vpc_zone_identifier: "subnet-1,subnet-2".to_string(),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_taken_name() {
        let cloud = InMemoryCloud::default();

        cloud.create_auto_scaling_group(create_request("prod-asg")).await.unwrap();
        let err = cloud
            .create_auto_scaling_group(create_request("prod-asg"))
            .await
            .unwrap_err();

        assert!(err.is_already_exists());
        assert_eq!(cloud.auto_scaling_group_count("prod-asg").await, 1);
        let group = cloud.auto_scaling_group("prod-asg").await.unwrap();
        assert_eq!(group.subnet_ids, vec!["subnet-1", "subnet-2"]);
    }

    #[tokio::test]
    async fn test_delete_is_asynchronous() {
        let cloud = InMemoryCloud::default();
        cloud.create_auto_scaling_group(create_request("prod-asg")).await.unwrap();

        cloud.delete_auto_scaling_group("prod-asg", true).await.unwrap();
        let groups = cloud.describe_auto_scaling_groups("prod-asg").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_deleting());

        cloud.settle().await;
        assert!(cloud.describe_auto_scaling_groups("prod-asg").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fault_is_one_shot() {
        let cloud = InMemoryCloud::default();
        cloud.fail_next(Operation::DescribeSubnets, Fault::Throttle);

        let err = cloud.describe_subnets("prod").await.unwrap_err();
        assert!(matches!(err, Error::Throttled { .. }));
        assert!(cloud.describe_subnets("prod").await.is_ok());
        assert_eq!(cloud.call_count(Operation::DescribeSubnets), 2);
    }

    #[tokio::test]
    async fn test_stale_read_hides_existing_group_once() {
        let cloud = InMemoryCloud::default();
        cloud.create_auto_scaling_group(create_request("prod-asg")).await.unwrap();
        cloud.stale_read_next("prod-asg");

        assert!(cloud.describe_auto_scaling_groups("prod-asg").await.unwrap().is_empty());
        assert_eq!(cloud.describe_auto_scaling_groups("prod-asg").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nat_gateway_lifecycle() {
        let cloud = InMemoryCloud::default();
        let gateway = cloud
            .create_nat_gateway(CreateNatGatewayRequest {
                name: "prod-nat-gateway".into(),
                tags: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(gateway.state, NatGatewayState::Pending);
        assert!(gateway.id.starts_with("nat-"));

        cloud.settle().await;
        let described = cloud.describe_nat_gateways("prod-nat-gateway").await.unwrap();
        assert_eq!(described[0].state, NatGatewayState::Available);

        cloud.delete_nat_gateway(&gateway.id).await.unwrap();
        cloud.settle().await;
        assert!(cloud.describe_nat_gateways("prod-nat-gateway").await.unwrap().is_empty());
        assert_eq!(cloud.nat_gateways("prod-nat-gateway").await.len(), 1);
    }

    #[tokio::test]
    async fn test_target_group_arn_format() {
        let cloud = InMemoryCloud::default();
        let tg = cloud.add_target_group("prod-asg").await;
        assert!(tg
            .arn
            .starts_with("arn:aws:elasticloadbalancing:us-west-2:000000000000:targetgroup/prod-asg/"));
        assert_eq!(cloud.find_target_group("prod-asg").await.unwrap(), Some(tg));
        assert_eq!(cloud.find_target_group("missing").await.unwrap(), None);
    }
}
