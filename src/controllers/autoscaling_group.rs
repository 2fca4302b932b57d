//! AutoScalingGroup controller
//!
//! Each pass re-derives where the group stands from what the provider
//! reports:
//!
//! ```text
//! Absent --(private subnets)--> Creating --> Attaching --(target group)--> Converged
//! ```
//!
//! Target group drift is corrected in two passes: stale attachments are
//! detached first and the expected target group is attached on the next
//! pass.

use super::{unexpected_kind, Controller, Outcome, ReconcileContext, WaitReason};
use crate::config::AutoScalingConfig;
use crate::crd::{AutoScalingGroup, DesiredObject, ResourceKind, CLUSTER_NAME_LABEL};
use crate::domain::ports::{
    AutoScalingApiRef, AutoScalingGroupDescription, CreateAutoScalingGroupRequest, Ec2ApiRef,
    Elbv2ApiRef,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Reconciles [`AutoScalingGroup`] objects against the provider
pub struct AutoScalingGroupController {
    autoscaling: AutoScalingApiRef,
    ec2: Ec2ApiRef,
    elbv2: Elbv2ApiRef,
    sizing: AutoScalingConfig,
}

impl AutoScalingGroupController {
    pub fn new(
        autoscaling: AutoScalingApiRef,
        ec2: Ec2ApiRef,
        elbv2: Elbv2ApiRef,
        sizing: AutoScalingConfig,
    ) -> Self {
        Self {
            autoscaling,
            ec2,
            elbv2,
            sizing,
        }
    }

    /// The single group named `name`, if any
    async fn describe(
        &self,
        ctx: &ReconcileContext,
        name: &str,
    ) -> Result<Option<AutoScalingGroupDescription>> {
        let mut groups = ctx
            .call(
                "DescribeAutoScalingGroups",
                self.autoscaling.describe_auto_scaling_groups(name),
            )
            .await?;

        match groups.len() {
            0 => Ok(None),
            1 => Ok(groups.pop()),
            count => Err(Error::DuplicateResources {
                kind: ResourceKind::AutoScalingGroup.to_string(),
                name: name.to_string(),
                count,
            }),
        }
    }

    /// Create the group in the cluster's private subnets. `false` when there
    /// are no private subnets yet.
    async fn create(&self, ctx: &ReconcileContext, asg: &AutoScalingGroup) -> Result<bool> {
        let name = asg.name_any();
        let cluster = &asg.spec.cluster_name;

        let subnets = ctx
            .call("DescribeSubnets", self.ec2.describe_subnets(cluster))
            .await?;
        let mut subnet_ids: Vec<String> = subnets
            .into_iter()
            .filter(|s| s.private)
            .map(|s| s.id)
            .collect();
        if subnet_ids.is_empty() {
            return Ok(false);
        }
        subnet_ids.sort();

        let request = CreateAutoScalingGroupRequest {
            name: name.clone(),
            desired_capacity: asg.spec.instance_count,
            min_size: self.sizing.min_size,
            max_size: self.sizing.max_size,
            launch_template_name: name.clone(),
            vpc_zone_identifier: subnet_ids.join(","),
            tags: BTreeMap::from([
                (CLUSTER_NAME_LABEL.to_string(), cluster.clone()),
                ("Name".to_string(), name.clone()),
            ]),
        };

        match ctx
            .call(
                "CreateAutoScalingGroup",
                self.autoscaling.create_auto_scaling_group(request),
            )
            .await
        {
            Ok(()) => {
                info!(group = %name, subnets = subnet_ids.len(), "Created autoscaling group");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => {
                debug!(group = %name, "Autoscaling group created concurrently");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Bring target group attachments in line with the expected target group
    async fn reconcile_target_groups(&self, ctx: &ReconcileContext, name: &str) -> Result<Outcome> {
        let attached = ctx
            .call(
                "DescribeLoadBalancerTargetGroups",
                self.autoscaling.describe_load_balancer_target_groups(name),
            )
            .await?;

        let Some(expected) = ctx
            .call("DescribeTargetGroups", self.elbv2.find_target_group(name))
            .await?
        else {
            return Ok(Outcome::Waiting(WaitReason::TargetGroup));
        };

        let stale: Vec<String> = attached
            .iter()
            .filter(|arn| **arn != expected.arn)
            .cloned()
            .collect();
        if !stale.is_empty() {
            warn!(group = %name, stale = ?stale, "Detaching stale target groups");
            ctx.call(
                "DetachLoadBalancerTargetGroups",
                self.autoscaling
                    .detach_load_balancer_target_groups(name, &stale),
            )
            .await?;
            return Ok(Outcome::Waiting(WaitReason::TargetGroupAttachment));
        }

        if !attached.contains(&expected.arn) {
            ctx.call(
                "AttachLoadBalancerTargetGroups",
                self.autoscaling
                    .attach_load_balancer_target_groups(name, std::slice::from_ref(&expected.arn)),
            )
            .await?;
            info!(group = %name, target_group = %expected.arn, "Attached target group");
        }

        Ok(Outcome::Created)
    }
}

#[async_trait]
impl Controller for AutoScalingGroupController {
    fn name(&self) -> &'static str {
        "autoscaling-group"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::AutoScalingGroup
    }

    async fn reconcile(&self, ctx: &ReconcileContext, object: &DesiredObject) -> Result<Outcome> {
        let asg = object
            .as_auto_scaling_group()
            .ok_or_else(|| unexpected_kind(self.kind(), object))?;
        let name = asg.name_any();

        match self.describe(ctx, &name).await? {
            Some(group) if group.is_deleting() => {
                debug!(group = %name, "Autoscaling group is being deleted");
                return Ok(Outcome::Waiting(WaitReason::AutoScalingGroupDeleting));
            }
            Some(_) => {}
            None => {
                if !self.create(ctx, asg).await? {
                    debug!(group = %name, cluster = %asg.spec.cluster_name, "No private subnets yet");
                    return Ok(Outcome::Waiting(WaitReason::PrivateSubnets));
                }
            }
        }

        self.reconcile_target_groups(ctx, &name).await
    }

    async fn finalize(&self, ctx: &ReconcileContext, object: &DesiredObject) -> Result<Outcome> {
        let name = object.name();

        match self.describe(ctx, &name).await? {
            Some(group) if !group.is_deleting() => {
                ctx.call(
                    "DeleteAutoScalingGroup",
                    self.autoscaling.delete_auto_scaling_group(&name, true),
                )
                .await?;
                info!(group = %name, "Deleting autoscaling group");
            }
            Some(_) => debug!(group = %name, "Autoscaling group deletion already in progress"),
            None => debug!(group = %name, "Autoscaling group already absent"),
        }

        Ok(Outcome::Terminated)
    }
}
