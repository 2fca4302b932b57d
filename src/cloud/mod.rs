//! Cloud Resource Client Adapters
//!
//! Provides adapters for the cloud provider APIs the controllers call:
//! - Auto Scaling: groups and their target group attachments
//! - EC2: subnets and NAT gateways
//! - ELBv2: target groups

pub mod memory;

pub use memory::*;

use crate::domain::ports::{AutoScalingApiRef, Ec2ApiRef, Elbv2ApiRef};
use std::sync::Arc;

/// The set of cloud clients handed to controllers
#[derive(Clone)]
pub struct CloudClients {
    pub autoscaling: AutoScalingApiRef,
    pub ec2: Ec2ApiRef,
    pub elbv2: Elbv2ApiRef,
}

impl CloudClients {
    /// Serve every API from the simulated provider
    pub fn simulated(cloud: Arc<InMemoryCloud>) -> Self {
        Self {
            autoscaling: cloud.clone(),
            ec2: cloud.clone(),
            elbv2: cloud,
        }
    }
}
