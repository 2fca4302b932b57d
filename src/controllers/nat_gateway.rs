//! NatGateway controller
//!
//! Creates one NAT gateway per [`NatGateway`](crate::crd::NatGateway)
//! object, named after the object. No placement dependency is modeled: the
//! provider picks the subnet.

use super::{unexpected_kind, Controller, Outcome, ReconcileContext, WaitReason};
use crate::crd::{DesiredObject, ResourceKind, CLUSTER_NAME_LABEL};
use crate::domain::ports::{CreateNatGatewayRequest, Ec2ApiRef, NatGatewayDescription, NatGatewayState};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub struct NatGatewayController {
    ec2: Ec2ApiRef,
}

impl NatGatewayController {
    pub fn new(ec2: Ec2ApiRef) -> Self {
        Self { ec2 }
    }

    async fn describe(&self, ctx: &ReconcileContext, name: &str) -> Result<Option<NatGatewayDescription>> {
        let mut gateways = ctx
            .call("DescribeNatGateways", self.ec2.describe_nat_gateways(name))
            .await?;

        match gateways.len() {
            0 => Ok(None),
            1 => Ok(gateways.pop()),
            count => Err(Error::DuplicateResources {
                kind: ResourceKind::NatGateway.to_string(),
                name: name.to_string(),
                count,
            }),
        }
    }

    async fn delete(&self, ctx: &ReconcileContext, gateway: &NatGatewayDescription) -> Result<()> {
        match ctx
            .call("DeleteNatGateway", self.ec2.delete_nat_gateway(&gateway.id))
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl Controller for NatGatewayController {
    fn name(&self) -> &'static str {
        "nat-gateway"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::NatGateway
    }

    async fn reconcile(&self, ctx: &ReconcileContext, object: &DesiredObject) -> Result<Outcome> {
        let gateway = object
            .as_nat_gateway()
            .ok_or_else(|| unexpected_kind(self.kind(), object))?;
        let name = object.name();

        let Some(existing) = self.describe(ctx, &name).await? else {
            let request = CreateNatGatewayRequest {
                name: name.clone(),
                tags: BTreeMap::from([
                    (CLUSTER_NAME_LABEL.to_string(), gateway.spec.cluster_name.clone()),
                    ("Name".to_string(), name.clone()),
                ]),
            };
            match ctx
                .call("CreateNatGateway", self.ec2.create_nat_gateway(request))
                .await
            {
                Ok(created) => info!(gateway = %name, id = %created.id, "Created NAT gateway"),
                Err(e) if e.is_already_exists() => {
                    debug!(gateway = %name, "NAT gateway created concurrently")
                }
                Err(e) => return Err(e),
            }
            return Ok(Outcome::Waiting(WaitReason::NatGatewayPending));
        };

        match existing.state {
            NatGatewayState::Available => Ok(Outcome::Created),
            NatGatewayState::Pending => Ok(Outcome::Waiting(WaitReason::NatGatewayPending)),
            NatGatewayState::Failed => {
                warn!(gateway = %name, id = %existing.id, "NAT gateway failed, replacing");
                self.delete(ctx, &existing).await?;
                Ok(Outcome::Waiting(WaitReason::NatGatewayReplacing))
            }
            NatGatewayState::Deleting | NatGatewayState::Deleted => {
                Ok(Outcome::Waiting(WaitReason::NatGatewayReplacing))
            }
        }
    }

    async fn finalize(&self, ctx: &ReconcileContext, object: &DesiredObject) -> Result<Outcome> {
        let name = object.name();

        match self.describe(ctx, &name).await? {
            Some(gateway)
                if !matches!(
                    gateway.state,
                    NatGatewayState::Deleting | NatGatewayState::Deleted
                ) =>
            {
                self.delete(ctx, &gateway).await?;
                info!(gateway = %name, id = %gateway.id, "Deleting NAT gateway");
            }
            Some(_) => debug!(gateway = %name, "NAT gateway deletion already in progress"),
            None => debug!(gateway = %name, "NAT gateway already absent"),
        }

        Ok(Outcome::Terminated)
    }
}
