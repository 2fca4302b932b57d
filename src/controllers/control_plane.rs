//! ControlPlane controller
//!
//! Fans one [`ControlPlane`] out into its child infrastructure objects.
//! Each child is owned by the control plane and reconciled by its own
//! controller; this controller only makes sure the children exist.

use super::{unexpected_kind, Controller, Outcome, ReconcileContext};
use crate::crd::{
    AutoScalingGroup, AutoScalingGroupSpec, ControlPlane, DesiredObject, NatGateway,
    NatGatewaySpec, ObjectKey, ResourceKind, CLUSTER_NAME_LABEL,
};
use crate::domain::ports::ObjectStoreRef;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Projections
// =============================================================================

/// Metadata shared by every child of a control plane
fn child_meta(kind: ResourceKind, control_plane: &ControlPlane) -> Result<ObjectMeta> {
    let owner = control_plane
        .controller_owner_ref(&())
        .ok_or_else(|| Error::InvalidObject {
            kind: ResourceKind::ControlPlane.to_string(),
            name: control_plane.name_any(),
            reason: "object has no uid".into(),
        })?;
    let cluster = control_plane.name_any();

    Ok(ObjectMeta {
        name: Some(kind.object_name(&cluster)),
        namespace: control_plane.namespace(),
        labels: Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster)])),
        owner_references: Some(vec![owner]),
        ..ObjectMeta::default()
    })
}

/// Projects a control plane onto one child object
#[async_trait]
pub trait Projection: Send + Sync {
    /// Kind of the child
    fn kind(&self) -> ResourceKind;

    /// The child as it should be created
    fn desired(&self, control_plane: &ControlPlane) -> Result<DesiredObject>;

    /// Key of the child
    fn key(&self, control_plane: &ControlPlane) -> ObjectKey {
        ObjectKey::new(
            self.kind(),
            control_plane.namespace().unwrap_or_default(),
            self.kind().object_name(&control_plane.name_any()),
        )
    }

    /// Create the child unless it exists. An existing child is left as is.
    async fn create(
        &self,
        ctx: &ReconcileContext,
        store: &ObjectStoreRef,
        control_plane: &ControlPlane,
    ) -> Result<()> {
        let key = self.key(control_plane);
        if ctx
            .call(&format!("Get{}", self.kind()), store.get(&key))
            .await?
            .is_some()
        {
            return Ok(());
        }

        let desired = self.desired(control_plane)?;
        match ctx
            .call(&format!("Create{}", self.kind()), store.create(desired))
            .await
        {
            Ok(_) => {
                info!(%key, "Created child object");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(%key, "Child object created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// NAT gateway child of a control plane
pub struct NatGatewayProjection;

impl Projection for NatGatewayProjection {
    fn kind(&self) -> ResourceKind {
        ResourceKind::NatGateway
    }

    fn desired(&self, control_plane: &ControlPlane) -> Result<DesiredObject> {
        let mut gateway = NatGateway::new(
            "",
            NatGatewaySpec {
                cluster_name: control_plane.name_any(),
            },
        );
        gateway.metadata = child_meta(self.kind(), control_plane)?;
        Ok(gateway.into())
    }
}

/// Autoscaling group child of a control plane, sized by `instanceCount`
pub struct AutoScalingGroupProjection;

impl Projection for AutoScalingGroupProjection {
    fn kind(&self) -> ResourceKind {
        ResourceKind::AutoScalingGroup
    }

    fn desired(&self, control_plane: &ControlPlane) -> Result<DesiredObject> {
        let mut asg = AutoScalingGroup::new(
            "",
            AutoScalingGroupSpec {
                cluster_name: control_plane.name_any(),
                instance_count: control_plane.spec.instance_count,
            },
        );
        asg.metadata = child_meta(self.kind(), control_plane)?;
        Ok(asg.into())
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct ControlPlaneController {
    store: ObjectStoreRef,
    projections: Vec<Arc<dyn Projection>>,
}

impl ControlPlaneController {
    /// Controller projecting the NAT gateway and the autoscaling group
    pub fn new(store: ObjectStoreRef) -> Self {
        Self::with_projections(
            store,
            vec![Arc::new(NatGatewayProjection), Arc::new(AutoScalingGroupProjection)],
        )
    }

    pub fn with_projections(store: ObjectStoreRef, projections: Vec<Arc<dyn Projection>>) -> Self {
        Self { store, projections }
    }
}

#[async_trait]
impl Controller for ControlPlaneController {
    fn name(&self) -> &'static str {
        "control-plane"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::ControlPlane
    }

    async fn reconcile(&self, ctx: &ReconcileContext, object: &DesiredObject) -> Result<Outcome> {
        let control_plane = object
            .as_control_plane()
            .ok_or_else(|| unexpected_kind(self.kind(), object))?;

        for projection in &self.projections {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: format!("project {}", projection.kind()),
                });
            }
            projection.create(ctx, &self.store, control_plane).await?;
        }

        Ok(Outcome::Created)
    }

    /// Owned children are removed by cascade and run their own finalizers
    async fn finalize(&self, _ctx: &ReconcileContext, _object: &DesiredObject) -> Result<Outcome> {
        Ok(Outcome::Terminated)
    }
}
