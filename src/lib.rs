//! KIT Operator - declarative infrastructure controller
//!
//! Watches desired-state objects describing the cloud infrastructure of a
//! Kubernetes control plane and drives the real infrastructure toward them,
//! tolerating partial failures and eventually consistent provider APIs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │   Watch bridge / store events / resync                               │
//! │                  │ ObjectKey                                         │
//! │                  ▼                                                   │
//! │   ┌──────────────────────────┐      ┌─────────────────────────────┐  │
//! │   │ WorkQueue (per-key dedup)│ ───▶ │ Workers ─▶ Dispatcher       │  │
//! │   └──────────────────────────┘      │   reconcile | finalize      │  │
//! │                  ▲                  │   status + requeue/backoff  │  │
//! │                  └──── requeue ──── └──────────────┬──────────────┘  │
//! ├────────────────────────────────────────────────────┼─────────────────┤
//! │   Controllers                                      ▼                 │
//! │   ┌──────────────┐  ┌──────────────────┐  ┌──────────────────────┐   │
//! │   │ ControlPlane │  │ AutoScalingGroup │  │     NatGateway       │   │
//! │   │  (fan-out)   │  │ subnets, targets │  │                      │   │
//! │   └──────┬───────┘  └────────┬─────────┘  └──────────┬───────────┘   │
//! ├──────────┼───────────────────┼───────────────────────┼───────────────┤
//! │   ObjectStore (kube | memory)   Cloud ports (AutoScaling, EC2, ELBv2)│
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`manager`]: Work queue, dispatcher and worker pool
//! - [`controllers`]: Controller contract and per-kind controllers
//! - [`crd`]: Custom Resource Definitions and status model
//! - [`domain`]: Cloud and store ports
//! - [`cloud`]: Simulated cloud provider
//! - [`store`]: Object stores
//! - [`error`]: Error types and retry policy

pub mod cloud;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod domain;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use cloud::{CloudClients, InMemoryCloud, InMemoryCloudConfig};

pub use config::{AutoScalingConfig, BackoffConfig, OperatorConfig};

pub use controllers::{
    AutoScalingGroupController, Controller, ControllerRef, ControlPlaneController,
    NatGatewayController, Outcome, ReconcileContext, WaitReason, FINALIZER,
};

pub use crd::{
    AutoScalingGroup, AutoScalingGroupSpec, ControlPlane, ControlPlaneSpec, DesiredObject,
    NatGateway, NatGatewaySpec, ObjectKey, Phase, ResourceKind, ResourceStatus,
};

pub use domain::ports::{
    AutoScalingApi, Ec2Api, Elbv2Api, ObjectStore, ObjectStoreRef,
};

pub use error::{Error, ErrorAction, Result};

pub use manager::{Dispatcher, Manager, Runnable, WorkQueue};

pub use metrics::Metrics;

pub use store::{InMemoryStore, KubeStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Every controller the operator ships, wired to one set of cloud clients
pub fn default_controllers(
    store: ObjectStoreRef,
    cloud: &CloudClients,
    config: &OperatorConfig,
) -> Vec<ControllerRef> {
    vec![
        std::sync::Arc::new(ControlPlaneController::new(store)),
        std::sync::Arc::new(NatGatewayController::new(cloud.ec2.clone())),
        std::sync::Arc::new(AutoScalingGroupController::new(
            cloud.autoscaling.clone(),
            cloud.ec2.clone(),
            cloud.elbv2.clone(),
            config.auto_scaling,
        )),
    ]
}
