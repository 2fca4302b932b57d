//! End-to-end lifecycle tests against the in-memory store and the
//! simulated cloud provider

use kit_operator::cloud::{CloudCall, Operation};
use kit_operator::domain::ports::{Subnet, ASG_DELETE_IN_PROGRESS};
use kit_operator::manager::{PassResult, Requeue};
use kit_operator::{
    default_controllers, AutoScalingGroup, AutoScalingGroupSpec, BackoffConfig, CloudClients,
    ControlPlane, ControlPlaneSpec, InMemoryCloud, InMemoryStore, Manager, ObjectKey,
    ObjectStore, ObjectStoreRef, OperatorConfig, Phase, ResourceKind, ResourceStatus, FINALIZER,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_config() -> OperatorConfig {
    OperatorConfig {
        workers: 2,
        resync_interval: Duration::from_secs(60),
        waiting_requeue: Duration::from_millis(20),
        backoff: BackoffConfig {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(100),
            ..BackoffConfig::default()
        },
        ..OperatorConfig::default()
    }
}

fn private_subnet(id: &str, cluster: &str) -> Subnet {
    Subnet {
        id: id.into(),
        cluster_name: cluster.into(),
        availability_zone: "us-west-2a".into(),
        private: true,
    }
}

async fn status(store: &InMemoryStore, key: &ObjectKey) -> Option<ResourceStatus> {
    store
        .get(key)
        .await
        .unwrap()
        .and_then(|o| o.status().cloned())
}

async fn eventually<F, Fut>(description: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", description);
}

#[tokio::test]
async fn test_autoscaling_group_lifecycle() {
    let cloud = Arc::new(InMemoryCloud::default());
    cloud.add_subnet(private_subnet("sn-2", "cluster-x")).await;
    cloud.add_subnet(private_subnet("sn-1", "cluster-x")).await;

    let store = Arc::new(InMemoryStore::new());
    let mut asg = AutoScalingGroup::new(
        "asg-for-cluster-x",
        AutoScalingGroupSpec {
            cluster_name: "cluster-x".into(),
            instance_count: 2,
        },
    );
    asg.metadata.namespace = Some("kit".into());
    let key = store.create(asg.into()).await.unwrap().key();

    let config = fast_config();
    let controllers = default_controllers(store.clone(), &CloudClients::simulated(cloud.clone()), &config);
    let runnable = Manager::new(store.clone(), config.clone())
        .register_controllers(controllers)
        .unwrap();
    let dispatcher = runnable.dispatcher();
    let cancel = CancellationToken::new();

    // Subnets exist, the target group does not
    let result = dispatcher.dispatch(&key, &cancel).await;
    assert_eq!(
        result,
        PassResult {
            phase: Some(Phase::Waiting),
            requeue: Requeue::After(config.waiting_requeue),
        }
    );
    assert_eq!(
        status(&store, &key).await.unwrap().reason.as_deref(),
        Some("waiting for target group")
    );
    assert_eq!(cloud.call_count(Operation::CreateAutoScalingGroup), 1);
    assert_eq!(cloud.call_count(Operation::AttachLoadBalancerTargetGroups), 0);

    let group = cloud.auto_scaling_group("asg-for-cluster-x").await.unwrap();
    assert_eq!(group.desired_capacity, 2);
    assert_eq!(group.subnet_ids, vec!["sn-1", "sn-2"]);

    // Target group becomes available
    let tg_x = cloud.add_target_group("asg-for-cluster-x").await;
    let result = dispatcher.dispatch(&key, &cancel).await;
    assert_eq!(result.phase, Some(Phase::Created));
    assert_eq!(result.requeue, Requeue::After(config.resync_interval));
    assert_eq!(
        cloud.attached_target_groups("asg-for-cluster-x").await,
        vec![tg_x.arn.clone()]
    );
    assert_eq!(cloud.call_count(Operation::CreateAutoScalingGroup), 1);

    // Converged: another pass changes nothing
    cloud.clear_calls();
    let result = dispatcher.dispatch(&key, &cancel).await;
    assert_eq!(result.phase, Some(Phase::Created));
    assert!(cloud.mutations().is_empty());

    // Deletion
    store.delete(&key).await.unwrap();
    let object = store.get(&key).await.unwrap().unwrap();
    assert!(object.is_deleting());
    assert!(object.has_finalizer(FINALIZER));

    let result = dispatcher.dispatch(&key, &cancel).await;
    assert_eq!(result.phase, Some(Phase::Terminated));
    assert_eq!(result.requeue, Requeue::Never);
    assert_eq!(
        cloud.mutations(),
        vec![CloudCall::DeleteAutoScalingGroup {
            name: "asg-for-cluster-x".into(),
            force: true,
        }]
    );
    assert_eq!(
        cloud
            .auto_scaling_group("asg-for-cluster-x")
            .await
            .unwrap()
            .status
            .as_deref(),
        Some(ASG_DELETE_IN_PROGRESS)
    );
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_control_plane_fan_out_and_teardown() {
    let cloud = Arc::new(InMemoryCloud::default());
    cloud.add_subnet(private_subnet("subnet-a", "prod")).await;
    cloud.add_target_group("prod-asg").await;

    let store = Arc::new(InMemoryStore::new());
    let store_ref: ObjectStoreRef = store.clone();
    let config = fast_config();
    let controllers = default_controllers(store_ref.clone(), &CloudClients::simulated(cloud.clone()), &config);
    let runnable = Manager::new(store_ref, config)
        .register_controllers(controllers)
        .unwrap();

    let stop = CancellationToken::new();
    let forwarder = store.spawn_forwarder(runnable.queue(), stop.clone());
    let engine = tokio::spawn(runnable.start(stop.clone()));

    let mut cp = ControlPlane::new("prod", ControlPlaneSpec { instance_count: 3 });
    cp.metadata.namespace = Some("kit".into());
    let cp_key = store.create(cp.into()).await.unwrap().key();
    let asg_key = ObjectKey::new(ResourceKind::AutoScalingGroup, "kit", "prod-asg");
    let nat_key = ObjectKey::new(ResourceKind::NatGateway, "kit", "prod-nat-gateway");

    eventually("children to converge", || {
        let store = store.clone();
        let cloud = cloud.clone();
        let (cp_key, asg_key, nat_key) = (cp_key.clone(), asg_key.clone(), nat_key.clone());
        async move {
            cloud.settle().await;
            let created = |s: Option<ResourceStatus>| s.is_some_and(|s| s.phase == Phase::Created);
            created(status(&store, &cp_key).await)
                && created(status(&store, &asg_key).await)
                && created(status(&store, &nat_key).await)
        }
    })
    .await;

    assert_eq!(cloud.call_count(Operation::CreateAutoScalingGroup), 1);
    assert_eq!(cloud.call_count(Operation::CreateNatGateway), 1);
    assert_eq!(
        cloud.auto_scaling_group("prod-asg").await.unwrap().desired_capacity,
        3
    );

    // Deleting the control plane tears down every child
    store.delete(&cp_key).await.unwrap();
    eventually("objects to be removed", || {
        let store = store.clone();
        async move { store.is_empty().await }
    })
    .await;

    assert_eq!(cloud.call_count(Operation::DeleteAutoScalingGroup), 1);
    assert_eq!(cloud.call_count(Operation::DeleteNatGateway), 1);

    stop.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), engine).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
    forwarder.await.unwrap();
}

#[tokio::test]
async fn test_missing_subnets_block_creation_until_they_appear() {
    let cloud = Arc::new(InMemoryCloud::default());
    let store = Arc::new(InMemoryStore::new());
    let mut asg = AutoScalingGroup::new(
        "dev-asg",
        AutoScalingGroupSpec {
            cluster_name: "dev".into(),
            instance_count: 1,
        },
    );
    asg.metadata.namespace = Some("kit".into());
    let key = store.create(asg.into()).await.unwrap().key();

    let config = fast_config();
    let controllers = default_controllers(store.clone(), &CloudClients::simulated(cloud.clone()), &config);
    let dispatcher = Manager::new(store.clone(), config)
        .register_controllers(controllers)
        .unwrap()
        .dispatcher();
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let result = dispatcher.dispatch(&key, &cancel).await;
        assert_eq!(result.phase, Some(Phase::Waiting));
    }
    assert_eq!(
        status(&store, &key).await.unwrap().reason.as_deref(),
        Some("waiting for private subnets")
    );
    assert_eq!(cloud.call_count(Operation::CreateAutoScalingGroup), 0);

    cloud.add_subnet(private_subnet("subnet-d", "dev")).await;
    dispatcher.dispatch(&key, &cancel).await;
    dispatcher.dispatch(&key, &cancel).await;
    assert_eq!(cloud.call_count(Operation::CreateAutoScalingGroup), 1);
}
