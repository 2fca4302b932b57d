//! Controller Manager
//!
//! Wires registered controllers to the work queue and a pool of workers.
//! External watch machinery feeds [`Runnable::queue`]; the manager itself
//! only enqueues what the store lists at startup and the requeues the
//! dispatcher asks for.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::{Dispatcher, PassResult, Requeue};
pub use queue::WorkQueue;

use crate::config::OperatorConfig;
use crate::controllers::ControllerRef;
use crate::domain::ports::ObjectStoreRef;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builder for a [`Runnable`]
pub struct Manager {
    store: ObjectStoreRef,
    config: OperatorConfig,
    metrics: Option<Metrics>,
}

impl Manager {
    pub fn new(store: ObjectStoreRef, config: OperatorConfig) -> Self {
        Self {
            store,
            config,
            metrics: None,
        }
    }

    /// Record pass metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register one controller per kind. Two controllers for the same kind
    /// are a configuration error.
    pub fn register_controllers(self, controllers: Vec<ControllerRef>) -> Result<Runnable> {
        self.config.validate()?;

        let mut registered: BTreeMap<_, ControllerRef> = BTreeMap::new();
        for controller in controllers {
            let kind = controller.kind();
            if let Some(existing) = registered.get(&kind) {
                return Err(Error::Configuration(format!(
                    "controllers {} and {} both handle {}",
                    existing.name(),
                    controller.name(),
                    kind
                )));
            }
            info!(controller = controller.name(), %kind, "Registered controller");
            registered.insert(kind, controller);
        }

        let workers = self.config.workers;
        Ok(Runnable {
            queue: WorkQueue::new(),
            dispatcher: Arc::new(Dispatcher::new(
                registered,
                self.store,
                self.config,
                self.metrics,
            )),
            workers,
        })
    }
}

/// Registered controllers, ready to run
pub struct Runnable {
    queue: WorkQueue,
    dispatcher: Arc<Dispatcher>,
    workers: usize,
}

impl Runnable {
    /// Trigger handle for watch machinery
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Process keys until `stop` is cancelled. In-flight passes observe the
    /// same token and stop at their next external call.
    pub async fn start(self, stop: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = stop.cancelled() => debug!("Stopped before existing objects were listed"),
            _ = self.enqueue_existing() => {}
        }

        info!(workers = self.workers, "Starting workers");
        let handles: Vec<_> = (0..self.workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    self.queue.clone(),
                    self.dispatcher.clone(),
                    stop.clone(),
                ))
            })
            .collect();

        stop.cancelled().await;
        info!("Stopping workers");
        self.queue.shutdown();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker exited abnormally");
            }
        }

        info!("Workers stopped");
        Ok(())
    }

    async fn enqueue_existing(&self) {
        let kinds: Vec<_> = self.dispatcher.kinds().collect();
        for kind in kinds {
            match self.dispatcher.store().list(kind).await {
                Ok(objects) => {
                    debug!(%kind, count = objects.len(), "Enqueueing existing objects");
                    for object in objects {
                        self.queue.add(object.key());
                    }
                }
                Err(e) => warn!(%kind, error = %e, "Failed to list existing objects"),
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    queue: WorkQueue,
    dispatcher: Arc<Dispatcher>,
    stop: CancellationToken,
) {
    debug!(worker, "Worker started");

    while let Some(key) = queue.get().await {
        let result = dispatcher.dispatch(&key, &stop).await;
        queue.done(&key);

        if let Requeue::After(delay) = result.requeue {
            queue.add_after(key, delay);
        }
    }

    debug!(worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudClients, InMemoryCloud};
    use crate::controllers::{
        AutoScalingGroupController, ControlPlaneController, NatGatewayController,
    };
    use crate::store::testing::StalledStore;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn controllers(store: ObjectStoreRef, cloud: &CloudClients) -> Vec<ControllerRef> {
        vec![
            Arc::new(ControlPlaneController::new(store)),
            Arc::new(NatGatewayController::new(cloud.ec2.clone())),
            Arc::new(AutoScalingGroupController::new(
                cloud.autoscaling.clone(),
                cloud.ec2.clone(),
                cloud.elbv2.clone(),
                Default::default(),
            )),
        ]
    }

    #[test]
    fn test_duplicate_kind_is_rejected() {
        let store: ObjectStoreRef = Arc::new(InMemoryStore::new());
        let cloud = CloudClients::simulated(Arc::new(InMemoryCloud::default()));
        let mut registered = controllers(store.clone(), &cloud);
        registered.push(Arc::new(NatGatewayController::new(cloud.ec2.clone())));

        let result = Manager::new(store, OperatorConfig::default()).register_controllers(registered);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store: ObjectStoreRef = Arc::new(InMemoryStore::new());
        let cloud = CloudClients::simulated(Arc::new(InMemoryCloud::default()));
        let config = OperatorConfig {
            workers: 0,
            ..OperatorConfig::default()
        };

        let result = Manager::new(store.clone(), config).register_controllers(controllers(store, &cloud));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_returns_promptly_on_stop() {
        let store: ObjectStoreRef = Arc::new(InMemoryStore::new());
        let cloud = CloudClients::simulated(Arc::new(InMemoryCloud::default()));
        let runnable = Manager::new(store.clone(), OperatorConfig::default())
            .register_controllers(controllers(store, &cloud))
            .unwrap();
        let queue = runnable.queue();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(runnable.start(stop.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert!(queue.is_shutdown());
    }

    #[tokio::test]
    async fn test_start_stops_while_listing_hangs() {
        let inner = Arc::new(InMemoryStore::new());
        let store: ObjectStoreRef = Arc::new(StalledStore::new(inner, &["list"]));
        let cloud = CloudClients::simulated(Arc::new(InMemoryCloud::default()));
        let runnable = Manager::new(store.clone(), OperatorConfig::default())
            .register_controllers(controllers(store, &cloud))
            .unwrap();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(runnable.start(stop.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
