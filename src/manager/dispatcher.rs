//! Dispatcher
//!
//! Runs one pass for one key: loads the object, routes it to `reconcile` or
//! to the finalization protocol, records the result in the object status
//! and decides when the key comes back.
//!
//! | Result                      | Status              | Next pass            |
//! |-----------------------------|---------------------|----------------------|
//! | `Created`                   | `Created`           | resync interval      |
//! | `Waiting(reason)`           | `Waiting` + reason  | waiting requeue      |
//! | `Terminated` (finalize)     | `Terminated`        | never                |
//! | retryable error             | `Waiting` + error   | per-key backoff      |
//! | fatal error                 | `Error` + error     | never                |
//! | cancelled                   | unchanged           | never                |

use crate::config::OperatorConfig;
use crate::controllers::finalizer::{ensure_finalizer, finalize_object};
use crate::controllers::{ControllerRef, Outcome, ReconcileContext};
use crate::crd::{DesiredObject, ObjectKey, Phase, ResourceKind, ResourceStatus};
use crate::domain::ports::ObjectStoreRef;
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::{Metrics, OUTCOME_ERROR};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// When a key should be processed again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    Never,
}

/// Result of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Phase recorded for the object; `None` when nothing was recorded
    pub phase: Option<Phase>,
    pub requeue: Requeue,
}

impl PassResult {
    fn untouched() -> Self {
        Self {
            phase: None,
            requeue: Requeue::Never,
        }
    }
}

/// Routes keys to the controller registered for their kind
pub struct Dispatcher {
    controllers: BTreeMap<ResourceKind, ControllerRef>,
    store: ObjectStoreRef,
    config: OperatorConfig,
    /// Failure backoff per key, dropped on the first successful pass
    backoffs: DashMap<ObjectKey, ExponentialBackoff>,
    metrics: Option<Metrics>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        controllers: BTreeMap<ResourceKind, ControllerRef>,
        store: ObjectStoreRef,
        config: OperatorConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            controllers,
            store,
            config,
            backoffs: DashMap::new(),
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    /// Kinds with a registered controller
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.controllers.keys().copied()
    }

    pub fn store(&self) -> &ObjectStoreRef {
        &self.store
    }

    /// Keys currently backing off after failures
    pub fn backoff_len(&self) -> usize {
        self.backoffs.len()
    }

    /// Run one pass for `key`
    pub async fn dispatch(&self, key: &ObjectKey, cancel: &CancellationToken) -> PassResult {
        let Some(controller) = self.controllers.get(&key.kind).cloned() else {
            error!(%key, "{}", Error::NoController { kind: key.kind.to_string() });
            return PassResult::untouched();
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!(
            "reconcile",
            controller = controller.name(),
            kind = %key.kind,
            namespace = %key.namespace,
            name = %key.name,
            id
        );
        let ctx = ReconcileContext::new(id, cancel.clone(), self.config.call_timeout, span.clone());

        async {
            let started = Instant::now();

            let object = match ctx.call("GetObject", self.store.get(key)).await {
                Ok(Some(object)) => object,
                Ok(None) => {
                    debug!("Object is gone, forgetting key");
                    self.backoffs.remove(key);
                    return PassResult::untouched();
                }
                Err(e) => {
                    return self
                        .handle_error(&ctx, controller.name(), key, None, e, started)
                        .await
                }
            };

            let result = self.run(&controller, &ctx, &object).await;
            match result {
                Ok(outcome) => {
                    self.handle_outcome(&ctx, controller.name(), key, &object, outcome, started)
                        .await
                }
                Err(e) => {
                    self.handle_error(&ctx, controller.name(), key, Some(&object), e, started)
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        controller: &ControllerRef,
        ctx: &ReconcileContext,
        object: &DesiredObject,
    ) -> Result<Outcome> {
        if object.is_deleting() {
            return finalize_object(controller.as_ref(), ctx, self.store.as_ref(), object).await;
        }

        ensure_finalizer(ctx, self.store.as_ref(), object).await?;
        controller.reconcile(ctx, object).await
    }

    async fn handle_outcome(
        &self,
        ctx: &ReconcileContext,
        controller: &str,
        key: &ObjectKey,
        object: &DesiredObject,
        outcome: Outcome,
        started: Instant,
    ) -> PassResult {
        self.record(controller, outcome.as_str(), started);

        let requeue = match outcome {
            Outcome::Created => Requeue::After(self.config.resync_interval),
            Outcome::Waiting(_) => Requeue::After(self.config.waiting_requeue),
            Outcome::Terminated => Requeue::Never,
        };
        self.backoffs.remove(key);

        // Finalization records Terminated itself before the token goes
        if outcome == Outcome::Terminated && object.is_deleting() {
            info!("Finalized");
            return PassResult {
                phase: Some(Phase::Terminated),
                requeue,
            };
        }

        let reason = outcome.reason();
        match self.write_status(ctx, key, object, outcome.phase(), reason).await {
            Ok(()) => PassResult {
                phase: Some(outcome.phase()),
                requeue,
            },
            Err(e) if e.is_cancelled() => PassResult::untouched(),
            Err(e) => {
                warn!(error = %e, "Failed to record status");
                PassResult {
                    phase: None,
                    requeue: Requeue::After(self.next_backoff(key)),
                }
            }
        }
    }

    async fn handle_error(
        &self,
        ctx: &ReconcileContext,
        controller: &str,
        key: &ObjectKey,
        object: Option<&DesiredObject>,
        err: Error,
        started: Instant,
    ) -> PassResult {
        if err.is_cancelled() {
            debug!(error = %err, "Pass cancelled");
            return PassResult::untouched();
        }
        self.record(controller, OUTCOME_ERROR, started);

        let (phase, requeue) = match err.action() {
            ErrorAction::RequeueWithBackoff => {
                let delay = self.next_backoff(key);
                warn!(error = %err, retry_in = ?delay, "Reconcile failed, will retry");
                (Phase::Waiting, Requeue::After(delay))
            }
            ErrorAction::NoRequeue => {
                error!(error = %err, "Reconcile failed permanently");
                self.backoffs.remove(key);
                (Phase::Error, Requeue::Never)
            }
        };

        let Some(object) = object else {
            return PassResult {
                phase: None,
                requeue,
            };
        };

        match self.write_status(ctx, key, object, phase, Some(err.to_string())).await {
            Ok(()) => PassResult {
                phase: Some(phase),
                requeue,
            },
            Err(e) => {
                warn!(error = %e, "Failed to record status");
                PassResult {
                    phase: None,
                    requeue,
                }
            }
        }
    }

    /// Write status unless it already says the same. A vanished object is
    /// not an error.
    async fn write_status(
        &self,
        ctx: &ReconcileContext,
        key: &ObjectKey,
        object: &DesiredObject,
        phase: Phase,
        reason: Option<String>,
    ) -> Result<()> {
        if object
            .status()
            .is_some_and(|s| s.same_as(phase, reason.as_deref()))
        {
            return Ok(());
        }

        let previous = object.status().map(|s| s.phase).unwrap_or_default();
        let status = ResourceStatus::new(phase, reason.clone());
        match ctx
            .call("UpdateStatus", self.store.update_status(key, &status))
            .await
        {
            Ok(()) => {
                if previous != phase {
                    info!(from = %previous, to = %phase, reason = reason.as_deref().unwrap_or(""), "Phase changed");
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn next_backoff(&self, key: &ObjectKey) -> Duration {
        let max = self.config.backoff.max_interval;
        self.backoffs
            .entry(key.clone())
            .or_insert_with(|| self.new_backoff())
            .next_backoff()
            .unwrap_or(max)
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        let config = &self.config.backoff;
        ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_interval)
            .with_max_interval(config.max_interval)
            .with_multiplier(config.multiplier)
            .with_randomization_factor(config.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }

    fn record(&self, controller: &str, outcome: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record(controller, outcome, started.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::controllers::{Controller, WaitReason, FINALIZER};
    use crate::crd::{NatGateway, NatGatewaySpec};
    use crate::domain::ports::ObjectStore;
    use crate::store::testing::StalledStore;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Controller returning scripted results and counting calls
    struct Scripted {
        reconcile: Mutex<Vec<Result<Outcome>>>,
        finalize_calls: AtomicU64,
    }

    impl Scripted {
        fn new(reconcile: Vec<Result<Outcome>>) -> Arc<Self> {
            Arc::new(Self {
                reconcile: Mutex::new(reconcile),
                finalize_calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Controller for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn kind(&self) -> ResourceKind {
            ResourceKind::NatGateway
        }

        async fn reconcile(&self, _: &ReconcileContext, _: &DesiredObject) -> Result<Outcome> {
            let mut results = self.reconcile.lock();
            if results.is_empty() {
                Ok(Outcome::Created)
            } else {
                results.remove(0)
            }
        }

        async fn finalize(&self, _: &ReconcileContext, _: &DesiredObject) -> Result<Outcome> {
            self.finalize_calls.fetch_add(1, Ordering::Relaxed);
            Ok(Outcome::Terminated)
        }
    }

    fn config() -> OperatorConfig {
        OperatorConfig {
            backoff: BackoffConfig {
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(8),
                multiplier: 2.0,
                randomization_factor: 0.0,
            },
            ..OperatorConfig::default()
        }
    }

    async fn setup(controller: Arc<Scripted>) -> (Arc<InMemoryStore>, Dispatcher, ObjectKey) {
        let store = Arc::new(InMemoryStore::new());
        let mut gateway = NatGateway::new(
            "prod-nat-gateway",
            NatGatewaySpec {
                cluster_name: "prod".into(),
            },
        );
        gateway.metadata.namespace = Some("kit".into());
        let key = store.create(gateway.into()).await.unwrap().key();

        let controllers: BTreeMap<ResourceKind, ControllerRef> =
            BTreeMap::from([(ResourceKind::NatGateway, controller as ControllerRef)]);
        let dispatcher = Dispatcher::new(controllers, store.clone(), config(), None);
        (store, dispatcher, key)
    }

    async fn status(store: &InMemoryStore, key: &ObjectKey) -> ResourceStatus {
        store
            .get(key)
            .await
            .unwrap()
            .unwrap()
            .status()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_created_adds_finalizer_and_schedules_resync() {
        let (store, dispatcher, key) = setup(Scripted::new(vec![])).await;

        let result = dispatcher.dispatch(&key, &CancellationToken::new()).await;
        assert_eq!(result.phase, Some(Phase::Created));
        assert_eq!(result.requeue, Requeue::After(config().resync_interval));

        let object = store.get(&key).await.unwrap().unwrap();
        assert!(object.has_finalizer(FINALIZER));
        assert_eq!(status(&store, &key).await.phase, Phase::Created);
    }

    #[tokio::test]
    async fn test_waiting_requeues_with_fixed_delay() {
        let controller = Scripted::new(vec![Ok(Outcome::Waiting(WaitReason::NatGatewayPending))]);
        let (store, dispatcher, key) = setup(controller).await;

        let result = dispatcher.dispatch(&key, &CancellationToken::new()).await;
        assert_eq!(result.requeue, Requeue::After(config().waiting_requeue));

        let status = status(&store, &key).await;
        assert_eq!(status.phase, Phase::Waiting);
        assert_eq!(
            status.reason.as_deref(),
            Some("waiting for NAT gateway to become available")
        );
    }

    #[tokio::test]
    async fn test_transient_errors_back_off_then_reset() {
        let throttled = || {
            Err(Error::Throttled {
                service: "ec2".into(),
                operation: "DescribeNatGateways".into(),
            })
        };
        let controller = Scripted::new(vec![throttled(), throttled(), throttled(), throttled(), throttled()]);
        let (store, dispatcher, key) = setup(controller).await;
        let cancel = CancellationToken::new();

        let mut delays = Vec::new();
        for _ in 0..5 {
            let result = dispatcher.dispatch(&key, &cancel).await;
            assert_eq!(result.phase, Some(Phase::Waiting));
            match result.requeue {
                Requeue::After(d) => delays.push(d.as_secs()),
                Requeue::Never => panic!("transient error must be retried"),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);
        assert!(status(&store, &key).await.reason.unwrap().contains("throttled"));

        let result = dispatcher.dispatch(&key, &cancel).await;
        assert_eq!(result.phase, Some(Phase::Created));
        assert_eq!(dispatcher.backoff_len(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_requeued() {
        let controller = Scripted::new(vec![Err(Error::DuplicateResources {
            kind: "NatGateway".into(),
            name: "prod-nat-gateway".into(),
            count: 2,
        })]);
        let (store, dispatcher, key) = setup(controller).await;

        let result = dispatcher.dispatch(&key, &CancellationToken::new()).await;
        assert_eq!(result.phase, Some(Phase::Error));
        assert_eq!(result.requeue, Requeue::Never);
        assert_eq!(status(&store, &key).await.phase, Phase::Error);
    }

    #[tokio::test]
    async fn test_cancelled_pass_leaves_status_alone() {
        let controller = Scripted::new(vec![Err(Error::Cancelled {
            operation: "DescribeNatGateways".into(),
        })]);
        let (store, dispatcher, key) = setup(controller).await;

        let result = dispatcher.dispatch(&key, &CancellationToken::new()).await;
        assert_eq!(result, PassResult::untouched());
        assert!(store.get(&key).await.unwrap().unwrap().status().is_none());
    }

    #[tokio::test]
    async fn test_deletion_runs_finalize_and_releases() {
        let controller = Scripted::new(vec![]);
        let (store, dispatcher, key) = setup(controller.clone()).await;
        let cancel = CancellationToken::new();

        dispatcher.dispatch(&key, &cancel).await;
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_some());

        let result = dispatcher.dispatch(&key, &cancel).await;
        assert_eq!(result.phase, Some(Phase::Terminated));
        assert_eq!(result.requeue, Requeue::Never);
        assert_eq!(controller.finalize_calls.load(Ordering::Relaxed), 1);
        assert!(store.get(&key).await.unwrap().is_none());

        // Gone objects are forgotten
        let result = dispatcher.dispatch(&key, &cancel).await;
        assert_eq!(result, PassResult::untouched());
        assert_eq!(controller.finalize_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_dropped() {
        let (_, dispatcher, _) = setup(Scripted::new(vec![])).await;
        let key = ObjectKey::new(ResourceKind::AutoScalingGroup, "kit", "prod-asg");

        let result = dispatcher.dispatch(&key, &CancellationToken::new()).await;
        assert_eq!(result, PassResult::untouched());
    }

    fn stalled_dispatcher(inner: Arc<InMemoryStore>, stalled: &[&'static str]) -> Dispatcher {
        let controllers: BTreeMap<ResourceKind, ControllerRef> = BTreeMap::from([(
            ResourceKind::NatGateway,
            Scripted::new(vec![]) as ControllerRef,
        )]);
        let config = OperatorConfig {
            call_timeout: Duration::from_secs(5),
            ..config()
        };
        Dispatcher::new(
            controllers,
            Arc::new(StalledStore::new(inner, stalled)),
            config,
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_status_write_times_out_and_backs_off() {
        let (store, _, key) = setup(Scripted::new(vec![])).await;
        let dispatcher = stalled_dispatcher(store.clone(), &["update_status"]);

        let result = dispatcher.dispatch(&key, &CancellationToken::new()).await;
        assert_eq!(
            result,
            PassResult {
                phase: None,
                requeue: Requeue::After(Duration::from_secs(1)),
            }
        );
        assert!(store.get(&key).await.unwrap().unwrap().status().is_none());
    }

    #[tokio::test]
    async fn test_stop_interrupts_hung_finalizer_add() {
        let (store, _, key) = setup(Scripted::new(vec![])).await;
        let dispatcher = stalled_dispatcher(store.clone(), &["add_finalizer"]);

        let stop = CancellationToken::new();
        let canceller = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                stop.cancel();
            })
        };

        let result = tokio::time::timeout(Duration::from_secs(2), dispatcher.dispatch(&key, &stop))
            .await
            .expect("pass did not stop");
        assert_eq!(result, PassResult::untouched());
        assert!(!store.get(&key).await.unwrap().unwrap().has_finalizer(FINALIZER));
        canceller.await.unwrap();
    }
}
