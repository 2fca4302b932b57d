//! Object store backed by the Kubernetes API server

use crate::crd::{
    AutoScalingGroup, ControlPlane, DesiredObject, NatGateway, ObjectKey, ResourceKind,
    ResourceStatus,
};
use crate::domain::ports::ObjectStore;
use crate::error::{Error, Result};
use crate::manager::WorkQueue;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Typed custom resources the store reads and writes
trait StoredResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + DeserializeOwned
    + Serialize
    + Into<DesiredObject>
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredResource for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + DeserializeOwned
        + Serialize
        + Into<DesiredObject>
        + Send
        + Sync
        + 'static
{
}

/// Map API errors onto the store's error vocabulary
fn map_api_error(err: kube::Error, key: &ObjectKey, conflict_means_exists: bool) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::ResourceNotFound {
            kind: key.kind.to_string(),
            name: key.name.clone(),
        },
        kube::Error::Api(ae) if ae.code == 409 && conflict_means_exists => Error::ResourceExists {
            kind: key.kind.to_string(),
            name: key.name.clone(),
        },
        _ => Error::Kube(err),
    }
}

/// Object store reading and writing custom resources
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// Restrict listing and watching to one namespace
    namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api<K: StoredResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped_api<K: StoredResource>(&self) -> Api<K> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn get_as<K: StoredResource>(&self, key: &ObjectKey) -> Result<Option<DesiredObject>> {
        let object = self.api::<K>(&key.namespace).get_opt(&key.name).await?;
        Ok(object.map(Into::into))
    }

    async fn list_as<K: StoredResource>(&self) -> Result<Vec<DesiredObject>> {
        let list = self.scoped_api::<K>().list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(Into::into).collect())
    }

    async fn create_as<K: StoredResource>(&self, key: &ObjectKey, object: K) -> Result<DesiredObject> {
        self.api::<K>(&key.namespace)
            .create(&PostParams::default(), &object)
            .await
            .map(Into::into)
            .map_err(|e| map_api_error(e, key, true))
    }

    async fn patch_status_as<K: StoredResource>(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.api::<K>(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_api_error(e, key, false))?;
        Ok(())
    }

    async fn patch_as<K: StoredResource>(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<()> {
        self.api::<K>(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_api_error(e, key, false))?;
        Ok(())
    }

    async fn delete_as<K: StoredResource>(&self, key: &ObjectKey) -> Result<()> {
        match self
            .api::<K>(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_metadata(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<()> {
        match key.kind {
            ResourceKind::ControlPlane => self.patch_as::<ControlPlane>(key, patch).await,
            ResourceKind::AutoScalingGroup => self.patch_as::<AutoScalingGroup>(key, patch).await,
            ResourceKind::NatGateway => self.patch_as::<NatGateway>(key, patch).await,
        }
    }

    /// Replace the finalizer list, guarded by the observed resource version
    async fn write_finalizers(
        &self,
        key: &ObjectKey,
        object: &DesiredObject,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": object.meta().resource_version,
            }
        });
        self.patch_metadata(key, &patch).await
    }

    /// Watch every kind and enqueue the key of each changed object
    pub fn spawn_watchers(&self, queue: WorkQueue, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(watch_kind(
                self.scoped_api::<ControlPlane>(),
                ResourceKind::ControlPlane,
                queue.clone(),
                stop.clone(),
            )),
            tokio::spawn(watch_kind(
                self.scoped_api::<AutoScalingGroup>(),
                ResourceKind::AutoScalingGroup,
                queue.clone(),
                stop.clone(),
            )),
            tokio::spawn(watch_kind(
                self.scoped_api::<NatGateway>(),
                ResourceKind::NatGateway,
                queue,
                stop,
            )),
        ]
    }
}

async fn watch_kind<K: StoredResource>(
    api: Api<K>,
    kind: ResourceKind,
    queue: WorkQueue,
    stop: CancellationToken,
) {
    info!(%kind, "Starting watcher");

    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects();
    let mut stream = std::pin::pin!(stream);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(object)) => {
                    let key = ObjectKey::for_resource(kind, &object);
                    debug!(%key, "Watch event");
                    queue.add(key);
                }
                Some(Err(e)) => warn!(%kind, error = %e, "Watcher error, will retry"),
                None => break,
            },
        }
    }

    info!(%kind, "Watcher stopped");
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DesiredObject>> {
        match key.kind {
            ResourceKind::ControlPlane => self.get_as::<ControlPlane>(key).await,
            ResourceKind::AutoScalingGroup => self.get_as::<AutoScalingGroup>(key).await,
            ResourceKind::NatGateway => self.get_as::<NatGateway>(key).await,
        }
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<DesiredObject>> {
        match kind {
            ResourceKind::ControlPlane => self.list_as::<ControlPlane>().await,
            ResourceKind::AutoScalingGroup => self.list_as::<AutoScalingGroup>().await,
            ResourceKind::NatGateway => self.list_as::<NatGateway>().await,
        }
    }

    async fn create(&self, object: DesiredObject) -> Result<DesiredObject> {
        let key = object.key();
        match object {
            DesiredObject::ControlPlane(o) => self.create_as(&key, o).await,
            DesiredObject::AutoScalingGroup(o) => self.create_as(&key, o).await,
            DesiredObject::NatGateway(o) => self.create_as(&key, o).await,
        }
    }

    async fn update_status(&self, key: &ObjectKey, status: &ResourceStatus) -> Result<()> {
        let patch = json!({ "status": status });
        match key.kind {
            ResourceKind::ControlPlane => self.patch_status_as::<ControlPlane>(key, &patch).await,
            ResourceKind::AutoScalingGroup => {
                self.patch_status_as::<AutoScalingGroup>(key, &patch).await
            }
            ResourceKind::NatGateway => self.patch_status_as::<NatGateway>(key, &patch).await,
        }
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        let object = self.get(key).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: key.kind.to_string(),
            name: key.name.clone(),
        })?;
        if object.has_finalizer(finalizer) {
            return Ok(());
        }

        let mut finalizers = object.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.write_finalizers(key, &object, finalizers).await
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        let Some(object) = self.get(key).await? else {
            return Ok(());
        };
        if !object.has_finalizer(finalizer) {
            return Ok(());
        }

        let finalizers = object
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        match self.write_finalizers(key, &object, finalizers).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match key.kind {
            ResourceKind::ControlPlane => self.delete_as::<ControlPlane>(key).await,
            ResourceKind::AutoScalingGroup => self.delete_as::<AutoScalingGroup>(key).await,
            ResourceKind::NatGateway => self.delete_as::<NatGateway>(key).await,
        }
    }
}
