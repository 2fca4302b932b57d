//! In-memory object store
//!
//! Mirrors the API server semantics the controllers rely on: deletion of an
//! object with finalizers only marks it, the object disappears once its last
//! finalizer is removed, and removing an owner deletes everything it owns.

use crate::crd::{DesiredObject, ObjectKey, ResourceKind, ResourceStatus};
use crate::domain::ports::ObjectStore;
use crate::error::{Error, Result};
use crate::manager::WorkQueue;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the change channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Object store backed by a map
pub struct InMemoryStore {
    objects: RwLock<BTreeMap<ObjectKey, DesiredObject>>,
    /// Keys of objects whose metadata or existence changed
    events: broadcast::Sender<ObjectKey>,
    next_uid: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
            next_uid: AtomicU64::new(1),
        }
    }

    /// Receive the key of every created, changed or removed object.
    /// Status updates are not announced.
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectKey> {
        self.events.subscribe()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Forward change notifications into the work queue until `stop` fires.
    /// If the channel overflows, every stored object is enqueued.
    pub fn spawn_forwarder(self: &Arc<Self>, queue: WorkQueue, stop: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut events = self.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(key) => queue.add(key),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Change notifications dropped, enqueueing every object");
                            for key in store.objects.read().await.keys() {
                                queue.add(key.clone());
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn notify(&self, key: ObjectKey) {
        // No receivers is fine
        let _ = self.events.send(key);
    }

    /// Request deletion of `key` and, transitively, of every object owned
    /// by an object that got removed. Returns the keys that changed.
    fn delete_locked(
        objects: &mut BTreeMap<ObjectKey, DesiredObject>,
        key: &ObjectKey,
    ) -> Vec<ObjectKey> {
        let mut changed = Vec::new();
        let mut pending = vec![key.clone()];

        while let Some(key) = pending.pop() {
            let Some(object) = objects.get_mut(&key) else {
                continue;
            };

            if !object.finalizers().is_empty() {
                if object.meta().deletion_timestamp.is_none() {
                    object.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                    changed.push(key);
                }
                continue;
            }

            if let Some(removed) = objects.remove(&key) {
                pending.extend(Self::owned_by(objects, &removed));
                changed.push(key);
            }
        }

        changed
    }

    /// Keys of objects with an owner reference to `owner`
    fn owned_by(objects: &BTreeMap<ObjectKey, DesiredObject>, owner: &DesiredObject) -> Vec<ObjectKey> {
        let Some(uid) = owner.meta().uid.as_deref() else {
            return Vec::new();
        };

        objects
            .iter()
            .filter(|(_, object)| {
                object
                    .meta()
                    .owner_references
                    .iter()
                    .flatten()
                    .any(|r| r.uid == uid)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DesiredObject>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<DesiredObject>> {
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|o| o.kind() == kind)
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: DesiredObject) -> Result<DesiredObject> {
        let key = object.key();
        if key.name.is_empty() {
            return Err(Error::InvalidObject {
                kind: key.kind.to_string(),
                name: key.name,
                reason: "metadata.name is required".into(),
            });
        }

        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(Error::ResourceExists {
                kind: key.kind.to_string(),
                name: key.name,
            });
        }

        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let meta = object.meta_mut();
        meta.uid = Some(format!("{:08x}-0000-4000-8000-{:012x}", uid, uid));
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.resource_version = Some("1".to_string());

        objects.insert(key.clone(), object.clone());
        drop(objects);

        debug!(key = %key, "Object created");
        self.notify(key);
        Ok(object)
    }

    async fn update_status(&self, key: &ObjectKey, status: &ResourceStatus) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects.get_mut(key).ok_or_else(|| Error::ResourceNotFound {
            kind: key.kind.to_string(),
            name: key.name.clone(),
        })?;

        object.set_status(status.clone());
        Ok(())
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects.get_mut(key).ok_or_else(|| Error::ResourceNotFound {
            kind: key.kind.to_string(),
            name: key.name.clone(),
        })?;

        if object.has_finalizer(finalizer) {
            return Ok(());
        }
        if object.is_deleting() {
            return Err(Error::InvalidObject {
                kind: key.kind.to_string(),
                name: key.name.clone(),
                reason: "no new finalizers can be added while the object is being deleted".into(),
            });
        }

        object
            .meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        drop(objects);

        self.notify(key.clone());
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        let Some(object) = objects.get_mut(key) else {
            return Ok(());
        };
        if !object.has_finalizer(finalizer) {
            return Ok(());
        }

        let meta = object.meta_mut();
        if let Some(finalizers) = meta.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }

        let mut changed = vec![key.clone()];
        if object.is_deleting() && object.finalizers().is_empty() {
            changed.extend(Self::delete_locked(&mut objects, key));
        }
        drop(objects);

        for key in changed {
            self.notify(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let changed = Self::delete_locked(&mut *self.objects.write().await, key);
        for key in changed {
            debug!(key = %key, "Object deletion requested");
            self.notify(key);
        }
        Ok(())
    }
}
