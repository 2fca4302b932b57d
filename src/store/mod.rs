//! Object Store Adapters
//!
//! - `memory`: standalone mode and tests
//! - `kube`: custom resources on a Kubernetes API server

pub mod kube;
pub mod memory;

pub use self::kube::KubeStore;
pub use self::memory::InMemoryStore;

#[cfg(test)]
pub(crate) mod testing {
    use super::InMemoryStore;
    use crate::crd::{DesiredObject, ObjectKey, ResourceKind, ResourceStatus};
    use crate::domain::ports::ObjectStore;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Store whose named operations never complete, like a hung API server
    pub(crate) struct StalledStore {
        pub(crate) inner: Arc<InMemoryStore>,
        stalled: HashSet<&'static str>,
    }

    impl StalledStore {
        pub(crate) fn new(inner: Arc<InMemoryStore>, stalled: &[&'static str]) -> Self {
            Self {
                inner,
                stalled: stalled.iter().copied().collect(),
            }
        }

        async fn gate(&self, operation: &str) {
            if self.stalled.contains(operation) {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl ObjectStore for StalledStore {
        async fn get(&self, key: &ObjectKey) -> Result<Option<DesiredObject>> {
            self.gate("get").await;
            self.inner.get(key).await
        }

        async fn list(&self, kind: ResourceKind) -> Result<Vec<DesiredObject>> {
            self.gate("list").await;
            self.inner.list(kind).await
        }

        async fn create(&self, object: DesiredObject) -> Result<DesiredObject> {
            self.gate("create").await;
            self.inner.create(object).await
        }

        async fn update_status(&self, key: &ObjectKey, status: &ResourceStatus) -> Result<()> {
            self.gate("update_status").await;
            self.inner.update_status(key, status).await
        }

        async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
            self.gate("add_finalizer").await;
            self.inner.add_finalizer(key, finalizer).await
        }

        async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
            self.gate("remove_finalizer").await;
            self.inner.remove_finalizer(key, finalizer).await
        }

        async fn delete(&self, key: &ObjectKey) -> Result<()> {
            self.gate("delete").await;
            self.inner.delete(key).await
        }
    }
}
