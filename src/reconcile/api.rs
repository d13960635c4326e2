use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::client::Error;

use async_trait::async_trait;
use serde_json::Value;

/// The api server operations that a reconcile needs. `runner::Client` is the real implementation,
/// and `testkit::FakeCluster` an in-memory one.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Returns `None` if the object doesn't exist
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<Value>, Error>;

    async fn create(&self, k8s_type: &K8sType, object: &Value) -> Result<Value, Error>;

    async fn replace(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        object: &Value,
    ) -> Result<Value, Error>;

    /// Writes only `object.status`, checked against `object.metadata.resourceVersion`
    async fn replace_status(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        object: &Value,
    ) -> Result<Value, Error>;
}
