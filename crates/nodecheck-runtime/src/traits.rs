use crate::error::Result;
use crate::types::DeletePolicy;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};

/// Trait for the cluster API operations the prober depends on
///
/// `ApiClient` implements it against a real API server. `MockCluster`
/// implements it in memory for tests.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    // --- Nodes ---

    /// List all nodes with full status
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Replace the status subresource of a node
    async fn update_node_status(&self, name: &str, node: &Node) -> Result<Node>;

    // --- Pods ---

    /// List pods in all namespaces matching an equality label selector
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;

    /// Create a pod. Returns `ProbeError::AlreadyExists` on a name collision
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Request deletion of a pod. Returns `ProbeError::NotFound` if it is gone
    async fn delete_pod(&self, namespace: &str, name: &str, policy: DeletePolicy) -> Result<()>;
}
