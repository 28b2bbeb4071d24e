//! Pod deletion

use crate::cluster::ClusterClient;
use crate::error::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::debug;

/// Deletes a pod without waiting for graceful termination
///
/// Finalizers are cleared first so the deletion is not held up.
pub struct PodEvictor {
    cluster: Arc<dyn ClusterClient>,
}

impl PodEvictor {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    pub async fn evict(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        if !pod.finalizers().is_empty() {
            debug!(namespace = %namespace, pod = %name, "Clearing finalizers");
            self.cluster.clear_pod_finalizers(pod).await?;
        }

        self.cluster.delete_pod(&namespace, &name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::MockClusterClient;
    use crate::resources::test_pods::pod;

    #[tokio::test]
    async fn test_evict_clears_finalizers_first() {
        let cluster = Arc::new(MockClusterClient::with_node("node-a"));
        let evictor = PodEvictor::new(cluster.clone());

        let mut p = pod("default", "web", vec![]);
        p.metadata.finalizers = Some(vec!["example.com/protect".to_string()]);
        evictor.evict(&p).await.unwrap();

        assert_eq!(*cluster.finalizers_cleared.lock().unwrap(), vec!["web".to_string()]);
        assert_eq!(
            *cluster.deleted.lock().unwrap(),
            vec![("default".to_string(), "web".to_string())]
        );
    }

    #[tokio::test]
    async fn test_evict_without_finalizers_only_deletes() {
        let cluster = Arc::new(MockClusterClient::with_node("node-a"));
        let evictor = PodEvictor::new(cluster.clone());

        evictor.evict(&pod("default", "web", vec![])).await.unwrap();
        assert!(cluster.finalizers_cleared.lock().unwrap().is_empty());
        assert_eq!(cluster.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported() {
        let cluster = Arc::new(MockClusterClient {
            fail_delete: true,
            ..MockClusterClient::with_node("node-a")
        });
        let evictor = PodEvictor::new(cluster);
        assert!(evictor.evict(&pod("default", "web", vec![])).await.is_err());
    }
}
