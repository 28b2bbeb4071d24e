//! Kubernetes cluster access
//!
//! `ClusterClient` is the narrow set of API calls the control loops make;
//! `PodLister` is the read side of the node-local pod cache.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Cluster state operations used by the eviction and swap loops
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Replace the node's taint list, guarded by the node's resource version
    async fn patch_node_taints(&self, node: &Node, taints: Vec<Taint>) -> Result<()>;

    /// All pods currently bound to the node
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Persist the pod with an empty finalizer list
    async fn clear_pod_finalizers(&self, pod: &Pod) -> Result<()>;

    /// Delete the pod immediately (zero grace period)
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// `ClusterClient` backed by the API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get(name).await?)
    }

    async fn patch_node_taints(&self, node: &Node, taints: Vec<Taint>) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": node.resource_version() },
            "spec": { "taints": taints },
        });

        nodes
            .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node = %node.name_any(), "Patched node taints");
        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        Ok(pods.list(&params).await?.items)
    }

    async fn clear_pod_finalizers(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let mut updated = pod.clone();
        updated.metadata.finalizers = None;

        self.pods(&namespace)
            .replace(&pod.name_any(), &PostParams::default(), &updated)
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };

        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => {
                info!(namespace = %namespace, pod = %name, "Deleted pod");
                Ok(())
            }
            Err(e) => {
                let err = AgentError::from(e);
                if err.is_not_found() {
                    debug!(namespace = %namespace, pod = %name, "Pod already gone");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Read access to the node-local pod cache
pub trait PodLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;

    fn list(&self) -> Vec<Arc<Pod>>;
}

impl PodLister for Store<Pod> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }

    fn list(&self) -> Vec<Arc<Pod>> {
        self.state()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory collaborators for controller and manager tests

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every mutating call and serves a fixed node and pod list
    #[derive(Default)]
    pub struct MockClusterClient {
        pub node: Mutex<Node>,
        pub pods: Mutex<Vec<Pod>>,
        pub deleted: Mutex<Vec<(String, String)>>,
        pub finalizers_cleared: Mutex<Vec<String>>,
        pub taint_patches: Mutex<usize>,
        pub fail_list: bool,
        pub fail_delete: bool,
    }

    impl MockClusterClient {
        pub fn with_node(name: &str) -> Self {
            let mut node = Node::default();
            node.metadata.name = Some(name.to_string());
            node.metadata.resource_version = Some("1".to_string());
            Self {
                node: Mutex::new(node),
                ..Default::default()
            }
        }

        pub fn taints(&self) -> Vec<Taint> {
            self.node
                .lock()
                .unwrap()
                .spec
                .as_ref()
                .and_then(|s| s.taints.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ClusterClient for MockClusterClient {
        async fn get_node(&self, _name: &str) -> Result<Node> {
            Ok(self.node.lock().unwrap().clone())
        }

        async fn patch_node_taints(&self, _node: &Node, taints: Vec<Taint>) -> Result<()> {
            let mut node = self.node.lock().unwrap();
            node.spec.get_or_insert_with(Default::default).taints = Some(taints);
            *self.taint_patches.lock().unwrap() += 1;
            Ok(())
        }

        async fn list_pods_on_node(&self, _node_name: &str) -> Result<Vec<Pod>> {
            if self.fail_list {
                return Err(AgentError::Other("list failed".to_string()));
            }
            Ok(self.pods.lock().unwrap().clone())
        }

        async fn clear_pod_finalizers(&self, pod: &Pod) -> Result<()> {
            self.finalizers_cleared.lock().unwrap().push(pod.name_any());
            Ok(())
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
            if self.fail_delete {
                return Err(AgentError::Other("delete failed".to_string()));
            }
            self.deleted
                .lock()
                .unwrap()
                .push((namespace.to_string(), name.to_string()));
            Ok(())
        }
    }

    /// Pod cache backed by a plain map
    #[derive(Default)]
    pub struct MockPodLister {
        pub pods: Mutex<HashMap<(String, String), Arc<Pod>>>,
    }

    impl MockPodLister {
        pub fn insert(&self, pod: Pod) {
            let key = (pod.namespace().unwrap_or_default(), pod.name_any());
            self.pods.lock().unwrap().insert(key, Arc::new(pod));
        }

        pub fn remove(&self, namespace: &str, name: &str) {
            self.pods
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
        }
    }

    impl PodLister for MockPodLister {
        fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
            self.pods
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        fn list(&self) -> Vec<Arc<Pod>> {
            self.pods.lock().unwrap().values().cloned().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::test_pods::pod;
    use kube::runtime::reflector;
    use kube::runtime::watcher;

    #[test]
    fn test_store_lister_lookup() {
        let (store, mut writer) = reflector::store::<Pod>();
        writer.apply_watcher_event(&watcher::Event::Restarted(vec![
            pod("default", "web", vec![]),
            pod("kube-system", "dns", vec![]),
        ]));

        let lister: &dyn PodLister = &store;
        assert!(lister.get("default", "web").is_some());
        assert!(lister.get("default", "dns").is_none());
        assert_eq!(lister.list().len(), 2);
    }
}
