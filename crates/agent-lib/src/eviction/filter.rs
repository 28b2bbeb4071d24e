//! Eviction candidate filtering

use crate::resources::{has_excluded_prefix, is_critical_pod};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Drops pods that must never be evicted
///
/// Excluded: the agent's own namespace, namespaces with an excluded prefix,
/// and critical pods. Order of the remaining pods is preserved.
#[derive(Debug, Clone)]
pub struct PodFilter {
    own_namespace: String,
    excluded_prefixes: Vec<String>,
}

impl PodFilter {
    pub fn new(own_namespace: impl Into<String>, excluded_prefixes: Vec<String>) -> Self {
        Self {
            own_namespace: own_namespace.into(),
            excluded_prefixes,
        }
    }

    pub fn is_candidate(&self, pod: &Pod) -> bool {
        let namespace = pod.namespace().unwrap_or_default();
        namespace != self.own_namespace
            && !has_excluded_prefix(&namespace, &self.excluded_prefixes)
            && !is_critical_pod(pod)
    }

    pub fn filter(&self, pods: Vec<Pod>) -> Vec<Pod> {
        pods.into_iter().filter(|p| self.is_candidate(p)).collect()
    }
}
