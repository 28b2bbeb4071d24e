//! Eviction ordering
//!
//! Pods are sorted by an ordered list of comparators, each deciding only
//! when the previous ones tie:
//! 1. some container's working set plus swap exceeds its memory limit
//! 2. pod working set plus swap exceeds the pod memory request
//! 3. lower scheduling priority
//! 4. larger (working set + swap - request)
//!
//! A pod without metrics sorts first at every level.

use crate::error::Result;
use crate::metrics_source::MetricsSource;
use crate::models::PodSummary;
use crate::resources::{container_memory_limit, container_status, pod_memory_request, pod_priority};
use k8s_openapi::api::core::v1::{Container, ContainerState, Pod};
use kube::ResourceExt;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

type Comparator<'a> = Box<dyn Fn(&Pod, &Pod) -> Ordering + 'a>;

/// `true` sorts before `false`
fn cmp_bool(a: bool, b: bool) -> Ordering {
    b.cmp(&a)
}

/// Orders eviction candidates, first to evict at index 0
pub struct PodRanker {
    metrics: Arc<dyn MetricsSource>,
}

impl PodRanker {
    pub fn new(metrics: Arc<dyn MetricsSource>) -> Self {
        Self { metrics }
    }

    /// Sort `pods` in place; stable for pods that compare equal
    pub async fn rank(&self, pods: &mut [Pod]) -> Result<()> {
        let summaries: HashMap<String, PodSummary> = self
            .metrics
            .list_pods_summary()
            .await?
            .into_iter()
            .map(|s| (s.pod_uid.clone(), s))
            .collect();

        rank_with_summaries(pods, &summaries);
        Ok(())
    }
}

/// Sort `pods` using already-collected summaries keyed by pod UID
pub fn rank_with_summaries(pods: &mut [Pod], summaries: &HashMap<String, PodSummary>) {
    let comparators: Vec<Comparator<'_>> = vec![
        Box::new(move |a: &Pod, b: &Pod| {
            with_summaries(lookup(summaries, a), lookup(summaries, b), |sa, sb| {
                cmp_bool(exceeds_limits(a, sa), exceeds_limits(b, sb))
            })
        }),
        Box::new(move |a: &Pod, b: &Pod| {
            with_summaries(lookup(summaries, a), lookup(summaries, b), |sa, sb| {
                cmp_bool(exceeds_request(a, sa), exceeds_request(b, sb))
            })
        }),
        Box::new(|a: &Pod, b: &Pod| pod_priority(a).cmp(&pod_priority(b))),
        Box::new(move |a: &Pod, b: &Pod| {
            with_summaries(lookup(summaries, a), lookup(summaries, b), |sa, sb| {
                usage_over_request(b, sb).cmp(&usage_over_request(a, sa))
            })
        }),
    ];

    pods.sort_by(|a, b| {
        comparators
            .iter()
            .map(|cmp| cmp(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

fn lookup<'s>(summaries: &'s HashMap<String, PodSummary>, pod: &Pod) -> Option<&'s PodSummary> {
    pod.uid().and_then(|uid| summaries.get(&uid))
}

/// Applies `f` when both summaries exist; a missing summary sorts first
fn with_summaries(
    a: Option<&PodSummary>,
    b: Option<&PodSummary>,
    f: impl FnOnce(&PodSummary, &PodSummary) -> Ordering,
) -> Ordering {
    match (a, b) {
        (Some(sa), Some(sb)) => f(sa, sb),
        (a, b) => cmp_bool(a.is_none(), b.is_none()),
    }
}

fn container_state<'a>(pod: &'a Pod, name: &str) -> Option<&'a ContainerState> {
    container_status(pod, name).and_then(|s| s.state.as_ref())
}

/// Containers whose cgroup should currently hold usage: app containers that
/// have not terminated and init containers that are still running
fn live_containers(pod: &Pod) -> impl Iterator<Item = &Container> {
    let spec = pod.spec.as_ref();
    let app = spec
        .into_iter()
        .flat_map(|s| s.containers.iter())
        .filter(move |c| {
            !container_state(pod, &c.name)
                .map(|state| state.terminated.is_some())
                .unwrap_or(false)
        });
    let init = spec
        .and_then(|s| s.init_containers.as_ref())
        .into_iter()
        .flatten()
        .filter(move |c| {
            container_state(pod, &c.name)
                .map(|state| state.running.is_some())
                .unwrap_or(false)
        });
    app.chain(init)
}

/// A live container with a memory limit but no stats counts as exceeding it
fn exceeds_limits(pod: &Pod, summary: &PodSummary) -> bool {
    live_containers(pod).any(|container| match container_memory_limit(container) {
        Some(limit) => summary
            .containers
            .get(&container.name)
            .map(|c| c.memory_and_swap_bytes() > limit)
            .unwrap_or(true),
        None => false,
    })
}

fn exceeds_request(pod: &Pod, summary: &PodSummary) -> bool {
    summary.memory_and_swap_bytes() > pod_memory_request(pod)
}

fn usage_over_request(pod: &Pod, summary: &PodSummary) -> i128 {
    summary.memory_and_swap_bytes() as i128 - pod_memory_request(pod) as i128
}
