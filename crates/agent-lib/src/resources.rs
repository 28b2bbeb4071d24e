//! Pod resource helpers
//!
//! Quantity parsing and the small set of pod-spec queries the ranker,
//! filter and swap manager share: aggregate memory requests/limits, QoS
//! class, scheduling priority and critical-pod classification.

use crate::error::{AgentError, Result};
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_CPU: &str = "cpu";

/// Priority at and above which a pod is system critical
pub const SYSTEM_CRITICAL_PRIORITY: i32 = 2_000_000_000;

const CONFIG_SOURCE_ANNOTATION: &str = "kubernetes.io/config.source";
const CONFIG_MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";
const API_SOURCE: &str = "api";

/// Parse a Kubernetes quantity string ("128Mi", "1.5G", "500m", "12e6")
pub fn parse_quantity(raw: &str) -> Result<f64> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| AgentError::Quantity(raw.to_string()))?;

    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        other => {
            let exponent = other
                .strip_prefix('e')
                .or_else(|| other.strip_prefix('E'))
                .and_then(|e| e.parse::<i32>().ok())
                .ok_or_else(|| AgentError::Quantity(raw.to_string()))?;
            10f64.powi(exponent)
        }
    };

    Ok(value * multiplier)
}

/// Parse a quantity as a whole number of bytes, rounding up
pub fn quantity_bytes(q: &Quantity) -> Result<u64> {
    let value = parse_quantity(&q.0)?;
    if value < 0.0 {
        return Err(AgentError::Quantity(q.0.clone()));
    }
    Ok(value.ceil() as u64)
}

fn lookup_bytes(map: Option<&BTreeMap<String, Quantity>>, resource: &str) -> Option<u64> {
    map.and_then(|m| m.get(resource))
        .and_then(|q| quantity_bytes(q).ok())
}

/// Memory request of a container, if one is declared
pub fn container_memory_request(container: &Container) -> Option<u64> {
    lookup_bytes(
        container.resources.as_ref().and_then(|r| r.requests.as_ref()),
        RESOURCE_MEMORY,
    )
}

/// Memory limit of a container, if one is declared
pub fn container_memory_limit(container: &Container) -> Option<u64> {
    lookup_bytes(
        container.resources.as_ref().and_then(|r| r.limits.as_ref()),
        RESOURCE_MEMORY,
    )
}

/// App containers followed by init containers
pub fn all_containers(pod: &Pod) -> impl Iterator<Item = &Container> {
    let spec = pod.spec.as_ref();
    spec.into_iter()
        .flat_map(|s| s.containers.iter())
        .chain(
            spec.and_then(|s| s.init_containers.as_ref())
                .into_iter()
                .flatten(),
        )
}

/// Effective memory request of the whole pod
pub fn pod_memory_request(pod: &Pod) -> u64 {
    let Some(spec) = pod.spec.as_ref() else {
        return 0;
    };

    let mut total: u64 = spec
        .containers
        .iter()
        .filter_map(container_memory_request)
        .fold(0, u64::saturating_add);

    // Init containers run one at a time, so only the largest one matters
    for init in spec.init_containers.iter().flatten() {
        if let Some(value) = container_memory_request(init) {
            total = total.max(value);
        }
    }

    if total > 0 {
        if let Some(overhead) = lookup_bytes(spec.overhead.as_ref(), RESOURCE_MEMORY) {
            total = total.saturating_add(overhead);
        }
    }

    total
}

/// Scheduling priority, defaulting to 0
pub fn pod_priority(pod: &Pod) -> i32 {
    pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0)
}

/// Static, mirror and system-critical-priority pods
pub fn is_critical_pod(pod: &Pod) -> bool {
    let annotations = pod.metadata.annotations.as_ref();

    let is_static = annotations
        .and_then(|a| a.get(CONFIG_SOURCE_ANNOTATION))
        .map(|source| source != API_SOURCE)
        .unwrap_or(false);
    let is_mirror = annotations
        .map(|a| a.contains_key(CONFIG_MIRROR_ANNOTATION))
        .unwrap_or(false);
    let critical_priority = pod
        .spec
        .as_ref()
        .and_then(|s| s.priority)
        .map(|p| p >= SYSTEM_CRITICAL_PRIORITY)
        .unwrap_or(false);

    is_static || is_mirror || critical_priority
}

/// True if the namespace starts with any of the given prefixes
pub fn has_excluded_prefix(namespace: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| namespace.starts_with(p.as_str()))
}

/// Pod quality-of-service class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

/// QoS class as reported in the pod status, computed from the spec otherwise
pub fn qos_class(pod: &Pod) -> QosClass {
    match pod.status.as_ref().and_then(|s| s.qos_class.as_deref()) {
        Some("Guaranteed") => QosClass::Guaranteed,
        Some("Burstable") => QosClass::Burstable,
        Some("BestEffort") => QosClass::BestEffort,
        _ => compute_qos_class(pod),
    }
}

fn compute_qos_class(pod: &Pod) -> QosClass {
    let mut requests: BTreeMap<&str, f64> = BTreeMap::new();
    let mut limits: BTreeMap<&str, f64> = BTreeMap::new();
    let mut limits_cover_all = true;

    for container in all_containers(pod) {
        let resources = container.resources.as_ref();

        for name in [RESOURCE_CPU, RESOURCE_MEMORY] {
            let request = resources
                .and_then(|r| r.requests.as_ref())
                .and_then(|m| m.get(name))
                .and_then(|q| parse_quantity(&q.0).ok())
                .filter(|v| *v > 0.0);
            if let Some(v) = request {
                *requests.entry(name).or_default() += v;
            }

            let limit = resources
                .and_then(|r| r.limits.as_ref())
                .and_then(|m| m.get(name))
                .and_then(|q| parse_quantity(&q.0).ok())
                .filter(|v| *v > 0.0);
            match limit {
                Some(v) => *limits.entry(name).or_default() += v,
                None => limits_cover_all = false,
            }
        }
    }

    if requests.is_empty() && limits.is_empty() {
        return QosClass::BestEffort;
    }

    let guaranteed = limits_cover_all
        && requests.len() == limits.len()
        && requests
            .iter()
            .all(|(name, req)| limits.get(name).map(|lim| lim == req).unwrap_or(false));

    if guaranteed {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}

/// Status entry for the named container, app or init
pub fn container_status<'a>(pod: &'a Pod, name: &str) -> Option<&'a ContainerStatus> {
    let status = pod.status.as_ref()?;
    status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .find(|cs| cs.name == name)
}

/// Split a runtime container id ("cri-o://abc") into scheme and id
pub fn parse_container_id(raw: &str) -> Option<(&str, &str)> {
    let (scheme, id) = raw.trim_matches('"').split_once("://")?;
    if id.is_empty() {
        return None;
    }
    Some((scheme, id))
}
