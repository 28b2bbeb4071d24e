//! Node taint marking the evicting state

use k8s_openapi::api::core::v1::{Node, Taint};

pub const TAINT_EFFECT_NO_SCHEDULE: &str = "NoSchedule";

fn node_taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or(&[])
}

pub fn eviction_taint(key: &str) -> Taint {
    Taint {
        key: key.to_string(),
        effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
        ..Taint::default()
    }
}

/// Whether the node carries the eviction taint
pub fn has_eviction_taint(node: &Node, key: &str) -> bool {
    node_taints(node)
        .iter()
        .any(|t| t.key == key && t.effect == TAINT_EFFECT_NO_SCHEDULE)
}

/// Node taints with exactly one eviction taint
pub fn with_eviction_taint(node: &Node, key: &str) -> Vec<Taint> {
    let mut taints = without_eviction_taint(node, key);
    taints.push(eviction_taint(key));
    taints
}

/// Node taints with every instance of the eviction taint key removed
pub fn without_eviction_taint(node: &Node, key: &str) -> Vec<Taint> {
    node_taints(node)
        .iter()
        .filter(|t| t.key != key)
        .cloned()
        .collect()
}
