//! Pod and container cgroup paths under the systemd cgroup driver

use crate::error::{AgentError, Result};
use crate::resources::{parse_container_id, qos_class, QosClass};
use k8s_openapi::api::core::v1::Pod;

const KUBEPODS_SLICE: &str = "kubepods.slice";

/// Cgroup path of a pod, relative to the cgroup root
///
/// `kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod<uid>.slice`,
/// with guaranteed pods directly under `kubepods.slice`.
pub fn pod_cgroup_path(pod: &Pod) -> Result<String> {
    let uid = pod
        .metadata
        .uid
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AgentError::CgroupPath("pod UID is empty".to_string()))?;
    let pod_slice = format!("pod{}.slice", uid.replace('-', "_"));

    let path = match qos_class(pod) {
        QosClass::Guaranteed => format!("{}/kubepods-{}", KUBEPODS_SLICE, pod_slice),
        QosClass::Burstable => format!(
            "{}/kubepods-burstable.slice/kubepods-burstable-{}",
            KUBEPODS_SLICE, pod_slice
        ),
        QosClass::BestEffort => format!(
            "{}/kubepods-besteffort.slice/kubepods-besteffort-{}",
            KUBEPODS_SLICE, pod_slice
        ),
    };
    Ok(path)
}

/// Systemd scope prefix used by each runtime
fn scope_prefix(scheme: &str) -> Result<&'static str> {
    match scheme {
        "cri-o" => Ok("crio"),
        "containerd" => Ok("cri-containerd"),
        "docker" => Ok("docker"),
        other => Err(AgentError::CgroupPath(format!(
            "unsupported container runtime {:?}",
            other
        ))),
    }
}

/// Cgroup path of a container given its pod path and status container id
pub fn container_cgroup_path(pod_path: &str, raw_container_id: &str) -> Result<String> {
    let (scheme, id) = parse_container_id(raw_container_id).ok_or_else(|| {
        AgentError::CgroupPath(format!("invalid container id {:?}", raw_container_id))
    })?;
    Ok(format!("{}/{}-{}.scope", pod_path, scope_prefix(scheme)?, id))
}
