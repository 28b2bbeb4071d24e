//! Cgroup swap ceiling writes

use crate::error::{AgentError, Result};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub const SWAP_MAX_FILE: &str = "memory.swap.max";

/// Unified-hierarchy path from a `/proc/<pid>/cgroup` listing
pub fn parse_unified_path(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

/// Host cgroup directory of the process `pid`
pub async fn cgroup_dir_for_pid(proc_root: &Path, cgroup_root: &Path, pid: u32) -> Result<PathBuf> {
    let file = proc_root.join(pid.to_string()).join("cgroup");
    let content = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| AgentError::io(&file, e))?;

    let relative = parse_unified_path(&content).ok_or_else(|| {
        AgentError::CgroupPath(format!("no unified hierarchy entry in {}", file.display()))
    })?;
    Ok(cgroup_root.join(relative.trim_start_matches('/')))
}

/// Write the container's swap ceiling in bytes
///
/// The control file is never created; a missing file means the cgroup is gone.
pub async fn write_swap_limit(cgroup_dir: &Path, bytes: u64) -> Result<()> {
    let path = cgroup_dir.join(SWAP_MAX_FILE);
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .await
        .map_err(|e| AgentError::io(&path, e))?;
    file.write_all(bytes.to_string().as_bytes())
        .await
        .map_err(|e| AgentError::io(&path, e))?;
    file.flush().await.map_err(|e| AgentError::io(&path, e))
}

/// Swap share proportional to the container's memory request
///
/// `floor(request / total_memory * total_swap)`, zero on a node without memory.
pub fn swap_allocation(memory_request: u64, total_memory: u64, total_swap: u64) -> u64 {
    if total_memory == 0 {
        return 0;
    }
    let share = memory_request as u128 * total_swap as u128 / total_memory as u128;
    u64::try_from(share).unwrap_or(u64::MAX)
}
