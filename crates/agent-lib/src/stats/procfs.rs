//! System-wide swap and memory counters from procfs
//!
//! Reads `/proc/vmstat` for the cumulative `pswpin`/`pswpout` page counters
//! and `/proc/meminfo` for memory and swap totals.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

/// Raw readings taken at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemStats {
    pub swap_in_pages: u64,
    pub swap_out_pages: u64,
    pub memory: MemInfo,
}

/// The subset of `/proc/meminfo` the agent uses, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub inactive_file: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

impl MemInfo {
    pub fn swap_used(&self) -> u64 {
        self.swap_total.saturating_sub(self.swap_free)
    }

    /// In-use memory minus reclaimable inactive page cache
    pub fn working_set(&self) -> u64 {
        self.mem_total
            .saturating_sub(self.mem_free)
            .saturating_sub(self.inactive_file)
    }
}

/// Source of system swap/memory readings
#[async_trait]
pub trait SystemStatsSource: Send + Sync {
    async fn read(&self) -> Result<SystemStats>;

    async fn meminfo(&self) -> Result<MemInfo>;
}

/// Reads counters from a (possibly host-mounted) procfs
#[derive(Debug, Clone)]
pub struct ProcStatsSource {
    proc_path: PathBuf,
}

impl ProcStatsSource {
    pub fn new(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
        }
    }

    /// Parse `/proc/vmstat`, returning (pswpin, pswpout)
    pub fn parse_vmstat(content: &str) -> Result<(u64, u64)> {
        let mut swap_in = None;
        let mut swap_out = None;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("pswpin"), Some(v)) => swap_in = v.parse().ok(),
                (Some("pswpout"), Some(v)) => swap_out = v.parse().ok(),
                _ => {}
            }
        }

        match (swap_in, swap_out) {
            (Some(i), Some(o)) => Ok((i, o)),
            _ => Err(AgentError::Other(
                "vmstat is missing pswpin/pswpout".to_string(),
            )),
        }
    }

    /// Parse `/proc/meminfo`; values are reported in kB
    pub fn parse_meminfo(content: &str) -> Result<MemInfo> {
        let fields: HashMap<&str, u64> = content
            .lines()
            .filter_map(|line| {
                let (key, rest) = line.split_once(':')?;
                let value = rest.split_whitespace().next()?.parse::<u64>().ok()?;
                Some((key.trim(), value * 1024))
            })
            .collect();

        let get = |key: &str| {
            fields
                .get(key)
                .copied()
                .ok_or_else(|| AgentError::Other(format!("meminfo is missing {}", key)))
        };

        Ok(MemInfo {
            mem_total: get("MemTotal")?,
            mem_free: get("MemFree")?,
            mem_available: get("MemAvailable")?,
            inactive_file: fields.get("Inactive(file)").copied().unwrap_or(0),
            swap_total: get("SwapTotal")?,
            swap_free: get("SwapFree")?,
        })
    }

    async fn read_file(&self, name: &str) -> Result<String> {
        let path = self.proc_path.join(name);
        fs::read_to_string(&path)
            .await
            .map_err(|e| AgentError::io(path, e))
    }
}

#[async_trait]
impl SystemStatsSource for ProcStatsSource {
    async fn read(&self) -> Result<SystemStats> {
        let vmstat = self.read_file("vmstat").await?;
        let (swap_in_pages, swap_out_pages) = Self::parse_vmstat(&vmstat)?;
        let memory = self.meminfo().await?;

        Ok(SystemStats {
            swap_in_pages,
            swap_out_pages,
            memory,
        })
    }

    async fn meminfo(&self) -> Result<MemInfo> {
        let content = self.read_file("meminfo").await?;
        Self::parse_meminfo(&content)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_vmstat() {
        let (i, o) = ProcStatsSource::parse_vmstat(VMSTAT).unwrap();
        assert_eq!(i, 1200);
        assert_eq!(o, 3400);
        assert!(ProcStatsSource::parse_vmstat("pgfault 1").is_err());
    }

    #[test]
    fn test_parse_meminfo() {
        let info = ProcStatsSource::parse_meminfo(MEMINFO).unwrap();
        assert_eq!(info.mem_total, 16384000 * 1024);
        assert_eq!(info.inactive_file, 1024000 * 1024);
        assert_eq!(info.swap_used(), 1024000 * 1024);
        assert_eq!(
            info.working_set(),
            (16384000 - 2048000 - 1024000) * 1024
        );
    }

    #[test]
    fn test_parse_meminfo_missing_field() {
        assert!(ProcStatsSource::parse_meminfo("MemTotal: 1 kB\n").is_err());
    }

    #[tokio::test]
    async fn test_read_from_mock_proc() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("vmstat"), VMSTAT).unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();

        let source = ProcStatsSource::new(dir.path());
        let stats = source.read().await.unwrap();
        assert_eq!(stats.swap_in_pages, 1200);
        assert_eq!(stats.memory.swap_total, 4096000 * 1024);
    }

    #[tokio::test]
    async fn test_read_missing_proc_is_io_error() {
        let dir = TempDir::new().unwrap();
        let source = ProcStatsSource::new(dir.path());
        let err = source.read().await.unwrap_err();
        assert!(matches!(err, AgentError::Io { .. }));
    }
}
