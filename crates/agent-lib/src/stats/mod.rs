//! Node-wide swap activity sampling
//!
//! The sampler keeps a bounded history of `/proc` swap counters that the
//! shortage detector turns into average swap-in/out rates.

mod procfs;
mod sampler;

pub use procfs::{MemInfo, ProcStatsSource, SystemStats, SystemStatsSource};
pub use sampler::{StatsSampler, DEFAULT_HISTORY_CAPACITY};

#[cfg(test)]
pub(crate) use procfs::fixtures;
