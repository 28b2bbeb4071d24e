//! Memory-pressure eviction
//!
//! Filtering, ranking and deletion of candidate pods, the node taint that
//! marks the evicting state, and the control loop tying them to the
//! shortage detector.

mod controller;
mod evictor;
mod filter;
mod ranker;
mod taint;


pub use controller::{is_pod_alive, CycleOutcome, EvictionController, EvictionControllerConfig};
pub use evictor::PodEvictor;
pub use filter::PodFilter;
pub use ranker::{rank_with_summaries, PodRanker};
pub use taint::{
    eviction_taint, has_eviction_taint, with_eviction_taint, without_eviction_taint,
    TAINT_EFFECT_NO_SCHEDULE,
};
