//! Render coordination.
//!
//! The coordinator and the renderer meet at the renderer's checkpoint through
//! a per-request slot: the renderer reports its phase, the coordinator answers
//! with the cache decision.

mod checkpoint;
mod coordinator;
mod slots;
mod types;

/// Counter for coordination defects, shared by both halves of the rendezvous.
pub(crate) const METRIC_COORDINATION_DEFECT: &str = "render_cache_coordination_defect_total";

pub use checkpoint::{
    Checkpoint, CheckpointDecision, CheckpointHook, PassThrough, SlotCheckpoint, StopReason,
};
pub use coordinator::RenderCoordinator;
pub use slots::{CacheDecision, SlotLease, SlotRegistry, SlotTag};
pub use types::{
    CoordinationError, Redirect, RenderError, RenderResult, Renderer, RequestContext,
};
