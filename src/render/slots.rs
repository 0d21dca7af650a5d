//! Arena of coordination slots.
//!
//! Each cacheable request checks out one slot for the duration of its render.
//! A slot pairs two one-shot signals: the render-phase signal (renderer →
//! coordinator, fired from the checkpoint hook) and the cache-decision signal
//! (coordinator → renderer). Indices are recycled through a free list; every
//! release bumps the slot generation so a tag from an earlier checkout is
//! recognised as stale instead of reaching the wrong request.

use std::sync::{Arc, Mutex};

use metrics::gauge;
use tokio::sync::oneshot;
use tracing::error;

use crate::cache::lock::mutex_lock;

use super::types::Redirect;

const SOURCE: &str = "render::slots";
const METRIC_SLOTS_IN_USE: &str = "render_cache_slots_in_use";

/// Identifies one checkout of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotTag {
    index: usize,
    generation: u64,
}

impl SlotTag {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What the renderer reported at its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RenderPhase {
    Continue,
    Redirected(Redirect),
}

/// Outcome of the cache lookup, sent back to the waiting renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Hit,
    Miss,
}

/// Renderer-side halves of a slot's signals, handed out once per checkout.
pub(crate) struct CheckpointClaim {
    pub(crate) phase_tx: oneshot::Sender<RenderPhase>,
    pub(crate) decision_rx: oneshot::Receiver<CacheDecision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimError {
    /// The index was never handed out.
    Unknown,
    /// The checkout this tag belongs to has already been released.
    Stale,
    /// The checkpoint already fired for this checkout.
    AlreadyClaimed,
}

struct PendingSignals {
    phase_tx: Option<oneshot::Sender<RenderPhase>>,
    decision_rx: Option<oneshot::Receiver<CacheDecision>>,
}

struct SlotEntry {
    generation: u64,
    pending: Option<PendingSignals>,
}

#[derive(Default)]
struct SlotTable {
    entries: Vec<SlotEntry>,
    free: Vec<usize>,
}

impl SlotTable {
    fn in_use(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

/// Pool of reusable coordination slots.
#[derive(Default)]
pub struct SlotRegistry {
    table: Mutex<SlotTable>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out a slot with fresh signals.
    ///
    /// Reuses the most recently released index when one is free, otherwise
    /// grows the arena by one.
    pub fn acquire(self: &Arc<Self>) -> SlotLease {
        let (phase_tx, phase_rx) = oneshot::channel();
        let (decision_tx, decision_rx) = oneshot::channel();
        let pending = PendingSignals {
            phase_tx: Some(phase_tx),
            decision_rx: Some(decision_rx),
        };

        let mut table = mutex_lock(&self.table, SOURCE, "acquire");
        let tag = match table.free.pop() {
            Some(index) => {
                let entry = &mut table.entries[index];
                entry.pending = Some(pending);
                SlotTag {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = table.entries.len();
                table.entries.push(SlotEntry {
                    generation: 0,
                    pending: Some(pending),
                });
                SlotTag {
                    index,
                    generation: 0,
                }
            }
        };
        gauge!(METRIC_SLOTS_IN_USE).set(table.in_use() as f64);
        drop(table);

        SlotLease {
            tag,
            registry: Arc::clone(self),
            phase_rx,
            decision_tx: Some(decision_tx),
        }
    }

    /// Take the renderer-side signals for a checkout. Succeeds once per checkout.
    pub(crate) fn claim(&self, tag: SlotTag) -> Result<CheckpointClaim, ClaimError> {
        let mut table = mutex_lock(&self.table, SOURCE, "claim");
        let entry = table
            .entries
            .get_mut(tag.index)
            .ok_or(ClaimError::Unknown)?;

        if entry.generation > tag.generation {
            return Err(ClaimError::Stale);
        }
        if entry.generation < tag.generation {
            return Err(ClaimError::Unknown);
        }

        let pending = entry.pending.as_mut().ok_or(ClaimError::Stale)?;
        match (pending.phase_tx.take(), pending.decision_rx.take()) {
            (Some(phase_tx), Some(decision_rx)) => Ok(CheckpointClaim {
                phase_tx,
                decision_rx,
            }),
            _ => Err(ClaimError::AlreadyClaimed),
        }
    }

    /// Panics in debug builds when `tag` is not a live checkout.
    fn release(&self, tag: SlotTag) {
        let mut table = mutex_lock(&self.table, SOURCE, "release");
        let Some(entry) = table.entries.get_mut(tag.index) else {
            drop(table);
            error!(slot = tag.index, "released a slot that was never allocated");
            debug_assert!(false, "released slot {} that was never allocated", tag.index);
            return;
        };
        if entry.generation != tag.generation || entry.pending.is_none() {
            drop(table);
            error!(
                slot = tag.index,
                generation = tag.generation,
                "slot released twice"
            );
            debug_assert!(false, "slot {} released twice", tag.index);
            return;
        }

        entry.pending = None;
        entry.generation += 1;
        table.free.push(tag.index);
        gauge!(METRIC_SLOTS_IN_USE).set(table.in_use() as f64);
    }

    /// Number of slots currently checked out.
    pub fn in_use(&self) -> usize {
        mutex_lock(&self.table, SOURCE, "in_use").in_use()
    }

    /// Number of released indices waiting for reuse.
    pub fn free_len(&self) -> usize {
        mutex_lock(&self.table, SOURCE, "free_len").free.len()
    }

    /// Number of distinct indices ever allocated.
    pub fn allocated(&self) -> usize {
        mutex_lock(&self.table, SOURCE, "allocated").entries.len()
    }
}

/// Exclusive checkout of a slot; releases the slot when dropped.
///
/// The lease owns the coordinator-side halves of both signals, so the slot
/// cannot return to the free list while either of them is still reachable
/// through it. An unsent cache decision is settled as abandoned on drop.
pub struct SlotLease {
    tag: SlotTag,
    registry: Arc<SlotRegistry>,
    phase_rx: oneshot::Receiver<RenderPhase>,
    decision_tx: Option<oneshot::Sender<CacheDecision>>,
}

impl SlotLease {
    pub fn tag(&self) -> SlotTag {
        self.tag
    }

    pub(crate) fn phase_signal(&mut self) -> &mut oneshot::Receiver<RenderPhase> {
        &mut self.phase_rx
    }

    /// Settle the cache-decision signal.
    ///
    /// Returns false when the decision was already sent or the renderer no
    /// longer waits for it.
    pub(crate) fn decide(&mut self, decision: CacheDecision) -> bool {
        match self.decision_tx.take() {
            Some(sender) => sender.send(decision).is_ok(),
            None => false,
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.decision_tx.take();
        self.phase_rx.close();
        self.registry.release(self.tag);
    }
}
