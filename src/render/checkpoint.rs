//! Renderer-driven half of the slot rendezvous.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{error, warn};

use super::METRIC_COORDINATION_DEFECT;
use super::slots::{CacheDecision, CheckpointClaim, ClaimError, RenderPhase, SlotRegistry, SlotTag};
use super::types::{CoordinationError, Redirect, RequestContext};

/// State reported by the renderer when it reaches its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    slot: Option<SlotTag>,
    redirect: Option<Redirect>,
}

impl Checkpoint {
    /// Checkpoint for the request the renderer was handed.
    pub fn new(context: &RequestContext) -> Self {
        Self {
            slot: context.slot(),
            redirect: None,
        }
    }

    pub fn redirected(mut self, redirect: Redirect) -> Self {
        self.redirect = Some(redirect);
        self
    }

    pub fn slot(&self) -> Option<SlotTag> {
        self.slot
    }

    pub fn redirect(&self) -> Option<&Redirect> {
        self.redirect.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The coordinator is serving a cached copy.
    CacheHit,
    /// The render redirected; the coordinator already answered the request.
    Redirected,
    /// Nobody is waiting for this render any more.
    Abandoned,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::CacheHit => "cache hit",
            Self::Redirected => "redirected",
            Self::Abandoned => "abandoned",
        };
        f.write_str(reason)
    }
}

/// Answer given to the renderer at its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDecision {
    /// Finish the render; its result is wanted.
    Continue,
    /// Stop past the checkpoint; any further work is wasted.
    Stop(StopReason),
}

/// Callback invoked by renderers at their mid-render checkpoint.
///
/// The returned future gates the renderer: it resolves once the caller has
/// decided whether the rest of the render is needed.
#[async_trait]
pub trait CheckpointHook: Send + Sync {
    async fn on_checkpoint(
        &self,
        checkpoint: Checkpoint,
    ) -> Result<CheckpointDecision, CoordinationError>;
}

/// Hook that never intercepts.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl CheckpointHook for PassThrough {
    async fn on_checkpoint(
        &self,
        _checkpoint: Checkpoint,
    ) -> Result<CheckpointDecision, CoordinationError> {
        Ok(CheckpointDecision::Continue)
    }
}

/// Hook that routes each checkpoint to the slot stamped on its request.
///
/// Requests without a slot are not coordinated and always continue.
pub struct SlotCheckpoint {
    slots: Arc<SlotRegistry>,
}

impl SlotCheckpoint {
    pub fn new(slots: Arc<SlotRegistry>) -> Self {
        Self { slots }
    }
}

#[async_trait]
impl CheckpointHook for SlotCheckpoint {
    async fn on_checkpoint(
        &self,
        checkpoint: Checkpoint,
    ) -> Result<CheckpointDecision, CoordinationError> {
        let Some(tag) = checkpoint.slot else {
            return Ok(CheckpointDecision::Continue);
        };

        let CheckpointClaim {
            phase_tx,
            decision_rx,
        } = match self.slots.claim(tag) {
            Ok(claim) => claim,
            Err(ClaimError::Stale) => {
                warn!(
                    slot = tag.index(),
                    generation = tag.generation(),
                    "checkpoint reached after its request was released"
                );
                return Ok(CheckpointDecision::Stop(StopReason::Abandoned));
            }
            Err(ClaimError::Unknown) => {
                return Err(defect(CoordinationError::UnknownSlot { index: tag.index() }));
            }
            Err(ClaimError::AlreadyClaimed) => {
                return Err(defect(CoordinationError::SignalAlreadySettled {
                    index: tag.index(),
                }));
            }
        };

        if let Some(redirect) = checkpoint.redirect {
            // The coordinator answers the request itself; the render must not go on.
            let _ = phase_tx.send(RenderPhase::Redirected(redirect));
            return Ok(CheckpointDecision::Stop(StopReason::Redirected));
        }

        if phase_tx.send(RenderPhase::Continue).is_err() {
            return Ok(CheckpointDecision::Stop(StopReason::Abandoned));
        }

        Ok(match decision_rx.await {
            Ok(CacheDecision::Miss) => CheckpointDecision::Continue,
            Ok(CacheDecision::Hit) => CheckpointDecision::Stop(StopReason::CacheHit),
            Err(_) => CheckpointDecision::Stop(StopReason::Abandoned),
        })
    }
}

fn defect(err: CoordinationError) -> CoordinationError {
    counter!(METRIC_COORDINATION_DEFECT).increment(1);
    error!(error = %err, "slot coordination defect");
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(lease: &super::super::slots::SlotLease) -> RequestContext {
        let mut context = RequestContext::new();
        context.stamp(lease.tag());
        context
    }

    #[tokio::test]
    async fn unstamped_requests_continue() {
        let hook = SlotCheckpoint::new(Arc::new(SlotRegistry::new()));
        let decision = hook
            .on_checkpoint(Checkpoint::new(&RequestContext::new()))
            .await
            .expect("no defect");
        assert_eq!(decision, CheckpointDecision::Continue);
    }

    #[tokio::test]
    async fn redirect_stops_immediately_and_reports_phase() {
        let slots = Arc::new(SlotRegistry::new());
        let hook = SlotCheckpoint::new(Arc::clone(&slots));
        let mut lease = slots.acquire();
        let checkpoint = Checkpoint::new(&stamped(&lease)).redirected(Redirect::to("/login"));

        let decision = hook.on_checkpoint(checkpoint).await.expect("no defect");

        assert_eq!(decision, CheckpointDecision::Stop(StopReason::Redirected));
        assert_eq!(
            lease.phase_signal().await.expect("phase sent"),
            RenderPhase::Redirected(Redirect::to("/login"))
        );
    }

    #[tokio::test]
    async fn waits_for_cache_decision() {
        let slots = Arc::new(SlotRegistry::new());
        let hook = Arc::new(SlotCheckpoint::new(Arc::clone(&slots)));
        let mut lease = slots.acquire();
        let checkpoint = Checkpoint::new(&stamped(&lease));

        let renderer_side = tokio::spawn({
            let hook = Arc::clone(&hook);
            async move { hook.on_checkpoint(checkpoint).await }
        });

        assert_eq!(
            lease.phase_signal().await.expect("phase sent"),
            RenderPhase::Continue
        );
        assert!(lease.decide(CacheDecision::Hit));

        let decision = renderer_side
            .await
            .expect("task joins")
            .expect("no defect");
        assert_eq!(decision, CheckpointDecision::Stop(StopReason::CacheHit));
    }

    #[tokio::test]
    async fn released_lease_abandons_render() {
        let slots = Arc::new(SlotRegistry::new());
        let hook = SlotCheckpoint::new(Arc::clone(&slots));
        let lease = slots.acquire();
        let checkpoint = Checkpoint::new(&stamped(&lease));
        drop(lease);

        let decision = hook.on_checkpoint(checkpoint).await.expect("no defect");
        assert_eq!(decision, CheckpointDecision::Stop(StopReason::Abandoned));
    }

    #[tokio::test]
    async fn second_checkpoint_for_same_request_is_a_defect() {
        let slots = Arc::new(SlotRegistry::new());
        let hook = SlotCheckpoint::new(Arc::clone(&slots));
        let lease = slots.acquire();
        let context = stamped(&lease);

        let _claimed = slots.claim(lease.tag()).expect("first claim");
        let err = hook
            .on_checkpoint(Checkpoint::new(&context))
            .await
            .expect_err("second checkpoint must fail");

        assert_eq!(
            err,
            CoordinationError::SignalAlreadySettled {
                index: lease.tag().index()
            }
        );
    }
}
