//! Per-request render orchestration.
//!
//! A cacheable request checks out a slot, starts the render as its own task
//! and waits for the renderer's checkpoint. At the checkpoint the coordinator
//! learns whether the render redirected; if not it consults the store and
//! either stops the render (hit) or lets it finish and stores the result
//! (miss). Requests the key policy rejects go straight to the renderer.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, instrument, warn};

use crate::cache::{CacheConfig, CacheStore, Codec, JsonCodec, KeyPolicy, VersionGate};

use super::METRIC_COORDINATION_DEFECT;
use super::checkpoint::{CheckpointHook, PassThrough, SlotCheckpoint};
use super::slots::{CacheDecision, RenderPhase, SlotRegistry};
use super::types::{CoordinationError, RenderError, RenderResult, Renderer, RequestContext};

const METRIC_HIT: &str = "render_cache_hit_total";
const METRIC_MISS: &str = "render_cache_miss_total";
const METRIC_BYPASS: &str = "render_cache_bypass_total";
const METRIC_REDIRECT: &str = "render_cache_redirect_total";
const METRIC_STORE_ERROR: &str = "render_cache_store_error_total";
const METRIC_WRITE: &str = "render_cache_write_total";
const METRIC_RENDER_MS: &str = "render_cache_render_ms";

type RenderTask = JoinHandle<Result<RenderResult, RenderError>>;

pub struct RenderCoordinator {
    renderer: Arc<dyn Renderer>,
    store: Arc<dyn CacheStore>,
    codec: Arc<dyn Codec>,
    key_policy: Arc<dyn KeyPolicy>,
    entry_ttl: Option<Duration>,
    slots: Arc<SlotRegistry>,
    hook: Arc<SlotCheckpoint>,
    version: Arc<VersionGate>,
    writes: Arc<PendingWrites>,
}

impl RenderCoordinator {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let slots = Arc::new(SlotRegistry::new());
        let hook = Arc::new(SlotCheckpoint::new(Arc::clone(&slots)));
        let version = Arc::new(VersionGate::new(Arc::clone(&store), config.version));

        Self {
            renderer,
            store,
            codec: Arc::new(JsonCodec),
            key_policy: config.key_policy,
            entry_ttl: config.entry_ttl,
            slots,
            hook,
            version,
            writes: Arc::new(PendingWrites::default()),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn slots(&self) -> &Arc<SlotRegistry> {
        &self.slots
    }

    pub fn version_gate(&self) -> &VersionGate {
        &self.version
    }

    /// Render `route`, serving or populating the cache when the key policy allows.
    #[instrument(skip(self, route, context), fields(route = %route, cache.key, slot))]
    pub async fn handle(
        &self,
        route: &str,
        mut context: RequestContext,
    ) -> Result<RenderResult, RenderError> {
        self.persist_version();

        let Some(key) = self.key_policy.cache_key(route, &context) else {
            counter!(METRIC_BYPASS).increment(1);
            return self
                .renderer
                .render_route(route.to_string(), context, Arc::new(PassThrough))
                .await;
        };

        let mut lease = self.slots.acquire();
        let tag = lease.tag();
        context.stamp(tag);
        let span = tracing::Span::current();
        span.record("cache.key", key.as_str());
        span.record("slot", tag.index());

        let started = Instant::now();
        let mut render = self.spawn_render(route, context);

        let phase = tokio::select! {
            biased;
            phase = lease.phase_signal() => phase,
            joined = &mut render => {
                warn!("renderer finished without reaching its checkpoint");
                return join_outcome(joined);
            }
        };

        match phase {
            Ok(RenderPhase::Redirected(redirect)) => {
                counter!(METRIC_REDIRECT).increment(1);
                debug!(location = %redirect.location, status = redirect.status, "render redirected");
                return Ok(RenderResult::redirect(redirect));
            }
            Ok(RenderPhase::Continue) => {}
            Err(_) => {
                let err = CoordinationError::PhaseSignalLost { index: tag.index() };
                counter!(METRIC_COORDINATION_DEFECT).increment(1);
                error!(error = %err, "slot coordination defect");
                render.abort();
                return Err(err.into());
            }
        }

        if let Some(cached) = self.lookup(&key).await {
            counter!(METRIC_HIT).increment(1);
            lease.decide(CacheDecision::Hit);
            debug!("served from cache");
            return Ok(cached);
        }

        counter!(METRIC_MISS).increment(1);
        if !lease.decide(CacheDecision::Miss) {
            debug!("renderer stopped waiting for the cache decision");
        }

        let outcome = join_outcome(render.await);
        histogram!(METRIC_RENDER_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        drop(lease);

        match &outcome {
            Ok(result) if result.is_cacheable() => self.spawn_write(key, result),
            Ok(_) => debug!("render result carries an error; not cached"),
            Err(err) => debug!(error = %err, "render failed; not cached"),
        }
        outcome
    }

    /// Wait until every background store write has finished.
    pub async fn settle_writes(&self) {
        self.writes.settle().await;
    }

    fn spawn_render(&self, route: &str, context: RequestContext) -> RenderTask {
        let renderer = Arc::clone(&self.renderer);
        let hook: Arc<dyn CheckpointHook> = self.hook.clone();
        let route = route.to_string();
        tokio::spawn(async move { renderer.render_route(route, context, hook).await })
    }

    /// Store lookup; read failures and undecodable entries count as a miss.
    async fn lookup(&self, key: &str) -> Option<RenderResult> {
        let bytes = match self.store.get(key).await {
            Ok(bytes) => bytes?,
            Err(err) => {
                counter!(METRIC_STORE_ERROR).increment(1);
                warn!(cache.key = %key, backend = self.store.name(), error = %err, "cache read failed");
                return None;
            }
        };

        match self.codec.decode(&bytes) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(cache.key = %key, error = %err, "discarding undecodable cache entry");
                None
            }
        }
    }

    fn spawn_write(&self, key: String, result: &RenderResult) {
        let bytes = match self.codec.encode(result) {
            Ok(bytes) => bytes,
            Err(err) => {
                counter!(METRIC_WRITE, "outcome" => "encode_failed").increment(1);
                warn!(cache.key = %key, error = %err, "failed to encode render result");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let ttl = self.entry_ttl;
        let guard = self.writes.track();
        tokio::spawn(async move {
            let _guard = guard;
            match store.set(&key, bytes, ttl).await {
                Ok(()) => {
                    counter!(METRIC_WRITE, "outcome" => "stored").increment(1);
                    debug!(cache.key = %key, "stored rendered page");
                }
                Err(err) => {
                    counter!(METRIC_WRITE, "outcome" => "failed").increment(1);
                    counter!(METRIC_STORE_ERROR).increment(1);
                    warn!(cache.key = %key, error = %err, "cache write failed");
                }
            }
        });
    }

    fn persist_version(&self) {
        if !self.version.needs_persist() {
            return;
        }
        let gate = Arc::clone(&self.version);
        let guard = self.writes.track();
        tokio::spawn(async move {
            let _guard = guard;
            gate.try_persist().await;
        });
    }
}

fn join_outcome(
    joined: Result<Result<RenderResult, RenderError>, JoinError>,
) -> Result<RenderResult, RenderError> {
    match joined {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => {
            let message = panic_message(err.into_panic());
            error!(panic = %message, "render task panicked");
            Err(RenderError::Panicked(message))
        }
        Err(err) => Err(RenderError::failed(format!("render task cancelled: {err}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(_) => "non-string panic payload".to_string(),
    }
}

/// Counts background store writes so shutdown can wait for them.
#[derive(Default)]
struct PendingWrites {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingWrites {
    fn track(self: &Arc<Self>) -> WriteGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        WriteGuard(Arc::clone(self))
    }

    async fn settle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct WriteGuard(Arc<PendingWrites>);

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
