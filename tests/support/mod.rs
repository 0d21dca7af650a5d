#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use render_cache::cache::{
    CacheConfig, CacheStore, Codec, JsonCodec, KeyPolicy, MemoryStore, StoreError,
};
use render_cache::render::{
    Checkpoint, CheckpointDecision, CheckpointHook, Redirect, RenderCoordinator, RenderError,
    RenderResult, Renderer, RequestContext, StopReason,
};

/// What the scripted renderer does for one route.
#[derive(Debug, Clone)]
pub enum Script {
    Page(String),
    Redirect(Redirect),
    ErrorPage(String),
    Fail(String),
    Panic,
    SkipCheckpoint,
}

/// Renderer driven by per-route scripts; unscripted routes render `<p>{route}</p>`.
#[derive(Default)]
pub struct ScriptedRenderer {
    scripts: HashMap<String, Script>,
    delay: Option<Duration>,
    invocations: AtomicUsize,
    checkpoints: AtomicUsize,
    completions: AtomicUsize,
    stops: Mutex<Vec<StopReason>>,
    active_slots: Mutex<HashSet<usize>>,
    overlaps: AtomicUsize,
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, route: &str, script: Script) -> Self {
        self.scripts.insert(route.to_string(), script);
        self
    }

    /// Sleep before reaching the checkpoint.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn checkpoints(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    /// Renders that went past their checkpoint.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> Vec<StopReason> {
        self.stops.lock().unwrap().clone()
    }

    /// Times two renders in flight carried the same slot index.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        route: &str,
        context: &RequestContext,
        hook: Arc<dyn CheckpointHook>,
    ) -> Result<RenderResult, RenderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let script = self
            .scripts
            .get(route)
            .cloned()
            .unwrap_or_else(|| Script::Page(format!("<p>{route}</p>")));

        match &script {
            Script::SkipCheckpoint => {
                self.completions.fetch_add(1, Ordering::SeqCst);
                return Ok(RenderResult::html(format!("<p>unchecked {route}</p>")));
            }
            Script::Redirect(redirect) => {
                self.checkpoints.fetch_add(1, Ordering::SeqCst);
                let checkpoint = Checkpoint::new(context).redirected(redirect.clone());
                if let CheckpointDecision::Stop(reason) = hook.on_checkpoint(checkpoint).await? {
                    self.stops.lock().unwrap().push(reason);
                }
                return Ok(RenderResult::redirect(redirect.clone()));
            }
            _ => {}
        }

        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        if let CheckpointDecision::Stop(reason) =
            hook.on_checkpoint(Checkpoint::new(context)).await?
        {
            self.stops.lock().unwrap().push(reason);
            return Err(RenderError::Stopped(reason));
        }
        self.completions.fetch_add(1, Ordering::SeqCst);

        match script {
            Script::Page(html) => Ok(RenderResult::html(html)),
            Script::ErrorPage(html) => Ok(RenderResult::html(html).with_error("render error")),
            Script::Fail(message) => Err(RenderError::failed(message)),
            Script::Panic => panic!("renderer exploded"),
            Script::Redirect(_) | Script::SkipCheckpoint => unreachable!("handled above"),
        }
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn render_route(
        &self,
        route: String,
        context: RequestContext,
        hook: Arc<dyn CheckpointHook>,
    ) -> Result<RenderResult, RenderError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let slot = context.slot().map(|tag| tag.index());
        if let Some(index) = slot {
            if !self.active_slots.lock().unwrap().insert(index) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }

        let outcome = self.run(&route, &context, hook).await;

        if let Some(index) = slot {
            self.active_slots.lock().unwrap().remove(&index);
        }
        outcome
    }
}

/// Memory store that counts every call and can be switched offline.
pub struct CountingStore {
    inner: MemoryStore,
    gets: AtomicUsize,
    sets: AtomicUsize,
    resets: AtomicUsize,
    offline: AtomicBool,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(NonZeroUsize::new(64).unwrap()),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    pub fn offline() -> Self {
        let store = Self::new();
        store.offline.store(true, Ordering::SeqCst);
        store
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn ops(&self) -> usize {
        self.gets() + self.sets() + self.resets.load(Ordering::SeqCst)
    }

    pub async fn stored(&self, key: &str) -> Option<RenderResult> {
        let bytes = self.inner.get(key).await.unwrap()?;
        Some(JsonCodec.decode(&bytes).expect("stored entry decodes"))
    }

    pub async fn raw(&self, key: &str) -> Option<Bytes> {
        self.inner.get(key).await.unwrap()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::backend("counting", "store offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for CountingStore {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn reset(&self) -> Result<(), StoreError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.reset().await
    }
}

pub fn host_context() -> RequestContext {
    RequestContext::new().with_host("example.com")
}

pub fn coordinator(
    policy: impl KeyPolicy + 'static,
    store: &Arc<CountingStore>,
    renderer: &Arc<ScriptedRenderer>,
) -> RenderCoordinator {
    RenderCoordinator::new(CacheConfig::new(policy), store.clone(), renderer.clone())
}
