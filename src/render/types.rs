use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::checkpoint::{CheckpointHook, StopReason};
use super::slots::SlotTag;

const DEFAULT_REDIRECT_STATUS: u16 = 302;

/// Redirect requested by the renderer at its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    /// Target location sent back to the client.
    pub location: String,
    /// HTTP status used for the redirect response.
    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

fn default_redirect_status() -> u16 {
    DEFAULT_REDIRECT_STATUS
}

impl Redirect {
    pub fn to(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            status: DEFAULT_REDIRECT_STATUS,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Output of a single page render.
///
/// The coordinator only inspects `html`, `error` and `redirected`; the other
/// fields travel through the cache untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    /// Rendered document body.
    pub html: String,
    /// Error page marker. Results carrying an error are served but never cached.
    #[serde(default)]
    pub error: Option<String>,
    /// Redirect reached during the render. Redirects are never cached.
    #[serde(default)]
    pub redirected: Option<Redirect>,
    /// Hashes of inline scripts for the Content-Security-Policy header.
    #[serde(default)]
    pub csp_script_src_hashes: Vec<String>,
    /// Assets the page asks the client to preload.
    #[serde(default)]
    pub preload_files: Option<Vec<String>>,
}

impl RenderResult {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            ..Self::default()
        }
    }

    /// Terminal result for a redirected render: empty body, no error.
    pub fn redirect(redirect: Redirect) -> Self {
        Self {
            redirected: Some(redirect),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Returns true when the result may be written to the cache.
    pub fn is_cacheable(&self) -> bool {
        self.error.is_none() && self.redirected.is_none()
    }
}

/// Per-request state handed to the renderer.
///
/// The coordinator stamps the slot tag before the render starts; the renderer
/// passes the context back unchanged when it reaches its checkpoint.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Hostname the request was addressed to.
    pub host: Option<String>,
    /// Client-side-only render (SPA fallback); never cached by the default policy.
    pub client_only: bool,
    slot: Option<SlotTag>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn client_only(mut self, client_only: bool) -> Self {
        self.client_only = client_only;
        self
    }

    /// Slot stamped on this request, if the request is being coordinated.
    pub fn slot(&self) -> Option<SlotTag> {
        self.slot
    }

    pub(crate) fn stamp(&mut self, tag: SlotTag) {
        self.slot = Some(tag);
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("checkpoint reached for unknown slot {index}")]
    UnknownSlot { index: usize },
    #[error("render-phase signal for slot {index} already settled")]
    SignalAlreadySettled { index: usize },
    #[error("render-phase signal for slot {index} dropped before it was settled")]
    PhaseSignalLost { index: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("page not found: {0}")]
    NotFound(String),
    #[error("render failed: {0}")]
    Failed(String),
    #[error("render task panicked: {0}")]
    Panicked(String),
    #[error("render stopped at checkpoint: {0}")]
    Stopped(StopReason),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl RenderError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// External page renderer.
///
/// Implementations must call `hook` exactly once at their mid-render
/// checkpoint, passing the request context they were given, and must not
/// continue past the checkpoint unless the hook answers
/// [`CheckpointDecision::Continue`](super::CheckpointDecision::Continue).
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    async fn render_route(
        &self,
        route: String,
        context: RequestContext,
        hook: Arc<dyn CheckpointHook>,
    ) -> Result<RenderResult, RenderError>;
}
