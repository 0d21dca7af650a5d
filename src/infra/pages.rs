//! Renderer serving pre-built HTML files from a directory.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::{RedirectRule, RenderSettings};
use crate::render::{
    Checkpoint, CheckpointDecision, CheckpointHook, Redirect, RenderError, RenderResult, Renderer,
    RequestContext,
};

use super::error::InfraError;

/// Maps `/about` to `<root>/about.html` or `<root>/about/index.html`.
///
/// Redirect rules are matched on the exact path before any file lookup.
#[derive(Debug, Clone)]
pub struct PageDirRenderer {
    root: PathBuf,
    redirects: HashMap<String, Redirect>,
}

impl PageDirRenderer {
    pub fn new(root: impl Into<PathBuf>, redirects: impl IntoIterator<Item = RedirectRule>) -> Self {
        Self {
            root: root.into(),
            redirects: redirects
                .into_iter()
                .map(|rule| (rule.from, rule.redirect))
                .collect(),
        }
    }

    /// Build from settings, checking that the page root is a directory.
    pub fn open(settings: &RenderSettings) -> Result<Self, InfraError> {
        let metadata = std::fs::metadata(&settings.root)
            .map_err(|err| InfraError::render_root(&settings.root, err.to_string()))?;
        if !metadata.is_dir() {
            return Err(InfraError::render_root(&settings.root, "not a directory"));
        }
        Ok(Self::new(
            settings.root.clone(),
            settings.redirects.iter().cloned(),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn locate(&self, path: &str) -> Option<PathBuf> {
        let relative = relative_page_path(path)?;
        let mut candidates = Vec::with_capacity(2);
        if relative.as_os_str().is_empty() || path.ends_with('/') {
            candidates.push(self.root.join(&relative).join("index.html"));
        } else {
            candidates.push(self.root.join(&relative).with_extension("html"));
            candidates.push(self.root.join(&relative).join("index.html"));
        }

        for candidate in candidates {
            match tokio::fs::metadata(&candidate).await {
                Ok(metadata) if metadata.is_file() => return Some(candidate),
                _ => {}
            }
        }
        None
    }
}

#[async_trait]
impl Renderer for PageDirRenderer {
    #[instrument(skip(self, route, context, hook), fields(route = %route))]
    async fn render_route(
        &self,
        route: String,
        context: RequestContext,
        hook: Arc<dyn CheckpointHook>,
    ) -> Result<RenderResult, RenderError> {
        let path = strip_query(&route);

        if let Some(redirect) = self.redirects.get(path) {
            let checkpoint = Checkpoint::new(&context).redirected(redirect.clone());
            hook.on_checkpoint(checkpoint).await?;
            return Ok(RenderResult::redirect(redirect.clone()));
        }

        let file = self
            .locate(path)
            .await
            .ok_or_else(|| RenderError::NotFound(path.to_string()))?;

        match hook.on_checkpoint(Checkpoint::new(&context)).await? {
            CheckpointDecision::Continue => {}
            CheckpointDecision::Stop(reason) => {
                debug!(%reason, "render stopped at checkpoint");
                return Err(RenderError::Stopped(reason));
            }
        }

        match tokio::fs::read_to_string(&file).await {
            Ok(html) => Ok(RenderResult::html(html)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(RenderError::NotFound(path.to_string()))
            }
            Err(err) => Err(RenderError::failed(format!(
                "failed to read `{}`: {err}",
                file.display()
            ))),
        }
    }
}

fn strip_query(route: &str) -> &str {
    route
        .split_once(['?', '#'])
        .map_or(route, |(path, _)| path)
}

/// Relative file path for a request path; `None` when it escapes the root.
fn relative_page_path(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.contains('\\') {
        return None;
    }

    let mut relative = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => relative.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}
