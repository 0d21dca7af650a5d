//! Cache key policy.
//!
//! Decides per request whether a rendered page may be cached and under which
//! key. A policy returning `None` sends the request straight to the renderer.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::render::RequestContext;

/// Maps a route request to its cache key, or `None` when it must not be cached.
pub trait KeyPolicy: Send + Sync {
    fn cache_key(&self, route: &str, context: &RequestContext) -> Option<String>;
}

/// Any `Fn(&str, &RequestContext) -> Option<String>` acts as a custom key builder.
impl<F> KeyPolicy for F
where
    F: Fn(&str, &RequestContext) -> Option<String> + Send + Sync,
{
    fn cache_key(&self, route: &str, context: &RequestContext) -> Option<String> {
        self(route, context)
    }
}

/// Route matcher used by [`RouteKeyPolicy`].
#[derive(Debug, Clone)]
pub enum RoutePattern {
    /// Matches routes starting with the given string.
    Prefix(String),
    /// Matches routes the expression finds a match in.
    Regex(Regex),
}

impl RoutePattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Regex)
    }

    pub fn matches(&self, route: &str) -> bool {
        match self {
            Self::Prefix(prefix) => route.starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(route),
        }
    }
}

impl PartialEq for RoutePattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Prefix(a), Self::Prefix(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

type CacheablePredicate = Arc<dyn Fn(&str, &RequestContext) -> bool + Send + Sync>;

/// Default key policy: route patterns plus an optional host namespace.
///
/// A request is cached when it carries a host, is not a client-only render
/// and its route matches at least one pattern. With no patterns configured
/// nothing is cached.
#[derive(Clone, Default)]
pub struct RouteKeyPolicy {
    patterns: Vec<RoutePattern>,
    use_host_prefix: bool,
    predicate: Option<CacheablePredicate>,
}

impl RouteKeyPolicy {
    pub fn new(patterns: Vec<RoutePattern>) -> Self {
        Self {
            patterns,
            ..Self::default()
        }
    }

    /// Namespace keys by request host (`example.com/about`).
    pub fn with_host_prefix(mut self, use_host_prefix: bool) -> Self {
        self.use_host_prefix = use_host_prefix;
        self
    }

    /// Replace the client-only and pattern checks with a custom predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &RequestContext) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[RoutePattern] {
        &self.patterns
    }

    pub fn is_cacheable(&self, route: &str, context: &RequestContext) -> bool {
        if let Some(predicate) = &self.predicate {
            return predicate(route, context);
        }
        !context.client_only && self.patterns.iter().any(|pattern| pattern.matches(route))
    }
}

impl KeyPolicy for RouteKeyPolicy {
    fn cache_key(&self, route: &str, context: &RequestContext) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        let host = context.host.as_deref().filter(|host| !host.is_empty())?;
        if !self.is_cacheable(route, context) {
            return None;
        }

        Some(if self.use_host_prefix {
            join_host(host, route)
        } else {
            route.to_string()
        })
    }
}

impl fmt::Debug for RouteKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteKeyPolicy")
            .field("patterns", &self.patterns)
            .field("use_host_prefix", &self.use_host_prefix)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

fn join_host(host: &str, route: &str) -> String {
    format!(
        "{}/{}",
        host.trim_end_matches('/'),
        route.trim_start_matches('/')
    )
}
