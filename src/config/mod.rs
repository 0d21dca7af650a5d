//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::RoutePattern;
use crate::render::Redirect;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "render-cache";
const ENV_PREFIX: &str = "RENDER_CACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORE_CAPACITY: usize = 1000;
const DEFAULT_RENDER_ROOT: &str = "pages";
const DEFAULT_REDIRECT_STATUS: u16 = 302;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Cacheable routes; `pages` prefixes first, then `patterns` expressions.
    /// Empty disables caching.
    pub patterns: Vec<RoutePattern>,
    pub use_host_prefix: bool,
    pub version: Option<String>,
    pub entry_ttl: Option<Duration>,
    pub store: StoreSettings,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory { capacity: NonZeroUsize },
    Tiered { tiers: Vec<NonZeroUsize> },
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub root: PathBuf,
    pub redirects: Vec<RedirectRule>,
    pub timeout: Option<Duration>,
}

/// Route answered with a redirect instead of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    pub from: String,
    pub redirect: Redirect,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    version: Option<String>,
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(version) = overrides.app_version.as_ref() {
            self.version = Some(version.clone());
        }
        if let Some(root) = overrides.render_root.as_ref() {
            self.render.root = Some(root.clone());
        }
        if let Some(timeout) = overrides.render_timeout_ms {
            self.render.timeout_ms = Some(timeout);
        }
        if let Some(capacity) = overrides.cache_capacity {
            self.cache.store.capacity = Some(capacity);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            version,
            server,
            logging,
            cache,
            render,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache, version)?;
        let render = build_render_settings(render)?;

        Ok(Self {
            server,
            logging,
            cache,
            render,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(
    cache: RawCacheSettings,
    app_version: Option<String>,
) -> Result<CacheSettings, LoadError> {
    let mut patterns = Vec::new();
    for page in cache.pages.unwrap_or_default() {
        if page.is_empty() {
            return Err(LoadError::invalid(
                "cache.pages",
                "page prefixes must not be empty",
            ));
        }
        patterns.push(RoutePattern::prefix(page));
    }
    for expression in cache.patterns.unwrap_or_default() {
        let pattern = RoutePattern::regex(&expression).map_err(|err| {
            LoadError::invalid("cache.patterns", format!("`{expression}`: {err}"))
        })?;
        patterns.push(pattern);
    }

    // The top-level application version wins over the cache-specific one.
    let version = app_version
        .or(cache.version)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let entry_ttl = match cache.entry_ttl_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.entry_ttl_seconds",
                "must be greater than zero when set",
            ));
        }
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => None,
    };

    Ok(CacheSettings {
        patterns,
        use_host_prefix: cache.use_host_prefix.unwrap_or(false),
        version,
        entry_ttl,
        store: build_store_settings(cache.store)?,
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend = store.backend.as_deref().map(str::trim).unwrap_or("memory");
    let backend = match backend.to_ascii_lowercase().as_str() {
        "memory" => {
            let capacity = store.capacity.unwrap_or(DEFAULT_STORE_CAPACITY);
            StoreBackend::Memory {
                capacity: non_zero_usize(capacity, "cache.store.capacity")?,
            }
        }
        "tiered" => {
            let tiers = store.tiers.unwrap_or_default();
            if tiers.is_empty() {
                return Err(LoadError::invalid(
                    "cache.store.tiers",
                    "tiered backend needs at least one tier",
                ));
            }
            let tiers = tiers
                .into_iter()
                .map(|capacity| non_zero_usize(capacity, "cache.store.tiers"))
                .collect::<Result<Vec<_>, _>>()?;
            StoreBackend::Tiered { tiers }
        }
        other => {
            return Err(LoadError::invalid(
                "cache.store.backend",
                format!("unknown backend `{other}` (expected memory or tiered)"),
            ));
        }
    };

    Ok(StoreSettings { backend })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let root = render
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDER_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("render.root", "path must not be empty"));
    }

    let redirects = render
        .redirects
        .into_iter()
        .map(build_redirect_rule)
        .collect::<Result<Vec<_>, _>>()?;

    let timeout = match render.timeout_ms {
        Some(0) => {
            return Err(LoadError::invalid(
                "render.timeout_ms",
                "must be greater than zero when set",
            ));
        }
        Some(millis) => Some(Duration::from_millis(millis)),
        None => None,
    };

    Ok(RenderSettings {
        root,
        redirects,
        timeout,
    })
}

fn build_redirect_rule(rule: RawRedirectRule) -> Result<RedirectRule, LoadError> {
    let from = rule.from.unwrap_or_default();
    if !from.starts_with('/') {
        return Err(LoadError::invalid(
            "render.redirects.from",
            format!("route `{from}` must start with `/`"),
        ));
    }

    let to = rule.to.unwrap_or_default();
    if to.trim().is_empty() {
        return Err(LoadError::invalid(
            "render.redirects.to",
            format!("redirect for `{from}` has no target"),
        ));
    }

    let status = rule.status.unwrap_or(DEFAULT_REDIRECT_STATUS);
    if !(300..=399).contains(&status) {
        return Err(LoadError::invalid(
            "render.redirects.status",
            format!("{status} is not a redirect status"),
        ));
    }

    Ok(RedirectRule {
        from,
        redirect: Redirect::to(to).with_status(status),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    pages: Option<Vec<String>>,
    patterns: Option<Vec<String>>,
    use_host_prefix: Option<bool>,
    version: Option<String>,
    entry_ttl_seconds: Option<u64>,
    store: RawStoreSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    capacity: Option<usize>,
    tiers: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    root: Option<PathBuf>,
    redirects: Vec<RawRedirectRule>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedirectRule {
    from: Option<String>,
    to: Option<String>,
    status: Option<u16>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
