//! HTTP surface: every unmatched GET goes through the render coordinator.

use std::{error::Error as StdError, sync::Arc, time::Duration, time::Instant};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderValue, Method, Request, StatusCode, Uri,
        header::{CONTENT_SECURITY_POLICY, CONTENT_TYPE, HOST, LOCATION},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{error, warn};

use crate::render::{RenderCoordinator, RenderError, RenderResult, RequestContext};

/// Header marking a client-side-only render.
pub const CLIENT_ONLY_HEADER: &str = "x-client-only";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Clone)]
pub struct HttpState {
    pub coordinator: Arc<RenderCoordinator>,
    pub render_timeout: Option<Duration>,
}

impl HttpState {
    pub fn new(coordinator: Arc<RenderCoordinator>) -> Self {
        Self {
            coordinator,
            render_timeout: None,
        }
    }

    pub fn with_render_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.render_timeout = timeout;
        self
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/_health", get(health))
        .fallback(render_handler)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Diagnostic attached to failed responses and picked up by [`log_responses`].
#[derive(Debug, Clone)]
struct ErrorReport {
    source: &'static str,
    messages: Vec<String>,
}

impl ErrorReport {
    fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }

    fn from_message(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            source,
            messages: vec![message.into()],
        }
    }

    fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

pub async fn render_handler(
    State(state): State<HttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let route = uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or_else(|| uri.path())
        .to_string();
    let context = request_context(&headers, uri.query());

    let render = state.coordinator.handle(&route, context);
    let outcome = match state.render_timeout {
        Some(limit) => match tokio::time::timeout(limit, render).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let mut response =
                    (StatusCode::GATEWAY_TIMEOUT, "render timed out").into_response();
                ErrorReport::from_message(
                    "infra::http::render_handler",
                    format!("render exceeded {}ms", limit.as_millis()),
                )
                .attach(&mut response);
                return response;
            }
        },
        None => render.await,
    };

    match outcome {
        Ok(result) => result_response(result),
        Err(err) => error_response(&err),
    }
}

fn request_context(headers: &HeaderMap, query: Option<&str>) -> RequestContext {
    let mut context = RequestContext::new().client_only(is_client_only(headers, query));
    if let Some(host) = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(hostname)
        .filter(|host| !host.is_empty())
    {
        context = context.with_host(host);
    }
    context
}

fn is_client_only(headers: &HeaderMap, query: Option<&str>) -> bool {
    let header = headers
        .get(CLIENT_ONLY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(is_truthy);
    let flag = query.is_some_and(|query| {
        query.split('&').any(|pair| match pair.split_once('=') {
            Some((name, value)) => name == "spa" && is_truthy(value),
            None => pair == "spa",
        })
    });
    header || flag
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Host header without its port.
fn hostname(host: &str) -> &str {
    let host = host.trim();
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn result_response(result: RenderResult) -> Response {
    if let Some(redirect) = result.redirected {
        let status = StatusCode::from_u16(redirect.status)
            .ok()
            .filter(StatusCode::is_redirection)
            .unwrap_or(StatusCode::FOUND);
        return match HeaderValue::from_str(&redirect.location) {
            Ok(location) => (status, [(LOCATION, location)]).into_response(),
            Err(err) => {
                let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
                ErrorReport::from_error("infra::http::redirect", &err).attach(&mut response);
                response
            }
        };
    }

    let status = if result.error.is_some() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    let mut response = (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE))],
        result.html,
    )
        .into_response();

    if !result.csp_script_src_hashes.is_empty() {
        let sources = result
            .csp_script_src_hashes
            .iter()
            .map(|hash| format!("'{hash}'"))
            .collect::<Vec<_>>()
            .join(" ");
        if let Ok(value) = HeaderValue::from_str(&format!("script-src 'self' {sources}")) {
            response.headers_mut().insert(CONTENT_SECURITY_POLICY, value);
        }
    }
    if let Some(error) = result.error {
        ErrorReport::from_message("infra::http::render", error).attach(&mut response);
    }
    response
}

fn error_response(err: &RenderError) -> Response {
    let (status, body) = match err {
        RenderError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
    };
    let mut response = (status, body).into_response();
    ErrorReport::from_error("infra::http::render_handler", err).attach(&mut response);
    response
}

async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target: "render_cache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                "request failed",
            );
        } else {
            warn!(
                target: "render_cache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                "client request error",
            );
        }
    }

    response
}
