//! HTTP request router
//!
//! Maps each request to a [`Route`] from the shared registry:
//!
//! - **Permission check**: requests the permission backend rejects get `403`
//! - **Script routes**: the handler registered with `server.handle` runs in a
//!   pooled context on a blocking thread
//! - **Static routes**: files are read from disk with a guessed content type
//!
//! Request paths are normalized once up front, so the permission check and
//! route lookup see the same path. Paths with `..` segments or no route get
//! `404`.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use kestrel_common::KestrelError;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::routing::{content_type_for, normalize_request_path, resolve_static, Route};
use crate::runtime::Capabilities;

/// Body type of every response the server produces.
pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// Largest request body handed to a script handler.
pub const MAX_BODY_BYTES: usize = 8 << 20;

/// Anything that can answer requests on a listener.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Pin<Box<dyn Future<Output = Response<ResponseBody>> + Send>>;
}

/// Counters shared with the profiler.
#[derive(Debug, Default)]
pub struct ServeStats {
    requests: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub errors: u64,
}

impl ServeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// The parts of a request the router looks at.
#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl RequestInfo {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: String::new(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }
}

pub struct RequestRouter {
    caps: Capabilities,
    stats: Arc<ServeStats>,
}

impl RequestRouter {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            stats: Arc::new(ServeStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ServeStats> {
        self.stats.clone()
    }

    /// Produces the response for one request.
    pub async fn respond(&self, mut info: RequestInfo) -> Response<ResponseBody> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        match normalize_request_path(&info.path) {
            Some(path) => info.path = path,
            None => {
                tracing::debug!(path = %info.path, "Rejected path with parent segments");
                return text_response(StatusCode::NOT_FOUND, "Not Found\n");
            }
        }

        if let Some(permissions) = &self.caps.permissions {
            if permissions.rejected(&info.method, &info.path) {
                tracing::debug!(method = %info.method, path = %info.path, "Request rejected by permissions");
                return text_response(StatusCode::FORBIDDEN, "Forbidden\n");
            }
        }

        let Some((pattern, route)) = self.caps.routes.resolve(&info.path) else {
            return text_response(StatusCode::NOT_FOUND, "Not Found\n");
        };

        let response = match route {
            Route::Script { source, pattern } => self.run_script(source, pattern, info).await,
            Route::Static { root, prefix } => match resolve_static(&root, &prefix, &info.path) {
                Some(path) => serve_file(&info.method, &path).await,
                None => text_response(StatusCode::NOT_FOUND, "Not Found\n"),
            },
            Route::File(path) => serve_file(&info.method, &path).await,
        };

        if response.status().is_server_error() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(pattern = %pattern, status = %response.status(), "Request failed");
        }
        response
    }

    async fn run_script(
        &self,
        source: Arc<crate::runtime::ScriptSource>,
        pattern: String,
        info: RequestInfo,
    ) -> Response<ResponseBody> {
        let caps = self.caps.clone();
        let request = match serde_json::to_value(&info) {
            Ok(request) => request,
            Err(e) => return error_response(&KestrelError::from(e)),
        };

        let result = tokio::task::spawn_blocking(move || {
            let mut context = caps.pool.acquire()?;
            context.handle(&source, &pattern, request, &caps)
        })
        .await;

        match result {
            Ok(Ok(value)) => script_response(value),
            Ok(Err(e)) => error_response(&e),
            Err(e) => {
                tracing::error!(target: "kestrel::internal", error = %e, "Script handler task failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
            }
        }
    }
}

impl HttpHandler for RequestRouter {
    fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Pin<Box<dyn Future<Output = Response<ResponseBody>> + Send>> {
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read request body");
                    return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large\n");
                }
            };

            let headers = parts
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();

            let info = RequestInfo {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                query: parts.uri.query().unwrap_or_default().to_string(),
                headers,
                body: String::from_utf8_lossy(&body).into_owned(),
            };
            self.respond(info).await
        })
    }
}

/// Builds a plain text response.
pub fn text_response(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn bytes_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(body.into()).boxed());
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn error_response(e: &KestrelError) -> Response<ResponseBody> {
    if e.is_fatal() {
        tracing::error!(target: "kestrel::internal", error = %e, "Script handler failed");
    } else {
        tracing::warn!(error = %e, "Script handler failed");
    }
    let body = json!({ "error": e.to_string() }).to_string();
    bytes_response(StatusCode::INTERNAL_SERVER_ERROR, "application/json", body)
}

async fn serve_file(method: &str, path: &std::path::Path) -> Response<ResponseBody> {
    if method != Method::GET.as_str() && method != Method::HEAD.as_str() {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
    }
    match tokio::fs::read(path).await {
        Ok(contents) => {
            let body = if method == Method::HEAD.as_str() { Vec::new() } else { contents };
            bytes_response(StatusCode::OK, &content_type_for(path), body)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => text_response(StatusCode::NOT_FOUND, "Not Found\n"),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read file");
            text_response(StatusCode::NOT_FOUND, "Not Found\n")
        }
    }
}

/// Turns a handler's return value into a response.
///
/// A string is sent as HTML. An object with `status`, `headers` or `body` is
/// treated as a response description. Anything else is sent as JSON.
pub fn script_response(value: JsonValue) -> Response<ResponseBody> {
    match value {
        JsonValue::String(html) => bytes_response(StatusCode::OK, "text/html; charset=utf-8", html),
        JsonValue::Null => bytes_response(StatusCode::OK, "text/html; charset=utf-8", Bytes::new()),
        JsonValue::Object(map)
            if map.contains_key("status") || map.contains_key("body") || map.contains_key("headers") =>
        {
            let status = map
                .get("status")
                .and_then(JsonValue::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::OK);

            let (content_type, body) = match map.get("body") {
                Some(JsonValue::String(s)) => ("text/html; charset=utf-8", Bytes::from(s.clone())),
                Some(JsonValue::Null) | None => ("text/html; charset=utf-8", Bytes::new()),
                Some(other) => ("application/json", Bytes::from(other.to_string())),
            };

            let mut response = bytes_response(status, content_type, body);
            if let Some(JsonValue::Object(headers)) = map.get("headers") {
                for (name, value) in headers {
                    let value = match value {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value)) {
                        (Ok(name), Ok(value)) => {
                            response.headers_mut().insert(name, value);
                        }
                        _ => tracing::warn!(header = %name, "Ignoring invalid header from script handler"),
                    }
                }
            }
            response
        }
        other => bytes_response(StatusCode::OK, "application/json", other.to_string()),
    }
}
