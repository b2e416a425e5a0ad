//! HTTP forward proxy: rewrites inbound requests onto the upstream base URL.
//!
//! Every path under the listener is relayed verbatim (method, path, query,
//! body); hop-by-hop headers are stripped in both directions. Idempotent
//! requests that fail at the transport level are retried with backoff;
//! anything with a body is attempted exactly once. When the upstream cannot
//! be reached at all, the proxy synthesizes a JSON 502 rather than letting
//! the connection hang.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use std::sync::Arc;
use tgate_core::{Backoff, BackoffPolicy, GateError, GateResult, Secret};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};
use url::Url;

use crate::tunnel::ChainStatus;

/// Largest request body the proxy will buffer.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Headers that describe one TCP hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Resolved upstream parameters.
#[derive(Debug, Clone)]
pub struct UpstreamSpec {
    pub base_url: Url,
    pub default_timeout: std::time::Duration,
    /// Extra attempts after the first, idempotent methods only.
    pub max_retries: u32,
    pub retry_backoff: BackoffPolicy,
    /// Injected as `x-api-key` on every forwarded request.
    pub api_key: Option<Secret>,
}

pub struct ProxyState {
    client: reqwest::Client,
    upstream: UpstreamSpec,
    chain: Option<watch::Receiver<ChainStatus>>,
    started: std::time::Instant,
}

impl ProxyState {
    pub fn new(
        upstream: UpstreamSpec,
        chain: Option<watch::Receiver<ChainStatus>>,
    ) -> GateResult<Self> {
        // redirects pass through to the caller untouched
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GateError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            upstream,
            chain,
            started: std::time::Instant::now(),
        })
    }

    /// Join the request path and query onto the upstream base URL. A base
    /// path prefix is preserved: base `/api` + request `/v1/x` = `/api/v1/x`.
    fn upstream_url(&self, uri: &Uri) -> Url {
        let mut url = self.upstream.base_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}{}", uri.path()));
        url.set_query(uri.query());
        url
    }

    async fn proxy_request(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let url = self.upstream_url(&uri);
        let out_headers = request_headers(&headers, self.upstream.api_key.as_ref());

        let idempotent = matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);
        let attempts = if idempotent {
            self.upstream.max_retries.saturating_add(1)
        } else {
            1
        };
        let mut backoff = Backoff::new(self.upstream.retry_backoff);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let result = self
                .client
                .request(method.clone(), url.clone())
                .headers(out_headers.clone())
                .body(body.clone())
                .timeout(self.upstream.default_timeout)
                .send()
                .await;
            match result {
                Ok(resp) => {
                    if attempt > 1 {
                        debug!(attempt, path = uri.path(), "upstream recovered after retry");
                    }
                    return relay_response(resp).await;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt,
                        attempts,
                        method = %method,
                        path = uri.path(),
                        "upstream request failed"
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }

        synthesize_bad_gateway(last_err)
    }
}

/// Build the proxy router: `/healthz` plus a catch-all forwarder.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(forward)
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn healthz(State(state): State<Arc<ProxyState>>) -> Response {
    let tunnel = state
        .chain
        .as_ref()
        .map(|rx| rx.borrow().to_string())
        .unwrap_or_else(|| "none".to_string());
    Json(serde_json::json!({
        "status": "ok",
        "tunnel": tunnel,
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
    .into_response()
}

async fn forward(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_LEN).await {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("cannot read request body: {e}"),
                    "kind": "bad_request",
                })),
            )
                .into_response()
        }
    };
    state
        .proxy_request(parts.method, parts.uri, parts.headers, body)
        .await
}

/// Copy forwardable request headers; the HTTP client supplies its own `host`
/// and `content-length` for the rewritten request.
fn request_headers(headers: &HeaderMap, api_key: Option<&Secret>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || lower == "host" || lower == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if let Some(key) = api_key {
        if let Ok(value) = HeaderValue::from_str(key.reveal()) {
            out.insert("x-api-key", value);
        }
    }
    out
}

/// Buffer the upstream response and map it back onto the inbound connection.
async fn relay_response(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let mut headers = HeaderMap::new();
    for (name, value) in resp.headers() {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || lower == "content-length" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match resp.bytes().await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            warn!(error = %e, "upstream body read failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": "upstream closed the connection mid-response",
                    "kind": "upstream_error",
                })),
            )
                .into_response()
        }
    }
}

fn synthesize_bad_gateway(err: Option<reqwest::Error>) -> Response {
    let (kind, message) = match &err {
        Some(e) if e.is_timeout() => ("upstream_timeout", "upstream request timed out".to_string()),
        Some(e) if e.is_connect() => (
            "upstream_unreachable",
            "cannot connect to upstream".to_string(),
        ),
        Some(e) => ("upstream_error", e.to_string()),
        None => ("upstream_error", "upstream request failed".to_string()),
    };
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "error": message, "kind": kind })),
    )
        .into_response()
}
