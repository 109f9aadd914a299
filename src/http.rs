use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::Engine;

pub const DEFAULT_RELAY_ORIGIN: &str = "https://api.openai.com";

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// Correlation ids only need to be unique for the lifetime of an in-flight
/// batch; a process-wide counter gives that without collision risk.
fn next_request_id() -> String {
    format!("req_{}", REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed))
}

#[derive(Clone)]
pub struct ProxyState {
    engine: Arc<Engine>,
    relay_http: reqwest::Client,
    relay_origin: String,
}

impl ProxyState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            relay_http: reqwest::Client::new(),
            relay_origin: DEFAULT_RELAY_ORIGIN.to_string(),
        }
    }

    /// Origin the transparent relay forwards unmatched routes to.
    pub fn with_relay_origin(mut self, origin: impl Into<String>) -> Self {
        self.relay_origin = origin.into().trim_end_matches('/').to_string();
        self
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handle_batched))
        .route("/v1/embeddings", post(handle_batched))
        .route("/stats", get(handle_stats))
        .fallback(relay_upstream)
        .with_state(state)
}

/// The batched route: enroll the request into the engine and block until
/// the demultiplexer or the error synthesizer delivers. Whatever arrives is
/// written as a 200 JSON response, even when the body itself is an error
/// document.
async fn handle_batched(
    State(state): State<ProxyState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let stats = state.engine.stats().clone();
    stats.track_request_start();
    let started = Instant::now();

    let Ok(body) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "Failed to parse request body").into_response();
    };

    if state.engine.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let credential = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let endpoint = uri.path().to_string();
    let request_id = next_request_id();
    debug!(request_id = %request_id, endpoint = %endpoint, "new request received");

    let receiver = state
        .engine
        .clone()
        .enroll(request_id.clone(), credential, endpoint, body)
        .await;

    let delivered = receiver.await;
    state.engine.unregister(&request_id);

    match delivered {
        Ok(value) => {
            debug!(request_id = %request_id, "received response from batch");
            stats.track_request_end(true, started.elapsed());
            Json(value).into_response()
        }
        Err(_) => {
            // Every delivery path sends before dropping the sender; this is
            // the engine failing its own contract.
            warn!(request_id = %request_id, "delivery channel closed without a response");
            stats.track_request_end(false, started.elapsed());
            (StatusCode::INTERNAL_SERVER_ERROR, "No response produced").into_response()
        }
    }
}

async fn handle_stats(State(state): State<ProxyState>) -> Response {
    Json(state.engine.stats().snapshot()).into_response()
}

/// Any route the proxy does not batch is forwarded verbatim to the upstream
/// origin and the upstream response is streamed back.
async fn relay_upstream(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    info!(path = %path_and_query, "forwarding request to upstream");

    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to read relay request body: {err}");
            return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
        }
    };

    let url = format!("{}{}", state.relay_origin, path_and_query);
    let mut outgoing_headers = parts.headers.clone();
    outgoing_headers.remove(HOST);
    // The inbound body was buffered, so any chunked framing is gone.
    outgoing_headers.remove(TRANSFER_ENCODING);

    let upstream_response = match state
        .relay_http
        .request(parts.method, url)
        .headers(outgoing_headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!("error forwarding request to upstream: {err}");
            return (
                StatusCode::BAD_GATEWAY,
                "Error forwarding request to upstream",
            )
                .into_response();
        }
    };

    let status = upstream_response.status();
    let mut headers = upstream_response.headers().clone();
    // The body is re-framed while streaming it back.
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);

    debug!(path = %path_and_query, status = status.as_u16(), "forwarded request to upstream");
    (
        status,
        headers,
        Body::from_stream(upstream_response.bytes_stream()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(first.starts_with("req_"));
        assert!(second.starts_with("req_"));
        assert_ne!(first, second);
        let n: u64 = first.trim_start_matches("req_").parse().unwrap();
        let m: u64 = second.trim_start_matches("req_").parse().unwrap();
        assert!(m > n);
    }
}
