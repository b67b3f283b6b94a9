use crate::constants::{EXCLUDED_RESPONSE_HEADERS, HOP_BY_HOP_REQUEST_HEADERS};
use crate::streaming::{StreamContext, StreamHandler};
use crate::types::*;
use crate::AppState;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// Copies client headers for the backend request, minus hop-by-hop headers.
///
/// `accept-encoding` is dropped too: bodies are relayed as received and the
/// client must never get bytes whose encoding header was stripped.
pub fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP_REQUEST_HEADERS.contains(&lower) || lower == "accept-encoding" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if EXCLUDED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn is_streaming(payload: &Value) -> bool {
    payload.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

fn buffered_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = sanitize_response_headers(headers);
    response
}

/// Sends the request and waits for response headers, bounded by `limit`.
async fn send_with_deadline(
    state: &AppState,
    request: reqwest::RequestBuilder,
    limit: Duration,
) -> Result<reqwest::Response> {
    match tokio::time::timeout(limit, request.send()).await {
        Err(_) => {
            state.health.record_failure();
            Err(ProxyError::Timeout(limit).into())
        }
        Ok(Err(e)) => {
            state.health.record_failure();
            Err(ProxyError::Network(e).into())
        }
        Ok(Ok(response)) => {
            state.health.record_success();
            Ok(response)
        }
    }
}

/// Forwards a chat-completion request. Streaming requests get an event
/// stream that is relayed (and repaired, when enabled) as it arrives.
pub async fn forward_chat(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    payload: &Value,
    request_id: &RequestId,
) -> Result<Response> {
    let url = state.args.chat_url();
    let limit = state.args.forward_timeout();
    let request = state
        .client
        .post(&url)
        .headers(sanitize_request_headers(headers))
        .json(payload);

    if !is_streaming(payload) {
        return forward_buffered(state, request, limit, request_id).await;
    }

    tracing::info!("[⚙️  -> ☁️ ] Streaming chat request to {}", url);
    let response = send_with_deadline(state, request, limit).await?;
    let status = response.status();
    tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);

    if !status.is_success() {
        let backend_headers = response.headers().clone();
        let body = response.bytes().await.unwrap_or_else(|e| {
            tracing::warn!("Failed to read error body: {}", e);
            Bytes::new()
        });
        tracing::error!(
            "[☁️  -> ⚙️ ] Upstream Error: {}",
            String::from_utf8_lossy(&body)
        );
        state.sink.log_response_body(request_id, status, &body);
        return Ok(buffered_response(status, &backend_headers, body));
    }

    let mut downstream_headers = sanitize_response_headers(response.headers());
    downstream_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    downstream_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let chunks = Box::pin(response.bytes_stream().map(|r| r.map_err(ProxyError::from)));
    let (tx, rx) = mpsc::channel(state.args.stream_queue_depth.max(1));
    let ctx = StreamContext {
        request_id: request_id.clone(),
        sink: state.sink.clone(),
        idle_timeout: limit,
    };
    let span = tracing::info_span!("stream", request_id = %request_id.short());

    match state.repairer() {
        Some(repairer) => {
            tokio::spawn(StreamHandler::relay_repaired(chunks, repairer, tx, ctx).instrument(span));
        }
        None => {
            tokio::spawn(StreamHandler::relay_raw(chunks, tx, ctx).instrument(span));
        }
    }

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.headers_mut() = downstream_headers;
    Ok(response)
}

async fn forward_buffered(
    state: &Arc<AppState>,
    request: reqwest::RequestBuilder,
    limit: Duration,
    request_id: &RequestId,
) -> Result<Response> {
    // One deadline covers headers and body.
    let exchange = async {
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok::<_, ProxyError>((status, headers, body))
    };

    let (status, headers, body) = match tokio::time::timeout(limit, exchange).await {
        Err(_) => {
            state.health.record_failure();
            return Err(ProxyError::Timeout(limit).into());
        }
        Ok(Err(e)) => {
            state.health.record_failure();
            return Err(e.into());
        }
        Ok(Ok(parts)) => parts,
    };
    state.health.record_success();
    tracing::info!("[☁️  -> ⚙️ ] Status: {} ({} bytes)", status, body.len());

    state.sink.log_response_body(request_id, status, &body);
    Ok(buffered_response(status, &headers, body))
}

/// Relays any other API request unchanged, streaming the response body.
pub async fn forward_passthrough(
    state: &Arc<AppState>,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    tracing::info!("[⚙️  -> ☁️ ] {} {}", method, url);
    let request = state
        .client
        .request(method, url)
        .headers(sanitize_request_headers(headers))
        .body(body);

    let response = send_with_deadline(state, request, state.args.forward_timeout()).await?;
    let status = response.status();
    let downstream_headers = sanitize_response_headers(response.headers());
    tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);

    let mut out = Response::new(Body::from_stream(response.bytes_stream()));
    *out.status_mut() = status;
    *out.headers_mut() = downstream_headers;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_drop_hop_by_hop_and_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("proxy:8000"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        headers.insert("authorization", HeaderValue::from_static("Bearer k"));
        let out = sanitize_request_headers(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out["authorization"], "Bearer k");
    }

    #[test]
    fn test_response_headers_drop_length_and_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("3"));
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let out = sanitize_response_headers(&headers);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("content-type"));
    }

    #[test]
    fn test_stream_flag() {
        assert!(is_streaming(&serde_json::json!({"stream": true})));
        assert!(!is_streaming(&serde_json::json!({"stream": "yes"})));
        assert!(!is_streaming(&serde_json::json!({})));
    }
}
