use crate::proxy::{forward_chat, forward_passthrough};
use crate::types::*;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    Extension,
};
use serde_json::Value;
use std::sync::Arc;

fn parse_chat_body(body: &[u8]) -> std::result::Result<Value, ProxyError> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("body is not valid JSON: {}", e)))?;
    if !payload.is_object() {
        return Err(ProxyError::InvalidRequest(
            "body must be a JSON object".to_string(),
        ));
    }
    Ok(payload)
}

/// `POST /v1/chat/completions` and its legacy alias.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match parse_chat_body(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("[🖱️  -> ⚙️ ] Rejected request: {}", e);
            return ObservedError::from(e).into_response();
        }
    };

    let model = payload.get("model").and_then(|m| m.as_str()).unwrap_or("-");
    let stream = payload.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    tracing::info!(
        "[🖱️  -> ⚙️ ] Chat request | model: {} | stream: {}",
        model,
        stream
    );
    state.sink.log_request(&request_id, &headers, &payload);

    match forward_chat(&state, &headers, &payload, &request_id).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Forward failed: {}", e.inner);
            state.sink.log_error(
                &request_id,
                &e.inner.to_string(),
                &serde_json::json!({ "phase": "forward", "code": e.inner.code() }),
            );
            e.into_response()
        }
    }
}

/// Any other `/v1/*` request is relayed unchanged.
pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    uri: Uri,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = state.args.passthrough_url(&path, uri.query());
    match forward_passthrough(&state, method, &url, &headers, body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Passthrough failed: {}", e.inner);
            state.sink.log_error(
                &request_id,
                &e.inner.to_string(),
                &serde_json::json!({ "phase": "passthrough", "url": url, "code": e.inner.code() }),
            );
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_body_must_be_object() {
        assert!(parse_chat_body(br#"{"model":"m"}"#).is_ok());
        assert!(matches!(
            parse_chat_body(b"[1,2]"),
            Err(ProxyError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_chat_body(b"not json"),
            Err(ProxyError::InvalidRequest(_))
        ));
    }
}
