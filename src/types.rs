use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ToolCallId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl ToolCallId {
    pub fn new() -> Self {
        Self(format!("call_{}", Uuid::new_v4().simple()))
    }
}

impl Default for ToolCallId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ToolCallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

pub struct UpstreamHealth {
    pub consecutive_failures: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub last_success: std::sync::RwLock<Option<Instant>>,
    pub last_failure: std::sync::RwLock<Option<Instant>>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_success: std::sync::RwLock::new(None),
            last_failure: std::sync::RwLock::new(None),
        }
    }
}

impl UpstreamHealth {
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_failure.write() {
            *last = Some(Instant::now());
        }
    }

    /// Counter snapshot for the info endpoint. Instants are reported as seconds ago.
    pub fn snapshot(&self) -> Value {
        let ago = |slot: &std::sync::RwLock<Option<Instant>>| -> Value {
            match slot.read().ok().and_then(|v| *v) {
                Some(at) => Value::from(at.elapsed().as_secs()),
                None => Value::Null,
            }
        };
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "failed_requests": self.failed_requests.load(Ordering::Relaxed),
            "consecutive_failures": self.consecutive_failures.load(Ordering::Relaxed),
            "last_success_secs_ago": ago(&self.last_success),
            "last_failure_secs_ago": ago(&self.last_failure),
        })
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(StatusCode, String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Network(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Network(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(s, _) => *s,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Serialization(_) | ProxyError::Io(_) | ProxyError::Frame(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Network(e) if e.is_timeout() => "BACKEND_TIMEOUT",
            ProxyError::Network(_) => "BACKEND_UNREACHABLE",
            ProxyError::Timeout(_) => "BACKEND_TIMEOUT",
            ProxyError::Upstream(..) => "UPSTREAM_ERROR",
            ProxyError::InvalidRequest(_) => "INVALID_REQUEST",
            ProxyError::Serialization(_) => "SERIALIZATION_ERROR",
            ProxyError::Io(_) => "IO_ERROR",
            ProxyError::Frame(_) => "FRAME_ERROR",
        }
    }

    /// Payload of the single terminal event written to a client stream that
    /// cannot be completed.
    pub fn to_stream_error_json(&self) -> Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "proxy_error",
                "code": self.code(),
            }
        })
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ProxyError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ProxyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let status = self.inner.status();
        let msg = match &self.inner {
            ProxyError::Upstream(_, body) => body.clone(),
            other => other.to_string(),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": self.inner.code(),
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

// --- WIRE MODEL (chat.completion.chunk) ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Same channel under the key some backends use instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChunkDelta {
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.as_deref().map_or(true, str::is_empty)
            && self.reasoning_content.as_deref().map_or(true, str::is_empty)
            && self.reasoning.as_deref().map_or(true, str::is_empty)
            && self.tool_calls.as_ref().map_or(true, Vec::is_empty)
            && self.extra.values().all(Value::is_null)
    }

    /// Reasoning text under whichever key the backend used.
    pub fn reasoning_text(&self) -> Option<&str> {
        self.reasoning_content
            .as_deref()
            .or(self.reasoning.as_deref())
    }

    pub fn reasoning_key(&self) -> Option<ReasoningKey> {
        match (&self.reasoning_content, &self.reasoning) {
            (Some(_), Some(_)) => Some(ReasoningKey::Both),
            (Some(_), None) => Some(ReasoningKey::ReasoningContent),
            (None, Some(_)) => Some(ReasoningKey::Reasoning),
            (None, None) => None,
        }
    }

    pub fn set_reasoning(&mut self, text: Option<String>, key: ReasoningKey) {
        match key {
            ReasoningKey::ReasoningContent => self.reasoning_content = text,
            ReasoningKey::Reasoning => self.reasoning = text,
            ReasoningKey::Both => {
                self.reasoning_content = text.clone();
                self.reasoning = text;
            }
        }
    }
}

/// Which delta key(s) carry reasoning text in a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReasoningKey {
    #[default]
    ReasoningContent,
    Reasoning,
    Both,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl From<String> for FinishReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Other(s),
        }
    }
}

impl From<FinishReason> for String {
    fn from(r: FinishReason) -> Self {
        match r {
            FinishReason::Stop => "stop".into(),
            FinishReason::Length => "length".into(),
            FinishReason::ToolCalls => "tool_calls".into(),
            FinishReason::ContentFilter => "content_filter".into(),
            FinishReason::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One decoded stream event. Keeps the JSON text it was decoded from so an
/// event that nobody touched is written back exactly as it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent {
    chunk: ChatChunk,
    raw: Option<String>,
}

impl DeltaEvent {
    pub fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        let chunk = serde_json::from_str(text)?;
        Ok(Self {
            chunk,
            raw: Some(text.to_string()),
        })
    }

    pub fn from_chunk(chunk: ChatChunk) -> Self {
        Self { chunk, raw: None }
    }

    pub fn chunk(&self) -> &ChatChunk {
        &self.chunk
    }

    /// Mutable access drops the retained text; the event is re-serialized on encode.
    pub fn chunk_mut(&mut self) -> &mut ChatChunk {
        self.raw = None;
        &mut self.chunk
    }

    pub fn into_chunk(self) -> ChatChunk {
        self.chunk
    }

    pub fn is_modified(&self) -> bool {
        self.raw.is_none()
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => serde_json::to_string(&self.chunk),
        }
    }

    pub fn first_choice(&self) -> Option<&ChunkChoice> {
        self.chunk.choices.first()
    }

    pub fn content(&self) -> Option<&str> {
        self.first_choice().and_then(|c| c.delta.content.as_deref())
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.first_choice()
            .and_then(|c| c.delta.reasoning_text())
    }

    pub fn tool_calls(&self) -> &[ToolCallDelta] {
        match self.first_choice().and_then(|c| c.delta.tool_calls.as_ref()) {
            Some(calls) => calls,
            None => &[],
        }
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.first_choice().and_then(|c| c.finish_reason.as_ref())
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.chunk.usage.as_ref()
    }
}

/// A tool call rebuilt from text that leaked into a free-text channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub index: u32,
    pub id: ToolCallId,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRecord {
    pub fn to_delta(&self) -> ToolCallDelta {
        ToolCallDelta {
            index: self.index,
            id: Some(self.id.0.clone()),
            kind: Some("function".to_string()),
            function: Some(FunctionDelta {
                name: Some(self.name.clone()),
                arguments: Some(self.arguments.clone()),
                extra: Map::new(),
            }),
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_survive_reencode() {
        let text = r#"{"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"hi","weird":1},"finish_reason":null,"logprobs":null}],"vendor":{"x":true}}"#;
        let mut event = match DeltaEvent::parse(text) {
            Ok(e) => e,
            Err(e) => panic!("parse failed: {}", e),
        };
        assert!(!event.is_modified());
        assert_eq!(event.to_json().unwrap(), text);

        event.chunk_mut().choices[0].delta.content = Some("hey".into());
        assert!(event.is_modified());
        let reencoded: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(reencoded["vendor"]["x"], true);
        assert_eq!(reencoded["choices"][0]["delta"]["weird"], 1);
        assert_eq!(reencoded["choices"][0]["delta"]["content"], "hey");
    }

    #[test]
    fn test_finish_reason_keeps_unknown_values() {
        let r: FinishReason = serde_json::from_str("\"eos_token\"").unwrap();
        assert_eq!(r, FinishReason::Other("eos_token".into()));
        assert_eq!(serde_json::to_string(&FinishReason::ToolCalls).unwrap(), "\"tool_calls\"");
    }

    #[test]
    fn test_error_status_mapping() {
        let timeout = ProxyError::Timeout(Duration::from_secs(3));
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.to_stream_error_json()["error"]["code"], "BACKEND_TIMEOUT");
        let bad = ProxyError::InvalidRequest("nope".into());
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_tool_call_ids_are_unique() {
        let a = ToolCallId::new();
        let b = ToolCallId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("call_"));
    }
}
