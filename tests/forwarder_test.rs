use axum::{
    body::{Body, Bytes},
    extract::RawQuery,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toolfix::aggregator::AggregatedMessage;
use toolfix::logging::ExchangeSink;
use toolfix::sse::{Frame, FrameDecoder};
use toolfix::{build_router, AppState, Args, RequestId};
use tower::util::ServiceExt;

const LEAK: &str =
    "Hello <tool_call>{\"name\":\"lookup\",\"arguments\":\"{\\\"id\\\":1}\"}</tool_call> done";

const NON_STREAMING_BODY: &str = r#"{"id":"cmpl-1",  "object":"chat.completion","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}]}"#;

#[derive(Default)]
struct RecordingSink {
    requests: Mutex<Vec<Value>>,
    aggregated: Mutex<Vec<AggregatedMessage>>,
    errors: Mutex<Vec<String>>,
}

impl ExchangeSink for RecordingSink {
    fn log_request(&self, _: &RequestId, _: &HeaderMap, body: &Value) {
        self.requests.lock().unwrap().push(body.clone());
    }
    fn log_server_chunk(&self, _: &RequestId, _: &[u8]) {}
    fn log_stream_chunk(&self, _: &RequestId, _: &[u8]) {}
    fn log_response_body(&self, _: &RequestId, _: StatusCode, _: &[u8]) {}
    fn log_aggregated(&self, _: &RequestId, message: &AggregatedMessage) {
        self.aggregated.lock().unwrap().push(message.clone());
    }
    fn log_error(&self, _: &RequestId, message: &str, _: &Value) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

fn sse(delta: Value, finish: Option<&str>) -> String {
    let chunk = json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "mock",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
    });
    format!("data: {}\n\n", chunk)
}

fn leak_wire() -> Vec<String> {
    vec![
        sse(json!({"role": "assistant", "content": "Hello "}), None),
        sse(json!({"content": "<tool_call>{\"name\":\"lookup\","}), None),
        sse(json!({"content": "\"arguments\":\"{\\\"id\\\":1}\"}"}), None),
        sse(json!({"content": "</tool_call>"}), None),
        sse(json!({"content": " done"}), None),
        sse(json!({}), Some("stop")),
        "data: [DONE]\n\n".to_string(),
    ]
}

async fn mock_chat(Json(body): Json<Value>) -> Response {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let streaming = body["stream"].as_bool().unwrap_or(false);
    match model.as_str() {
        "slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            NON_STREAMING_BODY.into_response()
        }
        "limited" => (
            StatusCode::TOO_MANY_REQUESTS,
            [("content-type", "application/json")],
            r#"{"error":"rate limited"}"#,
        )
            .into_response(),
        "stall" => {
            let head = stream::iter(vec![Ok::<_, Infallible>(Bytes::from(sse(json!({"content": "partial"}), None)))]);
            let tail = stream::once(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Infallible>(Bytes::from("data: [DONE]\n\n"))
            });
            Response::new(Body::from_stream(head.chain(tail)))
        }
        _ if streaming => {
            let parts: Vec<Result<Bytes, Infallible>> =
                leak_wire().into_iter().map(|s| Ok(Bytes::from(s))).collect();
            (
                [("content-type", "text/event-stream")],
                Body::from_stream(stream::iter(parts)),
            )
                .into_response()
        }
        _ => (
            [("content-type", "application/json")],
            NON_STREAMING_BODY,
        )
            .into_response(),
    }
}

async fn mock_models(headers: HeaderMap, RawQuery(query): RawQuery) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{"id": "mock"}],
        "query": query,
        "authorization": headers.get("authorization").and_then(|v| v.to_str().ok()),
        "host_forwarded": headers.get("host").and_then(|v| v.to_str().ok()),
    }))
}

async fn spawn_backend() -> String {
    let app = Router::new()
        .route("/v1/chat/completions", post(mock_chat))
        .route("/v1/models", get(mock_models));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

fn proxy(backend: &str, repair: bool, sink: Arc<RecordingSink>) -> Router {
    let args = Args::parse_from([
        "toolfix",
        "--backend-url",
        backend,
        "--enable-file-logging",
        "false",
        "--enable-streaming-tool-parser",
        if repair { "true" } else { "false" },
        "--forward-timeout-secs",
        "1",
        "--connect-timeout-secs",
        "1",
    ]);
    build_router(Arc::new(AppState::new(args, sink).unwrap()))
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer test-key")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

fn events(wire: &[u8]) -> Vec<Frame> {
    let mut decoder = FrameDecoder::new();
    let mut frames = decoder.push(wire).unwrap();
    frames.extend(decoder.finish().unwrap());
    frames
}

#[tokio::test]
async fn test_streaming_leak_is_repaired() {
    let backend = spawn_backend().await;
    let sink = Arc::new(RecordingSink::default());
    let app = proxy(&backend, true, sink.clone());

    let response = app
        .oneshot(chat_request(json!({"model": "mock", "stream": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert!(response.headers().contains_key("x-request-id"));

    let frames = events(&body_bytes(response).await);
    assert_eq!(frames.last(), Some(&Frame::Done));

    let mut text = String::new();
    let mut calls = Vec::new();
    let mut finish = None;
    for frame in &frames {
        if let Frame::Event(e) = frame {
            text.push_str(e.content().unwrap_or_default());
            calls.extend(e.tool_calls().to_vec());
            if let Some(reason) = e.finish_reason() {
                finish = Some(String::from(reason.clone()));
            }
        }
    }
    assert_eq!(text, "Hello  done");
    assert_eq!(calls.len(), 1);
    let function = calls[0].function.clone().unwrap();
    assert_eq!(function.name.as_deref(), Some("lookup"));
    assert_eq!(function.arguments.as_deref(), Some("{\"id\":1}"));
    assert_eq!(finish.as_deref(), Some("tool_calls"));

    let aggregated = sink.aggregated.lock().unwrap();
    assert_eq!(aggregated.len(), 1);
    assert_eq!(aggregated[0].tool_calls[&0].name, "lookup");
    assert_eq!(sink.requests.lock().unwrap()[0]["model"], "mock");
}

#[tokio::test]
async fn test_streaming_without_repair_is_untouched() {
    let backend = spawn_backend().await;
    let sink = Arc::new(RecordingSink::default());
    let app = proxy(&backend, false, sink.clone());

    let response = app
        .oneshot(chat_request(json!({"model": "mock", "stream": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_bytes(response).await;
    assert_eq!(body, Bytes::from(leak_wire().concat()));

    let text: String = events(&body)
        .iter()
        .filter_map(|f| match f {
            Frame::Event(e) => e.content().map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(text, LEAK);
    assert_eq!(sink.aggregated.lock().unwrap()[0].content, LEAK);
}

#[tokio::test]
async fn test_non_streaming_body_returned_unchanged() {
    let backend = spawn_backend().await;
    let app = proxy(&backend, true, Arc::new(RecordingSink::default()));

    let response = app
        .oneshot(chat_request(json!({"model": "mock"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, Bytes::from(NON_STREAMING_BODY));
}

#[tokio::test]
async fn test_upstream_error_status_is_relayed() {
    let backend = spawn_backend().await;
    let app = proxy(&backend, true, Arc::new(RecordingSink::default()));

    let response = app
        .oneshot(chat_request(json!({"model": "limited", "stream": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_bytes(response).await, Bytes::from(r#"{"error":"rate limited"}"#));
}

#[tokio::test]
async fn test_slow_backend_times_out_with_504() {
    let backend = spawn_backend().await;
    let sink = Arc::new(RecordingSink::default());
    let app = proxy(&backend, true, sink.clone());

    for stream in [false, true] {
        let response = app
            .clone()
            .oneshot(chat_request(json!({"model": "slow", "stream": stream})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["code"], "BACKEND_TIMEOUT");
    }
    assert_eq!(sink.errors.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_stalled_stream_ends_with_error_event() {
    let backend = spawn_backend().await;
    let app = proxy(&backend, true, Arc::new(RecordingSink::default()));

    let response = app
        .oneshot(chat_request(json!({"model": "stall", "stream": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = events(&body_bytes(response).await);
    assert_eq!(frames.len(), 2);
    match &frames[1] {
        Frame::Opaque(payload) => {
            let error: Value = serde_json::from_str(payload).unwrap();
            assert_eq!(error["error"]["code"], "BACKEND_TIMEOUT");
        }
        other => panic!("expected terminal error event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    let sink = Arc::new(RecordingSink::default());
    let app = proxy("http://127.0.0.1:1/v1", true, sink);

    let response = app
        .oneshot(chat_request(json!({"model": "mock", "stream": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["code"], "BACKEND_UNREACHABLE");
}

#[tokio::test]
async fn test_invalid_json_is_400() {
    let app = proxy("http://127.0.0.1:1/v1", true, Arc::new(RecordingSink::default()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat/completions")
                .header("x-request-id", "req-42")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()["x-request-id"], "req-42");
}

#[tokio::test]
async fn test_passthrough_keeps_query_and_auth() {
    let backend = spawn_backend().await;
    let app = proxy(&backend, true, Arc::new(RecordingSink::default()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models?limit=2")
                .header("authorization", "Bearer test-key")
                .header("host", "proxy.local")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["data"][0]["id"], "mock");
    assert_eq!(body["query"], "limit=2");
    assert_eq!(body["authorization"], "Bearer test-key");
    assert_ne!(body["host_forwarded"], "proxy.local");
}

#[tokio::test]
async fn test_health_and_info() {
    let app = proxy("http://127.0.0.1:1/v1", false, Arc::new(RecordingSink::default()));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body, json!({"status": "healthy", "service": "toolfix"}));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["target_server"], "http://127.0.0.1:1/v1");
    assert_eq!(body["streaming_tool_parser"], false);
    assert!(body["upstream"].is_object());
}
