use crate::aggregator::AggregatedMessage;
use crate::constants::{SERVER_CHUNK_TARGET, STREAM_CHUNK_TARGET};
use crate::main_helper::Args;
use crate::redaction::{redact_headers, redact_value, RedactingMakeWriter};
use crate::types::{DeltaEvent, RequestId};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, Response, StatusCode},
    middleware::Next,
};
use colored::*;
use serde_json::Value;
use std::panic;
use tracing::{error, info, info_span, warn, Instrument};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Receiver of per-request exchange records. Calls are fire-and-forget and
/// may come from many request tasks at once.
pub trait ExchangeSink: Send + Sync {
    fn log_request(&self, request_id: &RequestId, headers: &HeaderMap, body: &Value);

    /// Raw bytes as received from the backend.
    fn log_server_chunk(&self, request_id: &RequestId, chunk: &[u8]);

    /// Bytes as written to the client.
    fn log_stream_chunk(&self, request_id: &RequestId, chunk: &[u8]);

    fn log_response_body(&self, request_id: &RequestId, status: StatusCode, body: &[u8]);

    fn log_aggregated(&self, request_id: &RequestId, message: &AggregatedMessage);

    fn log_error(&self, request_id: &RequestId, message: &str, details: &Value);
}

/// Writes every record as a `tracing` event. Chunk records go to their own
/// targets so the subscriber can route them to separate files.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ExchangeSink for TracingSink {
    fn log_request(&self, request_id: &RequestId, headers: &HeaderMap, body: &Value) {
        let mut body = body.clone();
        redact_value(&mut body);
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let model = body.get("model").and_then(Value::as_str).unwrap_or("?");
        info!(
            "[🖱️  -> ⚙️ ] Request {} model={} stream={} headers={} body={}",
            request_id,
            model,
            stream,
            redact_headers(headers),
            body
        );
    }

    fn log_server_chunk(&self, request_id: &RequestId, chunk: &[u8]) {
        info!(
            target: SERVER_CHUNK_TARGET,
            "{} {}",
            request_id,
            String::from_utf8_lossy(chunk).escape_debug()
        );
    }

    fn log_stream_chunk(&self, request_id: &RequestId, chunk: &[u8]) {
        info!(
            target: STREAM_CHUNK_TARGET,
            "{} {}",
            request_id,
            String::from_utf8_lossy(chunk).escape_debug()
        );
    }

    fn log_response_body(&self, request_id: &RequestId, status: StatusCode, body: &[u8]) {
        let text = String::from_utf8_lossy(body);
        if status.is_success() {
            info!("[☁️  -> 🖱️ ] Response {} status={} body={}", request_id, status, text);
        } else {
            warn!("[☁️  -> 🖱️ ] Response {} status={} body={}", request_id, status, text);
        }
    }

    fn log_aggregated(&self, request_id: &RequestId, message: &AggregatedMessage) {
        let tool_names: Vec<&str> = message.tool_calls.values().map(|c| c.name.as_str()).collect();
        info!(
            "[☁️  -> 🖱️ ] Aggregated {} | Finish: {} | Tools: {} | Text: {} chars | Reasoning: {} chars | completion={}",
            request_id,
            message
                .finish_reason
                .clone()
                .map(String::from)
                .unwrap_or_else(|| "NONE".to_string()),
            if tool_names.is_empty() { "-".to_string() } else { tool_names.join(", ") },
            message.content.chars().count(),
            message.reasoning_content.chars().count(),
            message.to_completion_json(request_id)
        );
        if !message.opaque_frames.is_empty() {
            warn!(
                "{}",
                format!(
                    "[☁️  -> 🖱️ ] {} undecodable frame(s) passed through for {}",
                    message.opaque_frames.len(),
                    request_id
                )
                .yellow()
            );
        }
    }

    fn log_error(&self, request_id: &RequestId, message: &str, details: &Value) {
        error!("[☁️  -> ⚙️ ] Error {}: {} details={}", request_id, message, details);
    }
}

/// Main log plus the two chunk logs, all derived from `--log-file`.
pub fn log_file_names(log_file: &str) -> [String; 3] {
    let stem = std::path::Path::new(log_file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "toolfix".to_string());
    [
        log_file.to_string(),
        format!("{}_chunks.log", stem),
        format!("{}_server_chunks.log", stem),
    ]
}

fn level_filter(args: &Args) -> tracing_subscriber::EnvFilter {
    // Chunk records only ever reach their dedicated files.
    let quiet = format!("{}=off,{}=off", STREAM_CHUNK_TARGET, SERVER_CHUNK_TARGET);
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone());
    tracing_subscriber::EnvFilter::try_new(format!("{},{}", base, quiet))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("info,{}", quiet)))
}

/// Installs the global subscriber. The returned guards must live as long as
/// the process so buffered file writes are flushed.
pub fn init_tracing(args: &Args) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_appender::{non_blocking, rolling};
    use tracing_subscriber::{filter::Targets, fmt, prelude::*};

    let mut guards = Vec::new();
    let files = if args.enable_file_logging {
        if let Err(e) = std::fs::create_dir_all(&args.log_dir) {
            eprintln!("Failed to create log directory {}: {}", args.log_dir, e);
        }
        let [main, chunks, server_chunks] = log_file_names(&args.log_file);
        let mut open = |name: &str| {
            let (writer, guard) = non_blocking(rolling::daily(&args.log_dir, name));
            guards.push(guard);
            writer
        };
        Some((open(&main), open(&chunks), open(&server_chunks)))
    } else {
        None
    };

    let chunk_targets = |target: &str| Targets::new().with_target(target, tracing::Level::TRACE);

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(level_filter(args)))
        .with(files.as_ref().map(|(main, _, _)| {
            fmt::layer()
                .with_writer(RedactingMakeWriter::new(main.clone()))
                .with_ansi(false)
                .with_filter(level_filter(args))
        }))
        .with(files.as_ref().map(|(_, chunks, _)| {
            fmt::layer()
                .with_writer(RedactingMakeWriter::new(chunks.clone()))
                .with_ansi(false)
                .with_target(false)
                .with_filter(chunk_targets(STREAM_CHUNK_TARGET))
        }))
        .with(files.as_ref().map(|(_, _, server_chunks)| {
            fmt::layer()
                .with_writer(RedactingMakeWriter::new(server_chunks.clone()))
                .with_ansi(false)
                .with_target(false)
                .with_filter(chunk_targets(SERVER_CHUNK_TARGET))
        }))
        .with(tracing_error::ErrorLayer::default())
        .init();

    guards
}

/// Logs panics through `tracing` before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Gives every request an id (the caller's `X-Request-ID` if it sent one),
/// runs the request inside a span carrying it and echoes it on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| RequestId(s.to_string()))
        .unwrap_or_default();
    req.extensions_mut().insert(request_id.clone());

    let span = info_span!("request", request_id = %request_id.short());
    let mut response = next.run(req).instrument(span).await;

    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&request_id.0) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    response
}

/// First `max_chars` characters of `text`, with a marker when cut.
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Default)]
pub struct StreamMetric {
    pub frames: usize,
    pub events: usize,
    pub text_chars: usize,
    pub reasoning_chars: usize,
    pub tool_parts: usize,
    pub tool_names: Vec<String>,
    pub total_tokens: u64,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn record_event(&mut self, event: &DeltaEvent) {
        self.events += 1;
        if let Some(usage) = event.usage() {
            self.total_tokens = usage.total_tokens;
        }
        if let Some(text) = event.content() {
            self.text_chars += text.chars().count();
        }
        if let Some(text) = event.reasoning() {
            self.reasoning_chars += text.chars().count();
        }
        for call in event.tool_calls() {
            self.tool_parts += 1;
            if let Some(name) = call.function.as_ref().and_then(|f| f.name.as_ref()) {
                if !name.is_empty() {
                    self.tool_names.push(name.clone());
                }
            }
        }
    }

    pub fn log_summary(&self, request_id: &RequestId, repaired: usize) {
        let tools = if self.tool_names.is_empty() {
            format!("{}", self.tool_parts)
        } else {
            format!("{} ({})", self.tool_parts, self.tool_names.join(", "))
        };
        info!(
            "[STREAM END] {} | Frames: {} | Events: {} | Tools: {} | Repaired: {} | Text: {} chars | Reasoning: {} chars | Tokens: {}",
            request_id,
            self.frames,
            self.events,
            tools,
            repaired,
            self.text_chars,
            self.reasoning_chars,
            self.total_tokens
        );
    }
}
