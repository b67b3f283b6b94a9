use crate::grammar::{build_grammars, GrammarKind};
use crate::logging::{request_id_middleware, ExchangeSink, REQUEST_ID_HEADER};
use crate::repair::{RepairRules, ToolCallRepairer};
use crate::types::*;
use crate::{health, ingress};
use axum::{
    http::{HeaderName, HeaderValue},
    middleware,
    routing::{any, get, post},
    Router,
};
use clap::{ArgAction, Parser};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Chat-completion proxy that repairs leaked tool calls", long_about = None)]
pub struct Args {
    /// Backend base URL; the chat endpoint is `<base>/chat/completions`.
    #[arg(long, env = "BACKEND_API_BASE", default_value = "http://127.0.0.1:30000/v1")]
    pub backend_url: String,
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "PROXY_PORT", default_value_t = 8000)]
    pub port: u16,
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(
        long,
        env = "ENABLE_FILE_LOGGING",
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub enable_file_logging: bool,
    #[arg(long, env = "LOG_FILE", default_value = "toolfix.log")]
    pub log_file: String,
    #[arg(long, env = "LOG_DIR", default_value = ".")]
    pub log_dir: String,
    /// Bounds the whole exchange for non-streaming calls, and time to first
    /// byte plus each idle gap for streaming calls.
    #[arg(long, env = "FORWARD_TIMEOUT", default_value_t = 300)]
    pub forward_timeout_secs: u64,
    #[arg(long, env = "CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(
        long,
        env = "ENABLE_STREAMING_TOOL_PARSER",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub enable_streaming_tool_parser: bool,
    #[arg(
        long,
        env = "TOOL_CALL_GRAMMARS",
        value_enum,
        value_delimiter = ',',
        default_values_t = vec![GrammarKind::Tagged, GrammarKind::Sectioned]
    )]
    pub tool_call_grammars: Vec<GrammarKind>,
    #[arg(long, env = "MAX_LEAK_PAYLOAD_BYTES", default_value_t = 1024 * 1024)]
    pub max_leak_payload_bytes: usize,
    #[arg(long, env = "STREAM_QUEUE_DEPTH", default_value_t = 32)]
    pub stream_queue_depth: usize,
    #[arg(long, env = "MAX_BODY_SIZE", default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
    /// Comma separated; `*` allows any origin.
    #[arg(long, env = "ALLOWED_ORIGINS", default_value = "*")]
    pub allowed_origins: String,
}

impl Args {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    pub fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.backend_url.trim_end_matches('/'))
    }

    /// Target for a path below the API prefix, e.g. `models` -> `<base>/models`.
    pub fn passthrough_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}",
            self.backend_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }
        url
    }
}

pub struct AppState {
    pub client: reqwest::Client,
    pub args: Arc<Args>,
    pub rules: Arc<RepairRules>,
    pub sink: Arc<dyn ExchangeSink>,
    pub health: Arc<UpstreamHealth>,
}

impl AppState {
    pub fn new(args: Args, sink: Arc<dyn ExchangeSink>) -> Result<Self> {
        // No client-wide timeout: forward timeouts are applied per phase.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;

        let rules = Arc::new(RepairRules::new(
            build_grammars(&args.tool_call_grammars),
            args.max_leak_payload_bytes,
        ));

        Ok(Self {
            client,
            args: Arc::new(args),
            rules,
            sink,
            health: Arc::new(UpstreamHealth::default()),
        })
    }

    /// A fresh repairer when repair is enabled.
    pub fn repairer(&self) -> Option<ToolCallRepairer> {
        self.args
            .enable_streaming_tool_parser
            .then(|| ToolCallRepairer::new(self.rules.clone()))
    }
}

fn cors_layer(allowed_origins: &str) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty() && *o != "*")
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    let expose = [HeaderName::from_static(REQUEST_ID_HEADER)];

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(expose)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
            .expose_headers(expose)
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health::service_info))
        .route("/health", get(health::liveness))
        .route("/v1/chat/completions", post(ingress::chat_completions))
        .route("/api/chat/completions", post(ingress::chat_completions))
        .route("/v1/*path", any(ingress::passthrough))
        .layer(axum::extract::DefaultBodyLimit::max(state.args.max_body_size))
        .layer(cors_layer(&state.args.allowed_origins))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
