use crate::constants::SERVICE_NAME;
use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub service: &'static str,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "healthy",
        service: SERVICE_NAME,
    })
}

pub async fn service_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Chat-completion proxy with streaming tool-call repair",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "chat": "/v1/chat/completions",
            "chat_legacy": "/api/chat/completions",
            "passthrough": "/v1/*",
            "health": "/health",
        },
        "target_server": state.args.backend_url,
        "streaming_tool_parser": state.args.enable_streaming_tool_parser,
        "tool_call_grammars": state.rules.grammar_names(),
        "upstream": state.health.snapshot(),
    }))
}
