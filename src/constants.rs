/// Request headers that never travel to the backend.
pub const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Backend response headers that are not copied onto the client response.
pub const EXCLUDED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "content-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers masked before a request is logged.
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "x-api-key"];

pub const DONE_SENTINEL: &str = "[DONE]";

pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Longest header (name declaration) accepted between an open marker and its payload.
pub const MAX_MARKER_HEADER_CHARS: usize = 256;

pub const TAGGED_OPEN_MARKER: &str = "<tool_call>";
pub const TAGGED_CLOSE_MARKER: &str = "</tool_call>";

pub const SECTION_BEGIN_MARKER: &str = "<|tool_calls_section_begin|>";
pub const SECTION_END_MARKER: &str = "<|tool_calls_section_end|>";
pub const CALL_BEGIN_MARKER: &str = "<|tool_call_begin|>";
pub const CALL_ARGUMENT_BEGIN_MARKER: &str = "<|tool_call_argument_begin|>";
pub const CALL_END_MARKER: &str = "<|tool_call_end|>";

/// Log targets routed to their own files.
pub const STREAM_CHUNK_TARGET: &str = "toolfix::stream_chunk";
pub const SERVER_CHUNK_TARGET: &str = "toolfix::server_chunk";

pub const SERVICE_NAME: &str = "toolfix";
