use crate::constants::SENSITIVE_HEADERS;
use axum::http::HeaderMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::io::Write;
use tracing_subscriber::fmt::MakeWriter;

lazy_static! {
    static ref SECRET_PATTERN: Regex = Regex::new(
        r"(?i)(sk-[A-Za-z0-9_\-]{20,}|Bearer\s+[^\s,;]+|x-api-key:\s*[^\s,;]+)"
    )
    .expect("Invalid redaction regex");
}

const REDACTED: &str = "[REDACTED]";

fn is_secret_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&name.as_str())
        || ["key", "token", "secret", "password"]
            .iter()
            .any(|needle| name.contains(needle))
}

/// Header map as JSON with credential-bearing values masked.
pub fn redact_headers(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for (name, value) in headers {
        let shown = if is_secret_name(name.as_str()) {
            REDACTED.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        out.insert(name.as_str().to_string(), Value::String(shown));
    }
    Value::Object(out)
}

/// Masks values under secret-looking keys, recursively. Token counters such
/// as `max_tokens` are numbers and stay visible.
pub fn redact_value(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                if is_secret_name(k) && val.is_string() {
                    *val = Value::String(REDACTED.to_string());
                } else {
                    redact_value(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val);
            }
        }
        _ => {}
    }
}

/// Scrubs bearer tokens and API keys from formatted log lines.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = SECRET_PATTERN.replace_all(&input, REDACTED);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` adapter so a redacting writer can back a `fmt` layer.
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_headers_are_masked() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("x-goog-api-key", HeaderValue::from_static("k"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let shown = redact_headers(&headers);
        assert_eq!(shown["authorization"], REDACTED);
        assert_eq!(shown["x-goog-api-key"], REDACTED);
        assert_eq!(shown["content-type"], "application/json");
    }

    #[test]
    fn test_body_secrets_masked_but_token_counts_kept() {
        let mut body = json!({"api_key": "sk-1", "max_tokens": 64, "nested": [{"password": "p"}]});
        redact_value(&mut body);
        assert_eq!(body["api_key"], REDACTED);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["nested"][0]["password"], REDACTED);
    }

    #[test]
    fn test_writer_scrubs_bearer_tokens() {
        let mut writer = RedactingWriter::new(Vec::new());
        writer
            .write_all(b"auth=Bearer sk-abcdefghijklmnopqrstuvwxyz done")
            .unwrap();
        let written = String::from_utf8(writer.inner).unwrap();
        assert_eq!(written, "auth=[REDACTED] done");
    }
}
