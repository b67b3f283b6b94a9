//! Server-sent-event framing for chat-completion streams.
//!
//! A frame is a run of `field: value` lines closed by a blank line. The
//! payload of a chat stream lives in its `data:` lines and is either one
//! `chat.completion.chunk` object or the `[DONE]` sentinel.

use crate::constants::{DONE_SENTINEL, MAX_FRAME_BYTES};
use crate::types::{DeltaEvent, ProxyError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(DeltaEvent),
    Done,
    /// A `data:` payload that is not a chunk object. Written back untouched.
    Opaque(String),
    /// A frame without `data:` lines (keep-alive comments and the like), as received.
    Comment(String),
}

#[derive(Debug, Clone)]
pub struct SseCodec {
    max_frame_bytes: usize,
}

impl Default for SseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SseCodec {
    pub fn new() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

/// Locates the first blank line. Returns the end of the frame body and the
/// number of bytes to consume, blank line included.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    while let Some(offset) = buf[line_start..].iter().position(|b| *b == b'\n') {
        let newline = line_start + offset;
        let line = &buf[line_start..newline];
        if line.is_empty() || line == b"\r" {
            return Some((line_start, newline + 1));
        }
        line_start = newline + 1;
    }
    None
}

/// Classifies one frame body. `None` for a body with nothing in it.
fn parse_frame(body: &[u8]) -> Option<Frame> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim_end_matches(['\r', '\n']);
    if text.trim().is_empty() {
        return None;
    }

    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if data_lines.is_empty() {
        return Some(Frame::Comment(text.to_string()));
    }

    let data = data_lines.join("\n");
    if data.trim() == DONE_SENTINEL {
        return Some(Frame::Done);
    }

    match DeltaEvent::parse(&data) {
        Ok(event) => Some(Frame::Event(event)),
        Err(e) => {
            tracing::warn!(
                "[☁️  -> ⚙️ ] Undecodable frame passed through as-is: {} (payload: {:?})",
                e,
                crate::logging::snippet(&data, 120)
            );
            Some(Frame::Opaque(data))
        }
    }
}

impl Decoder for SseCodec {
    type Item = Frame;
    type Error = ProxyError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProxyError> {
        loop {
            let Some((body_end, consumed)) = find_frame_end(buf) else {
                if buf.len() > self.max_frame_bytes {
                    return Err(ProxyError::Frame(format!(
                        "frame exceeds {} bytes without a terminating blank line",
                        self.max_frame_bytes
                    )));
                }
                return Ok(None);
            };

            let raw = buf.split_to(consumed);
            if let Some(frame) = parse_frame(&raw[..body_end]) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProxyError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        Ok(parse_frame(&rest))
    }
}

fn put_data_lines(payload: &str, dst: &mut BytesMut) {
    dst.reserve(payload.len() + 8);
    for line in payload.split('\n') {
        dst.put_slice(b"data: ");
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
    }
    dst.put_u8(b'\n');
}

impl Encoder<&Frame> for SseCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProxyError> {
        match frame {
            Frame::Event(event) => put_data_lines(&event.to_json()?, dst),
            Frame::Done => put_data_lines(DONE_SENTINEL, dst),
            Frame::Opaque(payload) => put_data_lines(payload, dst),
            Frame::Comment(raw) => {
                dst.put_slice(raw.as_bytes());
                dst.put_slice(b"\n\n");
            }
        }
        Ok(())
    }
}

pub fn encode_frame(frame: &Frame) -> Result<Bytes, ProxyError> {
    let mut dst = BytesMut::new();
    SseCodec::new().encode(frame, &mut dst)?;
    Ok(dst.freeze())
}

/// Push-style decoder for callers that already hold the byte chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: SseCodec,
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, ProxyError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Decodes whatever is left once the transport has closed.
    pub fn finish(&mut self) -> Result<Vec<Frame>, ProxyError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode_eof(&mut self.buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
