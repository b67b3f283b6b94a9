//! Leak grammars: the surface syntax a backend uses when it writes a tool
//! call into a free-text channel instead of the structured `tool_calls` field.
//!
//! Backend releases differ in how they leak, so the syntax is a trait and the
//! repairer is handed whichever grammars are configured.

use crate::constants::{
    CALL_ARGUMENT_BEGIN_MARKER, CALL_BEGIN_MARKER, CALL_END_MARKER, SECTION_BEGIN_MARKER,
    SECTION_END_MARKER, TAGGED_CLOSE_MARKER, TAGGED_OPEN_MARKER,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

lazy_static! {
    static ref SECTIONED_HEADER: Regex =
        Regex::new(r"^\s*(?:functions\.)?([\w.\-]+?)(?::\d+)?\s*$").expect("Invalid header regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedCall {
    pub name: String,
    pub arguments: String,
}

/// Layout of one leaked call: `open [header header_end] payload [close]`.
///
/// The payload is always a single JSON object; its end is found by bracket
/// depth, not by a marker.
pub trait LeakGrammar: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn open_marker(&self) -> &str;

    /// Terminator of a header between the open marker and the payload.
    /// `None` when the payload follows the open marker directly.
    fn header_end(&self) -> Option<&str> {
        None
    }

    /// Marker expected after the payload. Whitespace may precede it.
    fn close_marker(&self) -> Option<&str> {
        None
    }

    /// Markers that carry no content and are removed wherever they appear.
    fn silent_markers(&self) -> &[&str] {
        &[]
    }

    /// Turns a complete header and payload into a call, or `None` when the
    /// region is not a usable tool call.
    fn interpret(&self, header: &str, payload: &str) -> Option<LeakedCall>;
}

/// `<tool_call>{"name": "...", "arguments": ...}</tool_call>`
#[derive(Debug, Clone)]
pub struct TaggedJsonGrammar {
    open: String,
    close: String,
}

impl Default for TaggedJsonGrammar {
    fn default() -> Self {
        Self::new(TAGGED_OPEN_MARKER, TAGGED_CLOSE_MARKER)
    }
}

impl TaggedJsonGrammar {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

impl LeakGrammar for TaggedJsonGrammar {
    fn name(&self) -> &'static str {
        "tagged"
    }

    fn open_marker(&self) -> &str {
        &self.open
    }

    fn close_marker(&self) -> Option<&str> {
        Some(&self.close)
    }

    fn interpret(&self, _header: &str, payload: &str) -> Option<LeakedCall> {
        let value: Value = serde_json::from_str(payload).ok()?;
        let obj = value.as_object()?;
        let name = obj.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }

        // Arguments are forwarded as JSON text, matching the wire convention.
        let arguments = match obj.get("arguments").or_else(|| obj.get("parameters")) {
            None | Some(Value::Null) => "{}".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        Some(LeakedCall {
            name: name.to_string(),
            arguments,
        })
    }
}

/// Section/marker leakage:
/// `<|tool_calls_section_begin|><|tool_call_begin|>functions.NAME:N<|tool_call_argument_begin|>{...}<|tool_call_end|><|tool_calls_section_end|>`
#[derive(Debug, Clone, Default)]
pub struct SectionedMarkerGrammar;

const SECTIONED_SILENT: &[&str] = &[SECTION_BEGIN_MARKER, SECTION_END_MARKER];

impl LeakGrammar for SectionedMarkerGrammar {
    fn name(&self) -> &'static str {
        "sectioned"
    }

    fn open_marker(&self) -> &str {
        CALL_BEGIN_MARKER
    }

    fn header_end(&self) -> Option<&str> {
        Some(CALL_ARGUMENT_BEGIN_MARKER)
    }

    fn close_marker(&self) -> Option<&str> {
        Some(CALL_END_MARKER)
    }

    fn silent_markers(&self) -> &[&str] {
        SECTIONED_SILENT
    }

    fn interpret(&self, header: &str, payload: &str) -> Option<LeakedCall> {
        let name = SECTIONED_HEADER.captures(header)?.get(1)?.as_str();
        let value: Value = serde_json::from_str(payload).ok()?;
        if !value.is_object() {
            return None;
        }
        Some(LeakedCall {
            name: name.to_string(),
            arguments: payload.trim().to_string(),
        })
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrammarKind {
    Tagged,
    Sectioned,
}

impl GrammarKind {
    pub fn build(self) -> Arc<dyn LeakGrammar> {
        match self {
            GrammarKind::Tagged => Arc::new(TaggedJsonGrammar::default()),
            GrammarKind::Sectioned => Arc::new(SectionedMarkerGrammar),
        }
    }
}

pub fn build_grammars(kinds: &[GrammarKind]) -> Vec<Arc<dyn LeakGrammar>> {
    let mut seen = Vec::new();
    let mut grammars = Vec::new();
    for kind in kinds {
        if !seen.contains(kind) {
            seen.push(*kind);
            grammars.push(kind.build());
        }
    }
    grammars
}
