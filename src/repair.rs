//! Streaming repair of tool calls that leak into free-text channels.
//!
//! Every streaming request owns one [`ToolCallRepairer`]. It scans the
//! `content` and `reasoning_content` fragments of choice 0 as they arrive,
//! cuts out regions written in one of the configured [`LeakGrammar`]s and
//! replaces them with structured `tool_calls` events. Text that only looks
//! like the start of a leak is held back until it is confirmed or disproved.
//! A region that turns out not to be a tool call is released verbatim.

use crate::constants::MAX_MARKER_HEADER_CHARS;
use crate::grammar::{LeakGrammar, LeakedCall};
use crate::json_depth::{DepthStatus, DepthTracker};
use crate::types::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Scanning,
    InMarker,
    InPayload,
    InTrailer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Call(LeakedCall),
}

#[derive(Debug, Clone, Copy)]
enum MarkerRole {
    Open(usize),
    Silent,
}

#[derive(Debug, Clone)]
struct Marker {
    text: String,
    role: MarkerRole,
}

/// Immutable, shareable configuration of the repairer.
#[derive(Debug)]
pub struct RepairRules {
    grammars: Vec<Arc<dyn LeakGrammar>>,
    markers: Vec<Marker>,
    max_region_bytes: usize,
}

impl RepairRules {
    pub fn new(grammars: Vec<Arc<dyn LeakGrammar>>, max_region_bytes: usize) -> Self {
        let mut markers = Vec::new();
        for (idx, grammar) in grammars.iter().enumerate() {
            markers.push(Marker {
                text: grammar.open_marker().to_string(),
                role: MarkerRole::Open(idx),
            });
            for silent in grammar.silent_markers() {
                markers.push(Marker {
                    text: silent.to_string(),
                    role: MarkerRole::Silent,
                });
            }
        }
        markers.retain(|m| !m.text.is_empty());

        Self {
            grammars,
            markers,
            max_region_bytes,
        }
    }

    pub fn grammar_names(&self) -> Vec<&'static str> {
        self.grammars.iter().map(|g| g.name()).collect()
    }

    /// Byte offset where the longest suffix of `held` that could still grow
    /// into a marker begins. `held.len()` when no suffix qualifies.
    fn held_prefix_start(&self, held: &str) -> usize {
        held.char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let tail = &held[i..];
                self.markers.iter().any(|m| m.text.starts_with(tail))
            })
            .unwrap_or(held.len())
    }
}

#[derive(Debug, Default)]
struct Segments(Vec<Segment>);

impl Segments {
    fn text(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        if let Some(Segment::Text(last)) = self.0.last_mut() {
            last.push_str(s);
        } else {
            self.0.push(Segment::Text(s.to_string()));
        }
    }

    fn call(&mut self, call: LeakedCall) {
        self.0.push(Segment::Call(call));
    }

    fn extend(&mut self, segments: Vec<Segment>) {
        for segment in segments {
            match segment {
                Segment::Text(t) => self.text(&t),
                Segment::Call(c) => self.call(c),
            }
        }
    }
}

/// Scanner state for one free-text channel.
#[derive(Debug)]
pub struct LeakScanner {
    mode: ScanMode,
    grammar: usize,
    /// Scanning: a possible marker prefix. InTrailer: text seen after the payload.
    held: String,
    /// Silent markers (and whitespace between them) not yet known to wrap a call.
    pending: String,
    /// A call was just repaired: adjacent silent markers belong to its wrapper.
    in_section: bool,
    /// Raw text of the current region, open marker included.
    region: String,
    header: String,
    payload: String,
    depth: DepthTracker,
}

impl Default for LeakScanner {
    fn default() -> Self {
        Self {
            mode: ScanMode::Scanning,
            grammar: 0,
            held: String::new(),
            pending: String::new(),
            in_section: false,
            region: String::new(),
            header: String::new(),
            payload: String::new(),
            depth: DepthTracker::new(),
        }
    }
}

impl LeakScanner {
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn is_idle(&self) -> bool {
        self.mode == ScanMode::Scanning && self.held.is_empty() && self.pending.is_empty()
    }

    pub fn feed(&mut self, text: &str, rules: &RepairRules) -> Vec<Segment> {
        let mut out = Segments::default();
        let mut work = text.to_string();
        let mut pos = 0;
        while let Some(ch) = work[pos..].chars().next() {
            pos += ch.len_utf8();
            if let Some(replay) = self.step(ch, rules, &mut out) {
                work = format!("{}{}", replay, &work[pos..]);
                pos = 0;
            }
        }
        out.0
    }

    /// Releases everything still buffered as plain text.
    pub fn finish(&mut self, rules: &RepairRules) -> Vec<Segment> {
        let mut out = Segments::default();
        out.text(&std::mem::take(&mut self.pending));
        match self.mode {
            ScanMode::Scanning => out.text(&self.held),
            ScanMode::InTrailer => {
                // A close marker cut off by the end of the stream is still part
                // of the repaired call.
                let rest = self.held.trim_start();
                let close = rules.grammars[self.grammar].close_marker().unwrap_or("");
                if rest.is_empty() || close.starts_with(rest) {
                    out.text(&self.held[..self.held.len() - rest.len()]);
                } else {
                    out.text(&self.held);
                }
            }
            ScanMode::InMarker | ScanMode::InPayload => {
                tracing::warn!(
                    "[⚙️  -> 🔧 ] Stream ended inside a leaked region ({:?}, {} bytes); releasing it as text",
                    self.mode,
                    self.region.len()
                );
                out.text(&self.region);
            }
        }
        self.reset();
        self.in_section = false;
        out.0
    }

    fn reset(&mut self) {
        self.mode = ScanMode::Scanning;
        self.held.clear();
        self.region.clear();
        self.header.clear();
        self.payload.clear();
        self.depth.reset();
    }

    /// Advances by one character. Returns text that must be scanned again
    /// after a region was abandoned.
    fn step(&mut self, ch: char, rules: &RepairRules, out: &mut Segments) -> Option<String> {
        match self.mode {
            ScanMode::Scanning => {
                self.scan(ch, rules, out);
                None
            }
            ScanMode::InMarker => {
                self.region.push(ch);
                self.header.push(ch);
                let end = rules.grammars[self.grammar].header_end().unwrap_or("");
                if self.header.ends_with(end) {
                    self.header.truncate(self.header.len() - end.len());
                    self.mode = ScanMode::InPayload;
                    return None;
                }
                if self.header.len() > MAX_MARKER_HEADER_CHARS + end.len() {
                    return Some(self.abandon(rules, out, "header too long"));
                }
                self.check_size(rules, out)
            }
            ScanMode::InPayload => {
                self.region.push(ch);
                if self.payload.is_empty() {
                    if ch.is_whitespace() {
                        return self.check_size(rules, out);
                    }
                    if ch != '{' {
                        return Some(self.abandon(rules, out, "payload is not an object"));
                    }
                }
                self.payload.push(ch);
                match self.depth.feed(ch) {
                    DepthStatus::Open => self.check_size(rules, out),
                    DepthStatus::Unbalanced => Some(self.abandon(rules, out, "unbalanced payload")),
                    DepthStatus::Balanced => self.complete(rules, out),
                }
            }
            ScanMode::InTrailer => {
                self.held.push(ch);
                let close = rules.grammars[self.grammar].close_marker().unwrap_or("");
                let pending = self.held.trim_start();
                if pending == close {
                    self.reset();
                    return None;
                }
                if (pending.is_empty() || close.starts_with(pending))
                    && self.held.len() <= MAX_MARKER_HEADER_CHARS
                {
                    return None;
                }
                // No close marker after all: the text belongs to the channel.
                let replay = std::mem::take(&mut self.held);
                self.reset();
                Some(replay)
            }
        }
    }

    fn scan(&mut self, ch: char, rules: &RepairRules, out: &mut Segments) {
        self.held.push(ch);

        let held = &self.held;
        if let Some(marker) = rules.markers.iter().find(|m| held.ends_with(m.text.as_str())) {
            let keep = self.held.len() - marker.text.len();
            let before = self.held[..keep].to_string();
            self.emit(&before, out);
            self.held.clear();
            match marker.role {
                MarkerRole::Open(idx) => {
                    self.grammar = idx;
                    self.region.push_str(&marker.text);
                    self.mode = if rules.grammars[idx].header_end().is_some() {
                        ScanMode::InMarker
                    } else {
                        ScanMode::InPayload
                    };
                }
                // Dropped only once a call next to it is repaired.
                MarkerRole::Silent if !self.in_section => self.pending.push_str(&marker.text),
                MarkerRole::Silent => {}
            }
            return;
        }

        let start = rules.held_prefix_start(&self.held);
        if start > 0 {
            let flushed: String = self.held.drain(..start).collect();
            self.emit(&flushed, out);
        }
    }

    /// Writes channel text. Whitespace right after a silent marker stays
    /// pending with it; anything else releases the pending markers first.
    fn emit(&mut self, text: &str, out: &mut Segments) {
        if text.is_empty() {
            return;
        }
        let blank = text.trim().is_empty();
        if blank && !self.pending.is_empty() {
            self.pending.push_str(text);
            return;
        }
        if !blank {
            self.in_section = false;
        }
        out.text(&std::mem::take(&mut self.pending));
        out.text(text);
    }

    fn complete(&mut self, rules: &RepairRules, out: &mut Segments) -> Option<String> {
        let grammar = &rules.grammars[self.grammar];
        match grammar.interpret(&self.header, &self.payload) {
            Some(call) => {
                out.call(call);
                self.reset();
                self.pending.clear();
                self.in_section = true;
                if grammar.close_marker().is_some() {
                    self.mode = ScanMode::InTrailer;
                }
                None
            }
            None => Some(self.abandon(rules, out, "payload is not a tool call")),
        }
    }

    fn check_size(&mut self, rules: &RepairRules, out: &mut Segments) -> Option<String> {
        if self.region.len() > rules.max_region_bytes {
            return Some(self.abandon(rules, out, "region exceeds size limit"));
        }
        None
    }

    /// Gives up on the current region: the open marker goes out as text and
    /// the rest is returned for rescanning.
    fn abandon(&mut self, rules: &RepairRules, out: &mut Segments, reason: &str) -> String {
        let grammar = &rules.grammars[self.grammar];
        let region = std::mem::take(&mut self.region);
        let split = grammar.open_marker().len().min(region.len());
        tracing::debug!(
            "[⚙️  -> 🔧 ] Not a {} tool call ({}): {:?}",
            grammar.name(),
            reason,
            crate::logging::snippet(&region, 80)
        );
        out.text(&std::mem::take(&mut self.pending));
        out.text(&region[..split]);
        let replay = region[split..].to_string();
        self.reset();
        replay
    }
}

/// Per-request repair state: one scanner per channel plus the tool-call index space.
#[derive(Debug)]
pub struct ToolCallRepairer {
    rules: Arc<RepairRules>,
    content: LeakScanner,
    reasoning: LeakScanner,
    next_index: u32,
    synthetic: BTreeSet<u32>,
    genuine: HashMap<u32, u32>,
    repaired: usize,
    skeleton: Option<ChatChunk>,
    reasoning_key: ReasoningKey,
}

impl ToolCallRepairer {
    pub fn new(rules: Arc<RepairRules>) -> Self {
        Self {
            rules,
            content: LeakScanner::default(),
            reasoning: LeakScanner::default(),
            next_index: 0,
            synthetic: BTreeSet::new(),
            genuine: HashMap::new(),
            repaired: 0,
            skeleton: None,
            reasoning_key: ReasoningKey::default(),
        }
    }

    pub fn repaired_calls(&self) -> usize {
        self.repaired
    }

    pub fn is_idle(&self) -> bool {
        self.content.is_idle() && self.reasoning.is_idle()
    }

    /// Feeds one backend event and returns the events to send in its place.
    pub fn observe(&mut self, mut event: DeltaEvent) -> Vec<DeltaEvent> {
        let Some(choice) = event.first_choice() else {
            return vec![event];
        };
        let finishing = choice.finish_reason.is_some();
        let reasoning_in = choice.delta.reasoning_text().map(str::to_string);
        if let Some(key) = choice.delta.reasoning_key() {
            self.reasoning_key = key;
        }
        let key = self.reasoning_key;
        let content_in = choice.delta.content.clone();
        self.skeleton = Some(skeleton_of(event.chunk()));

        let mut reasoning = Segments::default();
        reasoning.extend(self.reasoning.feed(reasoning_in.as_deref().unwrap_or(""), &self.rules));
        let mut content = Segments::default();
        content.extend(self.content.feed(content_in.as_deref().unwrap_or(""), &self.rules));
        if finishing {
            reasoning.extend(self.reasoning.finish(&self.rules));
            content.extend(self.content.finish(&self.rules));
        }

        let remapped = self.remap_genuine(event.tool_calls());
        let new_calls = reasoning
            .0
            .iter()
            .chain(content.0.iter())
            .filter(|s| matches!(s, Segment::Call(_)))
            .count();
        let rewrite_finish = event.finish_reason() == Some(&FinishReason::Stop)
            && self.repaired + new_calls > 0;

        if passes_through(&reasoning_in, &reasoning.0)
            && passes_through(&content_in, &content.0)
            && remapped.is_none()
            && !rewrite_finish
        {
            return vec![event];
        }

        let skeleton = skeleton_of(event.chunk());
        let mut head = std::mem::take(event.chunk_mut());
        let (finish_reason, usage) = {
            let first = &mut head.choices[0];
            first.delta.content = None;
            first.delta.set_reasoning(None, ReasoningKey::Both);
            if let Some(calls) = remapped {
                first.delta.tool_calls = Some(calls);
            }
            (first.finish_reason.take(), head.usage.take())
        };

        let mut chunks = vec![head];
        let mut last_is_call = false;
        let pieces = reasoning
            .0
            .into_iter()
            .map(|s| (true, s))
            .chain(content.0.into_iter().map(|s| (false, s)));
        for (is_reasoning, segment) in pieces {
            match segment {
                Segment::Text(text) => {
                    let occupied = chunks.last().is_some_and(|c| {
                        let delta = &c.choices[0].delta;
                        if is_reasoning {
                            delta.reasoning_text().is_some()
                        } else {
                            delta.content.is_some()
                        }
                    });
                    if last_is_call || occupied {
                        chunks.push(skeleton.clone());
                        last_is_call = false;
                    }
                    if let Some(chunk) = chunks.last_mut() {
                        let delta = &mut chunk.choices[0].delta;
                        if is_reasoning {
                            delta.set_reasoning(Some(text), key);
                        } else {
                            delta.content = Some(text);
                        }
                    }
                }
                Segment::Call(call) => {
                    let record = self.record_for(call);
                    let mut chunk = skeleton.clone();
                    chunk.choices[0].delta.tool_calls = Some(vec![record.to_delta()]);
                    chunks.push(chunk);
                    last_is_call = true;
                }
            }
        }

        if let Some(last) = chunks.last_mut() {
            last.choices[0].finish_reason = match finish_reason {
                Some(FinishReason::Stop) if self.repaired > 0 => {
                    tracing::info!(
                        "[⚙️  -> 🔧 ] finish_reason stop -> tool_calls after {} repaired call(s)",
                        self.repaired
                    );
                    Some(FinishReason::ToolCalls)
                }
                other => other,
            };
            last.usage = usage;
        }

        chunks
            .into_iter()
            .filter(|c| !is_blank(c))
            .map(DeltaEvent::from_chunk)
            .collect()
    }

    /// Releases text still held by either channel once the backend is done.
    pub fn finish(&mut self) -> Vec<DeltaEvent> {
        let reasoning = join_text(self.reasoning.finish(&self.rules));
        let content = join_text(self.content.finish(&self.rules));
        if reasoning.is_none() && content.is_none() {
            return Vec::new();
        }
        let Some(mut chunk) = self.skeleton.clone() else {
            return Vec::new();
        };
        chunk.choices[0].delta.set_reasoning(reasoning, self.reasoning_key);
        chunk.choices[0].delta.content = content;
        vec![DeltaEvent::from_chunk(chunk)]
    }

    fn record_for(&mut self, call: LeakedCall) -> ToolCallRecord {
        let index = self.next_index;
        self.next_index += 1;
        self.synthetic.insert(index);
        self.repaired += 1;

        let record = ToolCallRecord {
            index,
            id: ToolCallId::new(),
            name: call.name,
            arguments: call.arguments,
        };
        tracing::info!(
            "[⚙️  -> 🔧 ] Repaired leaked tool call #{} {} ({} bytes of arguments)",
            record.index,
            record.name,
            record.arguments.len()
        );
        record
    }

    /// Backend tool calls keep their index unless a repaired call already took it.
    fn remap_genuine(&mut self, calls: &[ToolCallDelta]) -> Option<Vec<ToolCallDelta>> {
        let mut changed = false;
        let mut mapped = Vec::with_capacity(calls.len());
        for call in calls {
            let target = self.genuine_target(call.index);
            if target != call.index {
                changed = true;
            }
            let mut call = call.clone();
            call.index = target;
            mapped.push(call);
        }
        changed.then_some(mapped)
    }

    fn genuine_target(&mut self, index: u32) -> u32 {
        if let Some(&target) = self.genuine.get(&index) {
            return target;
        }
        let taken = self.synthetic.contains(&index) || self.genuine.values().any(|&v| v == index);
        let target = if taken { self.next_index } else { index };
        if taken {
            tracing::debug!(
                "[☁️  -> ⚙️ ] Backend tool call index {} collides with a repaired call; using {}",
                index,
                target
            );
        }
        self.next_index = self.next_index.max(target + 1);
        self.genuine.insert(index, target);
        target
    }
}

fn passes_through(input: &Option<String>, output: &[Segment]) -> bool {
    match (input.as_deref(), output) {
        (None | Some(""), []) => true,
        (Some(text), [Segment::Text(out)]) => text == out,
        _ => false,
    }
}

fn join_text(segments: Vec<Segment>) -> Option<String> {
    let mut text = String::new();
    for segment in segments {
        if let Segment::Text(t) = segment {
            text.push_str(&t);
        }
    }
    (!text.is_empty()).then_some(text)
}

/// Copy of the chunk envelope with one empty choice, used for events the
/// repairer adds.
fn skeleton_of(chunk: &ChatChunk) -> ChatChunk {
    let index = chunk.choices.first().map_or(0, |c| c.index);
    ChatChunk {
        id: chunk.id.clone(),
        object: chunk.object.clone(),
        created: chunk.created,
        model: chunk.model.clone(),
        system_fingerprint: chunk.system_fingerprint.clone(),
        choices: vec![ChunkChoice {
            index,
            ..ChunkChoice::default()
        }],
        usage: None,
        extra: chunk.extra.clone(),
    }
}

fn is_blank(chunk: &ChatChunk) -> bool {
    chunk.usage.is_none()
        && chunk.choices.len() <= 1
        && chunk
            .choices
            .first()
            .map_or(true, |c| c.delta.is_empty() && c.finish_reason.is_none())
}
