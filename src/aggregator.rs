use crate::types::{DeltaEvent, FinishReason, RequestId, Usage};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedToolCall {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// One streamed response folded into a single message. Only ever logged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedMessage {
    pub response_id: Option<String>,
    pub model: Option<String>,
    pub system_fingerprint: Option<String>,
    pub created: Option<i64>,
    pub role: Option<String>,
    pub content: String,
    pub reasoning_content: String,
    pub tool_calls: BTreeMap<u32, AggregatedToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    /// Payloads of frames that could not be decoded, in arrival order.
    pub opaque_frames: Vec<String>,
    pub event_count: usize,
}

impl AggregatedMessage {
    /// Renders the message in the non-streaming `chat.completion` shape.
    pub fn to_completion_json(&self, request_id: &RequestId) -> Value {
        let tool_calls: Vec<Value> = self
            .tool_calls
            .iter()
            .map(|(index, call)| {
                serde_json::json!({
                    "index": index,
                    "id": call.id,
                    "type": call.kind.as_deref().unwrap_or("function"),
                    "function": { "name": call.name, "arguments": call.arguments },
                })
            })
            .collect();

        let content = match self.content.as_str() {
            "" => Value::Null,
            text => Value::from(text),
        };
        let mut message = serde_json::json!({
            "role": self.role.as_deref().unwrap_or("assistant"),
            "content": content,
        });
        if !self.reasoning_content.is_empty() {
            message["reasoning_content"] = Value::from(self.reasoning_content.clone());
        }
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::from(tool_calls);
        }

        serde_json::json!({
            "id": self.response_id.clone().unwrap_or_else(|| format!("chatcmpl-{}", request_id.short())),
            "object": "chat.completion",
            "created": self.created.unwrap_or_else(|| chrono::Utc::now().timestamp()),
            "model": self.model,
            "system_fingerprint": self.system_fingerprint,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": self.finish_reason.clone().map(String::from),
            }],
            "usage": self.usage,
        })
    }
}

#[derive(Debug, Default)]
pub struct ResponseAggregator {
    message: AggregatedMessage,
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &DeltaEvent) {
        let msg = &mut self.message;
        let chunk = event.chunk();
        msg.event_count += 1;

        if msg.response_id.is_none() {
            msg.response_id = chunk.id.clone();
        }
        if chunk.model.is_some() {
            msg.model = chunk.model.clone();
        }
        if chunk.system_fingerprint.is_some() {
            msg.system_fingerprint = chunk.system_fingerprint.clone();
        }
        if msg.created.is_none() {
            msg.created = chunk.created;
        }
        if let Some(usage) = &chunk.usage {
            msg.usage = Some(usage.clone());
        }

        let Some(choice) = event.first_choice() else {
            return;
        };
        let delta = &choice.delta;
        if let Some(role) = delta.role.as_ref().filter(|r| !r.is_empty()) {
            msg.role = Some(role.clone());
        }
        if let Some(text) = &delta.content {
            msg.content.push_str(text);
        }
        if let Some(text) = delta.reasoning_text() {
            msg.reasoning_content.push_str(text);
        }
        for fragment in event.tool_calls() {
            let entry = msg.tool_calls.entry(fragment.index).or_default();
            if let Some(id) = fragment.id.as_ref().filter(|id| !id.is_empty()) {
                if entry.id.is_none() {
                    entry.id = Some(id.clone());
                }
            }
            if fragment.kind.is_some() {
                entry.kind = fragment.kind.clone();
            }
            if let Some(function) = &fragment.function {
                if let Some(name) = &function.name {
                    entry.name.push_str(name);
                }
                if let Some(arguments) = &function.arguments {
                    entry.arguments.push_str(arguments);
                }
            }
        }
        if let Some(reason) = &choice.finish_reason {
            msg.finish_reason = Some(reason.clone());
        }
    }

    pub fn observe_opaque(&mut self, payload: &str) {
        self.message.opaque_frames.push(payload.to_string());
    }

    pub fn finalize(self) -> AggregatedMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(v: Value) -> DeltaEvent {
        DeltaEvent::parse(&v.to_string()).unwrap()
    }

    fn sample() -> Vec<DeltaEvent> {
        vec![
            ev(json!({"id": "r1", "model": "m", "created": 7, "choices": [{"index": 0, "delta": {"role": "assistant", "reasoning_content": "think "}}]})),
            ev(json!({"id": "r1", "choices": [{"index": 0, "delta": {"reasoning_content": "more", "content": "Hi"}}]})),
            ev(json!({"id": "r1", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function", "function": {"name": "read_", "arguments": "{\"pa"}}]}}]})),
            ev(json!({"id": "r1", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"name": "file", "arguments": "th\":1}"}}]}}]})),
            ev(json!({"id": "r1", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 1, "id": "call_2", "function": {"name": "ls", "arguments": "{}"}}]}}]})),
            ev(json!({"id": "r1", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})),
            ev(json!({"id": "r1", "choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 9, "total_tokens": 14}})),
        ]
    }

    fn fold(events: &[DeltaEvent]) -> AggregatedMessage {
        let mut agg = ResponseAggregator::new();
        for e in events {
            agg.observe(e);
        }
        agg.finalize()
    }

    #[test]
    fn test_merge_rules() {
        let msg = fold(&sample());
        assert_eq!(msg.role.as_deref(), Some("assistant"));
        assert_eq!(msg.reasoning_content, "think more");
        assert_eq!(msg.content, "Hi");
        assert_eq!(msg.tool_calls.len(), 2);
        let first = &msg.tool_calls[&0];
        assert_eq!(first.id.as_deref(), Some("call_1"));
        assert_eq!(first.name, "read_file");
        assert_eq!(first.arguments, "{\"path\":1}");
        assert_eq!(msg.tool_calls[&1].name, "ls");
        assert_eq!(msg.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(msg.usage.as_ref().map(|u| u.total_tokens), Some(14));
        assert_eq!(msg.event_count, 7);
    }

    #[test]
    fn test_reasoning_key_is_accumulated() {
        let events = vec![
            ev(json!({"choices": [{"index": 0, "delta": {"reasoning": "step one, "}}]})),
            ev(json!({"choices": [{"index": 0, "delta": {"reasoning": "step two"}}]})),
        ];
        assert_eq!(fold(&events).reasoning_content, "step one, step two");
    }

    #[test]
    fn test_two_instances_agree() {
        let events = sample();
        assert_eq!(fold(&events), fold(&events));
    }

    #[test]
    fn test_last_finish_reason_wins() {
        let events = vec![
            ev(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "length"}]})),
            ev(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": null}]})),
            ev(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})),
        ];
        assert_eq!(fold(&events).finish_reason, Some(FinishReason::Stop));
        assert_eq!(fold(&events[..2]).finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_completion_json_shape() {
        let msg = fold(&sample());
        let rid = RequestId("abcdef0123".into());
        let body = msg.to_completion_json(&rid);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["id"], "r1");
        assert_eq!(body["created"], 7);
        assert_eq!(body["choices"][0]["message"]["content"], "Hi");
        assert_eq!(body["choices"][0]["message"]["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(body["usage"]["completion_tokens"], 9);
    }
}
