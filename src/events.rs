use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::specs::anthropic::Usage;

/// One downstream protocol event, named per the Messages streaming wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub name: &'static str,
    pub data: Value,
}

impl SseEvent {
    pub fn into_sse(self) -> axum::response::sse::Event {
        axum::response::sse::Event::default()
            .event(self.name)
            .data(self.data.to_string())
    }
}

pub fn message_start(message_id: &str, role: &str, model: &str) -> SseEvent {
    SseEvent {
        name: "message_start",
        data: json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": role,
                "model": model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": { "input_tokens": 0, "output_tokens": 0 },
            }
        }),
    }
}

pub fn thinking_block_start(index: u32) -> SseEvent {
    SseEvent {
        name: "content_block_start",
        data: json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "thinking", "thinking": "", "signature": "" }
        }),
    }
}

pub fn text_block_start(index: u32) -> SseEvent {
    SseEvent {
        name: "content_block_start",
        data: json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "text", "text": "" }
        }),
    }
}

pub fn tool_block_start(index: u32, id: &str, name: &str) -> SseEvent {
    SseEvent {
        name: "content_block_start",
        data: json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} }
        }),
    }
}

pub fn thinking_delta(index: u32, fragment: &str) -> SseEvent {
    SseEvent {
        name: "content_block_delta",
        data: json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "thinking_delta", "thinking": fragment }
        }),
    }
}

pub fn text_delta(index: u32, fragment: &str) -> SseEvent {
    SseEvent {
        name: "content_block_delta",
        data: json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "text_delta", "text": fragment }
        }),
    }
}

pub fn signature_delta(index: u32, signature: &str) -> SseEvent {
    SseEvent {
        name: "content_block_delta",
        data: json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "signature_delta", "signature": signature }
        }),
    }
}

pub fn input_json_delta(index: u32, partial_json: &str) -> SseEvent {
    SseEvent {
        name: "content_block_delta",
        data: json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "input_json_delta", "partial_json": partial_json }
        }),
    }
}

pub fn block_stop(index: u32) -> SseEvent {
    SseEvent {
        name: "content_block_stop",
        data: json!({ "type": "content_block_stop", "index": index }),
    }
}

pub fn message_delta(stop_reason: &str, usage: &Usage) -> SseEvent {
    SseEvent {
        name: "message_delta",
        data: json!({
            "type": "message_delta",
            "delta": { "stop_reason": stop_reason, "stop_sequence": null },
            "usage": { "input_tokens": usage.input_tokens, "output_tokens": usage.output_tokens }
        }),
    }
}

pub fn message_stop() -> SseEvent {
    SseEvent {
        name: "message_stop",
        data: json!({ "type": "message_stop" }),
    }
}

/// Protocol-level error surfaced on an already-open stream, where the HTTP
/// status can no longer be changed.
pub fn error(error_type: &str, message: &str) -> SseEvent {
    SseEvent {
        name: "error",
        data: json!({
            "type": "error",
            "error": { "type": error_type, "message": message }
        }),
    }
}

pub fn map_stop_reason(finish: Option<&str>) -> &'static str {
    match finish {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        Some("content_filter") => "stop_sequence",
        _ => "end_turn",
    }
}

/// Derives the integrity stamp for a completed thinking block: a truncated
/// hash of the text, its length, and a generation timestamp. Returns None
/// when no text accumulated, which happens when a close is requested before
/// any fragment arrived.
pub fn thinking_signature(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    Some(format!(
        "{}-{}-{}",
        hex,
        text.len(),
        chrono::Utc::now().timestamp_millis()
    ))
}
