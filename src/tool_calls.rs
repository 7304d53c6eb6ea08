use serde_json::{json, Value};

use crate::events::{self, SseEvent};
use crate::specs::openai::ToolCallDelta;
use crate::types::{Block, StreamAccumulator, ToolCallBuffer};

/// Applies one upstream tool-call fragment to the accumulator. The caller has
/// already closed any non-matching open block; this opens the tool_use block
/// on first sight of an index and forwards argument fragments verbatim,
/// without attempting to parse incomplete JSON.
pub fn apply_fragment(acc: &mut StreamAccumulator, delta: &ToolCallDelta) -> Vec<SseEvent> {
    let mut events = Vec::new();

    if !acc.tool_calls.contains_key(&delta.index) {
        let block_index = acc.next_block_index;
        acc.next_block_index += 1;
        let buffer = ToolCallBuffer {
            // Some upstreams omit the id on follow-up chunks and a few omit
            // it entirely; a synthetic per-index id keeps deltas associated.
            id: delta
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", delta.index)),
            name: delta
                .function
                .as_ref()
                .and_then(|f| f.name.clone())
                .unwrap_or_default(),
            arguments: String::new(),
            block_index,
        };
        events.push(events::tool_block_start(
            block_index,
            &buffer.id,
            &buffer.name,
        ));
        acc.tool_calls.insert(delta.index, buffer);
    }
    acc.block = Block::ToolUse { index: delta.index };

    if let Some(buffer) = acc.tool_calls.get_mut(&delta.index) {
        if let Some(id) = &delta.id {
            if buffer.id != *id && buffer.id.starts_with("call_") {
                buffer.id = id.clone();
            }
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                if buffer.name.is_empty() {
                    buffer.name = name.clone();
                }
            }
            if let Some(arguments) = &function.arguments {
                if !arguments.is_empty() {
                    buffer.arguments.push_str(arguments);
                    events.push(events::input_json_delta(buffer.block_index, arguments));
                }
            }
        }
    }

    events
}

/// Buffered path: a tool call's arguments are parsed once, eagerly. Malformed
/// JSON yields a synthetic input carrying the parse error and the raw text
/// rather than raising.
pub fn parse_arguments(name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("tool call '{}' has unparseable arguments: {}", name, e);
            json!({
                "error": format!("invalid tool arguments: {}", e),
                "raw": raw,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::openai::FunctionFragment;

    fn delta(index: u32, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(str::to_string),
            function: Some(FunctionFragment {
                name: name.map(str::to_string),
                arguments: args.map(str::to_string),
            }),
        }
    }

    #[test]
    fn first_fragment_opens_block_and_forwards_arguments() {
        let mut acc = StreamAccumulator::new(3);
        let events = apply_fragment(
            &mut acc,
            &delta(0, Some("toolu_1"), Some("read_file"), Some("{\"pa")),
        );
        let names: Vec<_> = events.iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["content_block_start", "content_block_delta"]);
        assert_eq!(events[0].data["content_block"]["name"], "read_file");
        // Partial JSON goes through verbatim.
        assert_eq!(events[1].data["delta"]["partial_json"], "{\"pa");
    }

    #[test]
    fn follow_up_fragments_only_emit_deltas() {
        let mut acc = StreamAccumulator::new(3);
        apply_fragment(&mut acc, &delta(0, Some("toolu_1"), Some("grep"), None));
        let events = apply_fragment(&mut acc, &delta(0, None, None, Some("th\":1}")));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "content_block_delta");
        assert_eq!(acc.tool_calls[&0].arguments, "th\":1}");
    }

    #[test]
    fn synthetic_id_is_replaced_when_real_one_arrives() {
        let mut acc = StreamAccumulator::new(3);
        apply_fragment(&mut acc, &delta(1, None, Some("grep"), None));
        assert_eq!(acc.tool_calls[&1].id, "call_1");
        apply_fragment(&mut acc, &delta(1, Some("toolu_real"), None, None));
        assert_eq!(acc.tool_calls[&1].id, "toolu_real");
    }

    #[test]
    fn eager_parse_falls_back_to_error_marker() {
        let parsed = parse_arguments("grep", "{\"pattern\": unterminated");
        assert!(parsed["error"]
            .as_str()
            .expect("error marker")
            .contains("invalid tool arguments"));
        assert_eq!(parsed["raw"], "{\"pattern\": unterminated");
    }

    #[test]
    fn eager_parse_accepts_valid_and_empty_arguments() {
        assert_eq!(
            parse_arguments("grep", "{\"pattern\":\"x\"}"),
            json!({"pattern": "x"})
        );
        assert_eq!(parse_arguments("list", "  "), json!({}));
    }
}
