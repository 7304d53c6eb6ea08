use refract::events::SseEvent;
use refract::streaming::StreamHandler;
use refract::types::{parse_upstream_line, LineEvent, StreamAccumulator};

fn apply_line(acc: &mut StreamAccumulator, line: &str) -> Vec<SseEvent> {
    match parse_upstream_line(line) {
        LineEvent::Chunk(chunk) => StreamHandler::apply_chunk(acc, &chunk),
        other => panic!("fixture line did not parse as a chunk: {:?}", other),
    }
}

fn names(events: &[SseEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name).collect()
}

#[test]
fn interleaved_turn_produces_a_complete_event_sequence() {
    let mut acc = StreamAccumulator::new(3);
    let mut all = Vec::new();

    // thinking -> text -> tool call, then finish and usage.
    all.extend(apply_line(
        &mut acc,
        r#"{"id":"chatcmpl-1","model":"up-1","choices":[{"delta":{"role":"assistant","reasoning_content":"I should list files"}}]}"#,
    ));
    all.extend(apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"content":"Listing now."}}]}"#,
    ));
    all.extend(apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"tool_calls":[{"index":0,"id":"toolu_1","function":{"name":"ls","arguments":"{\"path\":"}}]}}]}"#,
    ));
    all.extend(apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"tool_calls":[{"index":0,"function":{"arguments":"\".\"}"}}]}}]}"#,
    ));
    all.extend(apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":20,"completion_tokens":9,"total_tokens":29}}"#,
    ));

    let sequence = names(&all);
    assert_eq!(
        sequence,
        vec![
            "message_start",
            "content_block_start",  // thinking (index 0)
            "content_block_delta",  // thinking_delta
            "content_block_delta",  // signature_delta
            "content_block_stop",
            "content_block_start",  // text (index 1)
            "content_block_delta",  // text_delta
            "content_block_stop",
            "content_block_start",  // tool_use (index 2)
            "content_block_delta",  // input_json_delta
            "content_block_delta",  // input_json_delta
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    // Exactly one start and one delta/stop pair across the whole turn.
    assert_eq!(sequence.iter().filter(|n| **n == "message_start").count(), 1);
    assert_eq!(sequence.iter().filter(|n| **n == "message_delta").count(), 1);
    assert_eq!(sequence.iter().filter(|n| **n == "message_stop").count(), 1);

    // Block indices ascend.
    assert_eq!(all[1].data["index"], 0);
    assert_eq!(all[5].data["index"], 1);
    assert_eq!(all[8].data["index"], 2);

    // Tool-call fragments went through verbatim and reassemble.
    assert_eq!(all[9].data["delta"]["partial_json"], "{\"path\":");
    assert_eq!(all[10].data["delta"]["partial_json"], "\".\"}");
    assert_eq!(acc.tool_calls[&0].arguments, "{\"path\":\".\"}");

    // Final message_delta carries the mapped stop reason and usage.
    let delta = &all[sequence.len() - 2];
    assert_eq!(delta.data["delta"]["stop_reason"], "tool_use");
    assert_eq!(delta.data["usage"]["input_tokens"], 20);
    assert_eq!(delta.data["usage"]["output_tokens"], 9);
}

#[test]
fn second_finalize_returns_no_events() {
    let mut acc = StreamAccumulator::new(3);
    apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":"assistant","content":"hello"}}]}"#,
    );
    assert!(!StreamHandler::finalize(&mut acc).is_empty());
    assert!(StreamHandler::finalize(&mut acc).is_empty());
}

#[test]
fn loop_guard_bounds_unproductive_reasoning() {
    let mut acc = StreamAccumulator::new(3);

    for _ in 0..2 {
        apply_line(
            &mut acc,
            r#"{"choices":[{"delta":{"role":null,"reasoning_content":"round"}}]}"#,
        );
        apply_line(
            &mut acc,
            r#"{"choices":[{"delta":{"role":null,"content":"..."}}]}"#,
        );
    }
    apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"reasoning_content":"round"}}]}"#,
    );
    assert!(!acc.finalized);

    // The third thinking close trips the guard with no finish_reason or
    // usage ever received.
    let tripped = apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"content":"never shown"}}]}"#,
    );
    assert!(acc.finalized);
    let tripped_names = names(&tripped);
    assert!(tripped_names.ends_with(&["message_delta", "message_stop"]));
    assert!(!tripped_names.contains(&"content_block_start"));
}

#[test]
fn loop_window_is_configurable() {
    let mut acc = StreamAccumulator::new(2);
    apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"reasoning_content":"a"}}]}"#,
    );
    apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"content":"t"}}]}"#,
    );
    apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"reasoning_content":"b"}}]}"#,
    );
    apply_line(
        &mut acc,
        r#"{"choices":[{"delta":{"role":null,"content":"t"}}]}"#,
    );
    assert!(acc.finalized);
}
