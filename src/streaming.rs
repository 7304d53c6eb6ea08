use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::constants::MAX_STREAM_LINES;
use crate::events::{self, SseEvent};
use crate::specs::anthropic::Usage;
use crate::specs::openai::{ChatChunk, ToolCallDelta};
use crate::tool_calls;
use crate::types::{
    classify_upstream_failure, parse_upstream_line, Block, BlockKind, LineEvent, RefractError,
    StreamAccumulator,
};

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Consecutive thinking blocks tolerated before the turn is cut short.
    pub loop_window: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            loop_window: crate::constants::DEFAULT_LOOP_WINDOW,
        }
    }
}

pub struct StreamHandler;

impl StreamHandler {
    /// Applies one upstream chunk to the accumulator, returning the downstream
    /// events it produced. A no-op once the accumulator is finalized.
    pub fn apply_chunk(acc: &mut StreamAccumulator, chunk: &ChatChunk) -> Vec<SseEvent> {
        if acc.finalized {
            return Vec::new();
        }

        let mut events = Vec::new();
        Self::ensure_message_start(acc, chunk, &mut events);

        if let Some(choice) = chunk.choices.first() {
            if let Some(reasoning) = choice.delta.extract_reasoning() {
                Self::apply_reasoning(acc, &reasoning, &mut events);
                if acc.finalized {
                    return events;
                }
            }
            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    Self::apply_text(acc, content, &mut events);
                    if acc.finalized {
                        return events;
                    }
                }
            }
            if let Some(tool_deltas) = &choice.delta.tool_calls {
                for delta in tool_deltas {
                    Self::apply_tool_fragment(acc, delta, &mut events);
                    if acc.finalized {
                        return events;
                    }
                }
            }
            if let Some(finish) = &choice.finish_reason {
                acc.finish_reason = Some(finish.clone());
            }
        }

        if let Some(usage) = &chunk.usage {
            acc.usage = Some(usage.clone());
        }

        // Both turn-level terminators known: the turn is complete.
        if acc.finish_reason.is_some() && acc.usage.is_some() {
            events.extend(Self::finalize(acc));
        }

        events
    }

    /// Emits the closing sequence (close open block, message_delta with the
    /// mapped stop reason and final usage, message_stop) and freezes the
    /// accumulator. Idempotent: a second call returns no events.
    pub fn finalize(acc: &mut StreamAccumulator) -> Vec<SseEvent> {
        if acc.finalized {
            return Vec::new();
        }
        let mut events = Vec::new();
        if !acc.message_started {
            // Degenerate stream that carried no payload at all; still honor
            // the one-start/one-stop contract.
            let id = format!("msg_{}", uuid::Uuid::new_v4().simple());
            acc.message_id = Some(id.clone());
            events.push(events::message_start(
                &id,
                acc.role.as_deref().unwrap_or("assistant"),
                acc.model.as_deref().unwrap_or("unknown"),
            ));
            acc.message_started = true;
        }
        Self::close_open_block(acc, &mut events);
        let usage = acc.usage.as_ref().map(Usage::from).unwrap_or_default();
        events.push(events::message_delta(
            events::map_stop_reason(acc.finish_reason.as_deref()),
            &usage,
        ));
        events.push(events::message_stop());
        acc.finalized = true;
        events
    }

    fn ensure_message_start(acc: &mut StreamAccumulator, chunk: &ChatChunk, events: &mut Vec<SseEvent>) {
        if acc.message_started {
            return;
        }
        if chunk.choices.is_empty() && chunk.usage.is_none() {
            return;
        }
        if acc.message_id.is_none() && !chunk.id.is_empty() {
            acc.message_id = Some(chunk.id.clone());
        }
        if acc.model.is_none() && !chunk.model.is_empty() {
            acc.model = Some(chunk.model.clone());
        }
        if acc.role.is_none() {
            if let Some(role) = chunk.choices.first().and_then(|c| c.delta.role.clone()) {
                acc.role = Some(role);
            }
        }
        let id = acc
            .message_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));
        acc.message_id = Some(id.clone());
        events.push(events::message_start(
            &id,
            acc.role.as_deref().unwrap_or("assistant"),
            acc.model.as_deref().unwrap_or("unknown"),
        ));
        acc.message_started = true;
    }

    fn apply_reasoning(acc: &mut StreamAccumulator, fragment: &str, events: &mut Vec<SseEvent>) {
        if !matches!(acc.block, Block::Thinking { .. }) {
            if Self::close_then_guard(acc, events) {
                return;
            }
            let index = acc.next_block_index;
            acc.next_block_index += 1;
            acc.block = Block::Thinking {
                index,
                text: String::new(),
            };
            events.push(events::thinking_block_start(index));
        }
        if let Block::Thinking { index, text } = &mut acc.block {
            text.push_str(fragment);
            events.push(events::thinking_delta(*index, fragment));
        }
    }

    fn apply_text(acc: &mut StreamAccumulator, fragment: &str, events: &mut Vec<SseEvent>) {
        if !matches!(acc.block, Block::Text { .. }) {
            if Self::close_then_guard(acc, events) {
                return;
            }
            let index = acc.next_block_index;
            acc.next_block_index += 1;
            acc.block = Block::Text {
                index,
                text: String::new(),
            };
            events.push(events::text_block_start(index));
        }
        if let Block::Text { index, text } = &mut acc.block {
            text.push_str(fragment);
            events.push(events::text_delta(*index, fragment));
        }
    }

    fn apply_tool_fragment(
        acc: &mut StreamAccumulator,
        delta: &ToolCallDelta,
        events: &mut Vec<SseEvent>,
    ) {
        let same_block = matches!(acc.block, Block::ToolUse { index } if index == delta.index);
        if !same_block && Self::close_then_guard(acc, events) {
            return;
        }
        events.extend(tool_calls::apply_fragment(acc, delta));
    }

    /// Closes the open block, then force-finalizes when the close history
    /// trips the loop guard. Returns true when finalization was forced.
    fn close_then_guard(acc: &mut StreamAccumulator, events: &mut Vec<SseEvent>) -> bool {
        Self::close_open_block(acc, events);
        if acc.thinking_run() >= acc.loop_window {
            tracing::warn!(
                "loop guard tripped after {} consecutive thinking blocks; forcing finalization",
                acc.loop_window
            );
            events.extend(Self::finalize(acc));
            return true;
        }
        false
    }

    /// Closes whatever block is open, emitting its stop event, plus the
    /// signature first for thinking blocks that accumulated any text.
    fn close_open_block(acc: &mut StreamAccumulator, events: &mut Vec<SseEvent>) {
        match std::mem::replace(&mut acc.block, Block::None) {
            Block::None => {}
            Block::Thinking { index, text } => {
                if let Some(signature) = events::thinking_signature(&text) {
                    events.push(events::signature_delta(index, &signature));
                }
                events.push(events::block_stop(index));
                acc.record_close(BlockKind::Thinking);
            }
            Block::Text { index, .. } => {
                events.push(events::block_stop(index));
                acc.record_close(BlockKind::Text);
            }
            Block::ToolUse { index } => {
                if let Some(buffer) = acc.tool_calls.get(&index) {
                    events.push(events::block_stop(buffer.block_index));
                }
                acc.record_close(BlockKind::ToolUse);
            }
        }
    }

    /// Drives one upstream SSE stream to completion, forwarding downstream
    /// events through `tx`. A send failure means the caller disconnected; the
    /// stream (and with it the upstream connection) is dropped immediately.
    pub async fn handle_stream<R>(
        mut lines_stream: FramedRead<tokio_util::io::StreamReader<R, Bytes>, LinesCodec>,
        tx: mpsc::Sender<std::result::Result<axum::response::sse::Event, RefractError>>,
        options: StreamOptions,
        model_id: String,
        request_id: String,
        start_time: std::time::Instant,
    ) where
        R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin + Send,
    {
        let mut acc = StreamAccumulator::new(options.loop_window);
        let mut metrics = crate::logging::StreamMetric::new();
        let mut line_count = 0usize;
        let mut errored = false;

        while let Some(line_result) = lines_stream.next().await {
            line_count += 1;
            if line_count > MAX_STREAM_LINES {
                tracing::error!("stream exceeded max line limit ({})", MAX_STREAM_LINES);
                let _ = tx
                    .send(Ok(events::error(
                        "api_error",
                        "stream exceeded maximum line count",
                    )
                    .into_sse()))
                    .await;
                errored = true;
                break;
            }

            let line = match line_result {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("upstream line decode error: {}", e);
                    let _ = tx
                        .send(Ok(events::error(
                            "upstream_error",
                            &format!("stream decode failure: {}", e),
                        )
                        .into_sse()))
                        .await;
                    errored = true;
                    break;
                }
            };

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                tracing::debug!("stream end marker received");
                break;
            }

            match parse_upstream_line(data) {
                LineEvent::Chunk(chunk) => {
                    metrics.record_chunk(&chunk);
                    let produced = Self::apply_chunk(&mut acc, &chunk);
                    if Self::send_events(&tx, produced).await.is_err() {
                        tracing::trace!("client disconnected, stopping stream");
                        return;
                    }
                    if acc.finalized {
                        // Loop guard or finish+usage; drop the upstream early.
                        break;
                    }
                }
                LineEvent::Error(err) => {
                    let (status, error_type) = classify_upstream_failure(&err.error.message);
                    tracing::error!(
                        "upstream stream error ({}): {}",
                        status,
                        err.error.message
                    );
                    let _ = tx
                        .send(Ok(events::error(error_type, &err.error.message).into_sse()))
                        .await;
                    errored = true;
                    break;
                }
                LineEvent::Unknown(raw) => {
                    tracing::debug!(
                        "unrecognized upstream line: {}",
                        crate::str_utils::snippet(&raw, 200)
                    );
                }
            }
        }

        // An error before the turn began replaces the turn entirely; once a
        // message has started, close it out cleanly even after an error.
        if !(errored && !acc.message_started) {
            let closing = Self::finalize(&mut acc);
            let _ = Self::send_events(&tx, closing).await;
        }

        metrics.log_summary(&model_id, &request_id, start_time.elapsed());
    }

    async fn send_events(
        tx: &mpsc::Sender<std::result::Result<axum::response::sse::Event, RefractError>>,
        events: Vec<SseEvent>,
    ) -> std::result::Result<(), ()> {
        for event in events {
            if tx.send(Ok(event.into_sse())).await.is_err() {
                return Err(());
            }
        }
        Ok(())
    }
}
