use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const TURN_ID_HEADER: &str = "x-refract-turn-id";

/// Sets up a global panic hook that logs panics through tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Attaches a fresh turn id to every request and wraps it in a span so all
/// logs for one turn correlate.
pub async fn turn_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let turn_id = Uuid::new_v4().to_string();
    if let Ok(val) = turn_id.parse() {
        req.headers_mut().insert(TURN_ID_HEADER, val);
    }

    let span = info_span!("request", turn_id = %turn_id);
    next.run(req).instrument(span).await
}

pub fn log_request_summary(request: &crate::ingress::MessagesRequest) {
    info!(
        target: "traffic",
        "[REQ] Model: {} | Messages: {} | Tools: {} | Stream: {}",
        request.model,
        request.messages.len(),
        request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
        request.stream.unwrap_or(true),
    );
}

/// Per-stream counters, logged once when the stream finishes.
#[derive(Default)]
pub struct StreamMetric {
    pub chunks: usize,
    pub text_chars: usize,
    pub thought_chars: usize,
    pub tool_parts: usize,
    pub tool_names: Vec<String>,
    pub tokens: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, chunk: &crate::specs::openai::ChatChunk) {
        self.chunks += 1;
        if let Some(usage) = &chunk.usage {
            self.tokens = usage.total_tokens as usize;
        }
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.text_chars += content.len();
            }
            if let Some(reasoning) = choice.delta.extract_reasoning() {
                self.thought_chars += reasoning.len();
            }
            if let Some(tools) = &choice.delta.tool_calls {
                self.tool_parts += tools.len();
                for tool in tools {
                    if let Some(name) = tool.function.as_ref().and_then(|f| f.name.as_deref()) {
                        if !name.is_empty() {
                            self.tool_names.push(name.to_string());
                        }
                    }
                }
            }
        }
    }

    pub fn log_summary(&self, model: &str, request_id: &str, latency: std::time::Duration) {
        let tools_str = if self.tool_names.is_empty() {
            format!("{}", self.tool_parts)
        } else {
            format!("{} ({})", self.tool_parts, self.tool_names.join(", "))
        };

        info!(
            target: "traffic",
            "[STREAM END] Model: {} | Request: {} | Latency: {:?} | Chunks: {} | Text: {} chars | Thought: {} chars | Tools: {} | Tokens: {}",
            model,
            crate::str_utils::prefix_chars(request_id, 8),
            latency,
            self.chunks,
            self.text_chars,
            self.thought_chars,
            tools_str,
            self.tokens,
        );
    }
}
