use std::collections::{HashMap, VecDeque};

use serde::Deserialize;
use thiserror::Error;
use tracing_error::SpanTrace;

use crate::specs::openai::{ChatChunk, UpstreamUsage};

#[derive(Error, Debug)]
pub enum RefractError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid ingress payload: {0}")]
    InvalidIngress(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RefractError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RefractError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, error_type, message) = match &self.inner {
            RefractError::InvalidIngress(m) | RefractError::Protocol(m) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", m.clone())
            }
            RefractError::Upstream(status, m) => (*status, error_type_for_status(*status), m.clone()),
            RefractError::Network(e) => {
                let status = if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, error_type_for_status(status), e.to_string())
            }
            RefractError::Serialization(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error", e.to_string())
            }
            RefractError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", e.to_string()),
            RefractError::Internal(m, _) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error", m.clone())
            }
        };

        (
            status,
            axum::Json(serde_json::json!({
                "type": "error",
                "error": { "type": error_type, "message": message },
            })),
        )
            .into_response()
    }
}

/// Machine-readable error type for a downstream status, in the Messages
/// protocol vocabulary.
pub fn error_type_for_status(status: axum::http::StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        413 => "request_too_large",
        429 => "rate_limit_error",
        502 | 503 => "upstream_error",
        504 => "timeout_error",
        _ => "api_error",
    }
}

/// Classifies an upstream failure from its text into a downstream status and
/// error type. Checked in taxonomy order; the first match wins.
pub fn classify_upstream_failure(text: &str) -> (axum::http::StatusCode, &'static str) {
    use axum::http::StatusCode;

    let lowered = text.to_lowercase();
    if lowered.contains("401")
        || lowered.contains("unauthorized")
        || lowered.contains("invalid api key")
        || lowered.contains("authentication")
    {
        (StatusCode::UNAUTHORIZED, "authentication_error")
    } else if lowered.contains("403") || lowered.contains("forbidden") || lowered.contains("permission")
    {
        (StatusCode::FORBIDDEN, "permission_error")
    } else if lowered.contains("429")
        || lowered.contains("rate limit")
        || lowered.contains("too many requests")
        || lowered.contains("quota")
    {
        (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error")
    } else if lowered.contains("504")
        || lowered.contains("408")
        || lowered.contains("timeout")
        || lowered.contains("timed out")
        || lowered.contains("deadline")
    {
        (StatusCode::GATEWAY_TIMEOUT, "timeout_error")
    } else if lowered.contains("502")
        || lowered.contains("503")
        || lowered.contains("connection refused")
        || lowered.contains("connect error")
        || lowered.contains("could not resolve")
        || lowered.contains("dns error")
        || lowered.contains("unreachable")
    {
        (StatusCode::BAD_GATEWAY, "upstream_error")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "api_error")
    }
}

/// --- STREAMING ACCUMULATOR ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Thinking,
    Text,
    ToolUse,
}

/// The one block currently open on the downstream side. Exactly one block is
/// open at a time; opening a new one requires closing the previous first, so
/// the illegal two-open-blocks state is unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    None,
    Thinking { index: u32, text: String },
    Text { index: u32, text: String },
    /// Keyed by the UPSTREAM positional tool-call index; the downstream block
    /// index lives in the matching `ToolCallBuffer`.
    ToolUse { index: u32 },
}

#[derive(Debug, Clone)]
pub struct ToolCallBuffer {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub block_index: u32,
}

/// Per-turn mutable state for one streaming exchange. Owned exclusively by
/// the stream parser for that turn and discarded after finalization; never
/// shared across turns or connections.
#[derive(Debug)]
pub struct StreamAccumulator {
    pub message_id: Option<String>,
    pub role: Option<String>,
    pub model: Option<String>,
    pub block: Block,
    pub next_block_index: u32,
    pub tool_calls: HashMap<u32, ToolCallBuffer>,
    pub usage: Option<UpstreamUsage>,
    pub finish_reason: Option<String>,
    pub message_started: bool,
    pub finalized: bool,
    /// Close-order history of block kinds, bounded, used for loop detection.
    pub recent_blocks: VecDeque<BlockKind>,
    pub loop_window: usize,
}

impl StreamAccumulator {
    pub fn new(loop_window: usize) -> Self {
        Self {
            message_id: None,
            role: None,
            model: None,
            block: Block::None,
            next_block_index: 0,
            tool_calls: HashMap::new(),
            usage: None,
            finish_reason: None,
            message_started: false,
            finalized: false,
            recent_blocks: VecDeque::new(),
            loop_window: loop_window.max(1),
        }
    }

    pub fn record_close(&mut self, kind: BlockKind) {
        let cap = self.loop_window * 4;
        if self.recent_blocks.len() == cap {
            self.recent_blocks.pop_front();
        }
        self.recent_blocks.push_back(kind);
    }

    /// Thinking blocks closed since the last tool_use close, within the
    /// bounded history. Text closes do not reset the run.
    pub fn thinking_run(&self) -> usize {
        self.recent_blocks
            .iter()
            .rev()
            .take_while(|kind| **kind != BlockKind::ToolUse)
            .filter(|kind| **kind == BlockKind::Thinking)
            .count()
    }
}

/// --- UPSTREAM WIRE LINE PARSING ---

#[derive(Debug)]
pub enum LineEvent {
    Chunk(ChatChunk),
    Error(UpstreamErrorLine),
    Unknown(String),
}

#[derive(Debug, Deserialize)]
pub struct UpstreamErrorLine {
    pub error: UpstreamErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamErrorDetail {
    pub message: String,
    pub code: Option<u16>,

    /// Catch-all for extra provider fields like `param` or `type`.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn parse_upstream_line(data: &str) -> LineEvent {
    if data.len() > crate::constants::MAX_BODY_BYTES {
        return LineEvent::Error(UpstreamErrorLine {
            error: UpstreamErrorDetail {
                message: format!("JSON chunk too large: {} bytes", data.len()),
                code: Some(413),
                extra: serde_json::Map::new(),
            },
        });
    }
    // Try Error first as it's more specific (requires an "error" key).
    if let Ok(err) = serde_json::from_str::<UpstreamErrorLine>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(chunk) = serde_json::from_str::<ChatChunk>(data) {
        // A chunk should have choices or usage to count as one.
        if !chunk.choices.is_empty() || chunk.usage.is_some() {
            return LineEvent::Chunk(chunk);
        }
    }
    tracing::debug!(
        "[STREAM] Unknown line format: {}",
        crate::str_utils::snippet(data, 200)
    );
    LineEvent::Unknown(data.to_string())
}
