/// Hard cap on inbound request bodies. Larger payloads are rejected before
/// any JSON parsing happens.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound on SSE lines accepted from one upstream stream.
pub const MAX_STREAM_LINES: usize = 100_000;

/// Maximum size of a single upstream SSE line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Consecutive thinking blocks tolerated (without an intervening tool_use)
/// before a stream is force-finalized.
pub const DEFAULT_LOOP_WINDOW: usize = 3;

/// Upstream model used when UPSTREAM_MODEL is not set in the environment.
pub const DEFAULT_UPSTREAM_MODEL: &str = "deepseek-reasoner";

/// Output token budgets keyed on substrings of the advertised model name.
pub const MODEL_TOKEN_BUDGETS: &[(&str, u32)] = &[
    ("opus", 32_768),
    ("sonnet", 16_384),
    ("haiku", 8_192),
];

/// Budget applied when the advertised model matches no table entry.
pub const DEFAULT_TOKEN_BUDGET: u32 = 16_384;

/// Path fragments marking the upstream endpoint as OpenAI-compatible; the
/// credential gets a `Bearer ` prefix for these, and is sent as-is otherwise.
pub const OPENAI_COMPAT_PATH_MARKERS: &[&str] = &["chat/completions", "/v1/", "/paas/"];

/// Locale injected into system instructions when PROXY_LOCALE is unset.
pub const DEFAULT_LOCALE: &str = "en-US";
