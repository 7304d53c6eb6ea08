use std::sync::Arc;

use clap::Parser;

use crate::constants;
use crate::thinking::{Effort, ThinkingConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// 0 asks the OS for a free port; the assignment is printed as
    /// PROXY_READY:<port> once the listener is bound.
    #[arg(long, default_value_t = 0)]
    pub port: u16,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = constants::MAX_BODY_BYTES)]
    pub max_body_size: usize,
    /// Consecutive thinking blocks tolerated before a stream is cut short.
    #[arg(long, default_value_t = constants::DEFAULT_LOOP_WINDOW)]
    pub loop_window: usize,
    /// Ask the model to reason even when the request carries no signal.
    #[arg(long, default_value_t = false)]
    pub thinking_default: bool,
    #[arg(long, default_value = "medium")]
    pub effort_default: String,
    #[arg(long, default_value_t = false)]
    pub enable_debug_capture: bool,
}

/// Process-wide upstream contract, read once from the environment at
/// construction and read-only afterwards.
pub struct ProxyConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model_override: Option<String>,
    pub locale: String,
    pub default_thinking: ThinkingConfig,
}

impl ProxyConfig {
    /// The launcher supplies UPSTREAM_BASE_URL and UPSTREAM_API_KEY;
    /// UPSTREAM_MODEL and PROXY_LOCALE are optional.
    pub fn from_env(args: &Args) -> std::result::Result<Self, String> {
        let base_url = std::env::var("UPSTREAM_BASE_URL")
            .map_err(|_| "UPSTREAM_BASE_URL environment variable is missing".to_string())?;
        let api_key = std::env::var("UPSTREAM_API_KEY")
            .map_err(|_| "UPSTREAM_API_KEY environment variable is missing".to_string())?;
        if api_key.is_empty() {
            return Err("UPSTREAM_API_KEY is empty".to_string());
        }

        let effort = Effort::from_name(&args.effort_default).unwrap_or(Effort::Medium);

        Ok(Self {
            endpoint: chat_endpoint(&base_url),
            api_key,
            model_override: std::env::var("UPSTREAM_MODEL")
                .ok()
                .filter(|m| !m.is_empty()),
            locale: std::env::var("PROXY_LOCALE")
                .ok()
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| constants::DEFAULT_LOCALE.to_string()),
            default_thinking: ThinkingConfig {
                enabled: args.thinking_default,
                effort,
            },
        })
    }

    /// `Bearer `-prefixes the credential when the endpoint path looks
    /// OpenAI-compatible; otherwise the credential is sent as-is.
    pub fn authorization_value(&self) -> String {
        let openai_like = constants::OPENAI_COMPAT_PATH_MARKERS
            .iter()
            .any(|marker| self.endpoint.contains(marker));
        if openai_like && !self.api_key.starts_with("Bearer ") {
            format!("Bearer {}", self.api_key)
        } else {
            self.api_key.clone()
        }
    }
}

/// Appends the chat-completions path unless the base URL already names it.
pub fn chat_endpoint(base_url: &str) -> String {
    if base_url.contains("chat/completions") {
        base_url.to_string()
    } else {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub config: Arc<ProxyConfig>,
    pub args: Arc<Args>,
    pub sink: Option<Arc<dyn crate::debug_utils::TransformSink>>,
}
