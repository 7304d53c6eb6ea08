use std::collections::HashMap;

use crate::constants;
use crate::debug_utils::TransformSink;
use crate::events;
use crate::ingress::{InboundBlock, InboundContent, InboundMessage, InboundRole, MessagesRequest, ToolDefinition};
use crate::main_helper::ProxyConfig;
use crate::specs::anthropic::{ContentBlock, MessagesResponse, Usage};
use crate::specs::openai::{
    ChatFunctionDefinition, ChatMessage, ChatRequest, ChatResponse, ChatTool,
};
use crate::thinking::{self, ThinkingConfig};
use crate::tool_calls;

/// Result of projecting a downstream request into the upstream wire format.
/// `body` is always sendable: the projected request on success, the original
/// payload untouched when projection failed.
#[derive(Debug)]
pub struct Projection {
    pub body: serde_json::Value,
    pub thinking: ThinkingConfig,
    pub stream: bool,
    pub error: Option<String>,
}

pub struct UpstreamAdapter;

impl UpstreamAdapter {
    pub fn project(
        raw: &serde_json::Value,
        request: &MessagesRequest,
        config: &ProxyConfig,
        sink: Option<&dyn TransformSink>,
    ) -> Projection {
        tracing::info!("[⚙️ ] Projecting turn for model: {}", request.model);
        let thinking = thinking::resolve(request, config.default_thinking);
        let stream = request.stream.unwrap_or(true);

        match Self::try_project(request, thinking, config) {
            Ok(body) => {
                if let Some(sink) = sink {
                    sink.capture("projected", &body);
                }
                Projection {
                    body,
                    thinking,
                    stream,
                    error: None,
                }
            }
            Err(reason) => {
                tracing::warn!(
                    "projection failed, passing request through untransformed: {}",
                    reason
                );
                Projection {
                    body: raw.clone(),
                    thinking: ThinkingConfig::disabled(),
                    stream,
                    error: Some(reason),
                }
            }
        }
    }

    fn try_project(
        request: &MessagesRequest,
        thinking: ThinkingConfig,
        config: &ProxyConfig,
    ) -> std::result::Result<serde_json::Value, String> {
        let (model, budget) = Self::map_model(&request.model, config.model_override.as_deref());
        let tools = Self::project_tools(request.tools.as_deref())?;
        let messages = Self::transform_messages(request, thinking, &config.locale);

        let chat = ChatRequest {
            model,
            messages,
            stream: request.stream,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: Some(
                request
                    .max_tokens
                    .map(|m| m.min(budget))
                    .unwrap_or(budget),
            ),
            tools,
            tool_choice: request.tool_choice.clone().map(Self::project_tool_choice),
            reasoning_effort: thinking
                .enabled
                .then(|| thinking.effort.as_str().to_string()),
            extra: HashMap::new(),
        };

        serde_json::to_value(&chat).map_err(|e| format!("serialization failed: {}", e))
    }

    /// Maps the advertised model name to the fixed upstream identifier and
    /// computes the token budget for the mapped model.
    pub fn map_model(advertised: &str, model_override: Option<&str>) -> (String, u32) {
        let lowered = advertised.to_lowercase();
        let budget = constants::MODEL_TOKEN_BUDGETS
            .iter()
            .find(|(marker, _)| lowered.contains(marker))
            .map(|(_, budget)| *budget)
            .unwrap_or(constants::DEFAULT_TOKEN_BUDGET);
        let model = model_override
            .unwrap_or(constants::DEFAULT_UPSTREAM_MODEL)
            .to_string();
        (model, budget)
    }

    fn project_tools(
        tools: Option<&[ToolDefinition]>,
    ) -> std::result::Result<Option<Vec<ChatTool>>, String> {
        let Some(tools) = tools else {
            return Ok(None);
        };
        let mut projected = Vec::with_capacity(tools.len());
        for tool in tools {
            if !tool.input_schema.is_object() {
                return Err(format!("tool '{}' has a non-object input schema", tool.name));
            }
            projected.push(ChatTool {
                r#type: "function".to_string(),
                function: ChatFunctionDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            });
        }
        Ok(if projected.is_empty() {
            None
        } else {
            Some(projected)
        })
    }

    fn project_tool_choice(raw_choice: serde_json::Value) -> serde_json::Value {
        if let Some(obj) = raw_choice.as_object() {
            if let Some(t) = obj.get("type").and_then(|v| v.as_str()) {
                if t == "auto" || t == "any" || t == "required" {
                    return serde_json::Value::String(if t == "any" {
                        "required".to_string()
                    } else {
                        t.to_string()
                    });
                }
                if t == "tool" {
                    if let Some(name) = obj.get("name") {
                        return serde_json::json!({
                            "type": "function",
                            "function": { "name": name }
                        });
                    }
                }
            }
        }
        raw_choice
    }

    fn transform_messages(
        request: &MessagesRequest,
        thinking: ThinkingConfig,
        locale: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::System {
            content: Self::system_instructions(request, thinking, locale),
        });
        for inbound in &request.messages {
            match inbound.role {
                InboundRole::User => Self::transform_user_message(inbound, &mut messages),
                InboundRole::Assistant => {
                    messages.push(Self::transform_assistant_message(inbound))
                }
            }
        }
        messages
    }

    fn transform_user_message(inbound: &InboundMessage, out: &mut Vec<ChatMessage>) {
        match &inbound.content {
            InboundContent::Text(text) => out.push(ChatMessage::User {
                content: text.clone(),
            }),
            InboundContent::Blocks(blocks) => {
                // Tool results must land before any sibling text from the
                // same downstream turn.
                for block in blocks {
                    if let InboundBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        out.push(ChatMessage::Tool {
                            content: Self::tool_result_text(content, *is_error),
                            tool_call_id: tool_use_id.clone(),
                        });
                    }
                }
                let text = blocks
                    .iter()
                    .filter_map(|block| {
                        if let InboundBlock::Text { text } = block {
                            Some(text.as_str())
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                if !text.is_empty() {
                    out.push(ChatMessage::User { content: text });
                }
            }
        }
    }

    fn tool_result_text(content: &serde_json::Value, is_error: bool) -> String {
        // Tool results arrive as a plain string or an array of text parts.
        let text = if let Some(s) = content.as_str() {
            s.to_string()
        } else if let Some(parts) = content.as_array() {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        } else if content.is_null() {
            String::new()
        } else {
            content.to_string()
        };
        if is_error {
            format!("[tool error] {}", text)
        } else {
            text
        }
    }

    fn transform_assistant_message(inbound: &InboundMessage) -> ChatMessage {
        let (text_parts, tool_calls) = match &inbound.content {
            InboundContent::Text(text) => (vec![text.clone()], Vec::new()),
            InboundContent::Blocks(blocks) => {
                let mut texts = Vec::new();
                let mut calls = Vec::new();
                for block in blocks {
                    match block {
                        InboundBlock::Text { text } => texts.push(text.clone()),
                        InboundBlock::ToolUse { id, name, input } => {
                            calls.push(crate::specs::openai::ChatToolCall {
                                id: id.clone(),
                                r#type: "function".to_string(),
                                function: crate::specs::openai::ChatFunctionCall {
                                    name: name.clone(),
                                    arguments: input.to_string(),
                                },
                            });
                        }
                        // Prior-turn reasoning is not replayed upstream.
                        InboundBlock::Thinking { .. } => {}
                        _ => {}
                    }
                }
                (texts, calls)
            }
        };

        let text = text_parts.join("\n");
        ChatMessage::Assistant {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
        }
    }

    fn system_instructions(
        request: &MessagesRequest,
        thinking: ThinkingConfig,
        locale: &str,
    ) -> String {
        let mut sections = Vec::new();
        if let Some(system) = request.system_text() {
            sections.push(system);
        }
        sections.push(format!("Always respond in the user's locale ({}).", locale));
        if thinking.enabled {
            sections.push(format!(
                "Reason carefully before answering, budgeting your reasoning at {} effort. Keep internal reasoning out of the final answer.",
                thinking.effort.as_str()
            ));
        }
        sections.join("\n\n")
    }

    /// Buffered path: one-shot projection of a complete upstream response
    /// into the downstream message shape. Recovers locally from degenerate
    /// responses instead of raising.
    pub fn project_response(response: ChatResponse, advertised_model: &str) -> MessagesResponse {
        let id = if response.id.is_empty() {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        } else {
            response.id.clone()
        };
        let usage = response.usage.as_ref().map(Usage::from).unwrap_or_default();

        let Some(choice) = response.choices.into_iter().next() else {
            return MessagesResponse {
                id,
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: advertised_model.to_string(),
                content: vec![ContentBlock::Text {
                    text: "upstream returned no choices".to_string(),
                }],
                stop_reason: Some("end_turn".to_string()),
                stop_sequence: None,
                usage,
            };
        };

        let stop_reason = events::map_stop_reason(choice.finish_reason.as_deref()).to_string();
        let reasoning = choice.message.reasoning();
        let text = choice.message.content.clone().filter(|t| !t.is_empty());
        let calls = choice.message.tool_calls.unwrap_or_default();

        let mut content = Vec::new();
        if let Some(reasoning) = reasoning {
            content.push(ContentBlock::Thinking {
                signature: events::thinking_signature(&reasoning).unwrap_or_default(),
                thinking: reasoning,
            });
        }
        if let Some(text) = text {
            content.push(ContentBlock::Text { text });
        }
        for call in calls {
            content.push(ContentBlock::ToolUse {
                input: tool_calls::parse_arguments(&call.function.name, &call.function.arguments),
                id: call.id,
                name: call.function.name,
            });
        }

        MessagesResponse {
            id,
            kind: "message".to_string(),
            role: "assistant".to_string(),
            model: advertised_model.to_string(),
            content,
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage,
        }
    }
}
