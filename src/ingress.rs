use serde::{Deserialize, Serialize};

use crate::types::{RefractError, Result};

/// --- DOWNSTREAM (MESSAGES PROTOCOL) REQUEST SCHEMA ---

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub thinking: Option<ThinkingParam>,
    #[serde(default, flatten)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InboundRole {
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    pub role: InboundRole,
    pub content: InboundContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Blocks(Vec<InboundBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingMode {
    Enabled,
    Disabled,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThinkingParam {
    #[serde(rename = "type")]
    pub mode: ThinkingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

impl MessagesRequest {
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(RefractError::InvalidIngress(
                "Request must contain at least one message".into(),
            )
            .into());
        }

        for (i, message) in self.messages.iter().enumerate() {
            if let InboundContent::Blocks(blocks) = &message.content {
                for block in blocks {
                    if let InboundBlock::ToolResult { tool_use_id, .. } = block {
                        if tool_use_id.is_empty() {
                            return Err(RefractError::InvalidIngress(format!(
                                "Message at index {} has a tool_result with an empty tool_use_id",
                                i
                            ))
                            .into());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Concatenated text of the most recent user message; the thinking
    /// resolver scans this for control tags and trigger keywords.
    pub fn latest_user_text(&self) -> Option<String> {
        let message = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == InboundRole::User)?;

        let text = match &message.content {
            InboundContent::Text(text) => text.clone(),
            InboundContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| {
                    if let InboundBlock::Text { text } = block {
                        Some(text.as_str())
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };

        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn system_text(&self) -> Option<String> {
        match self.system.as_ref()? {
            SystemPrompt::Text(text) => Some(text.clone()),
            SystemPrompt::Blocks(blocks) => {
                let joined = blocks
                    .iter()
                    .map(|block| block.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                if joined.is_empty() {
                    None
                } else {
                    Some(joined)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(json).expect("request fixture")
    }

    #[test]
    fn parses_structured_content_blocks() {
        let req = request(serde_json::json!({
            "model": "sonnet-4",
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "42"},
                    {"type": "text", "text": "what now?"}
                ]}
            ]
        }));
        assert!(req.validate().is_ok());
        assert_eq!(req.latest_user_text().as_deref(), Some("what now?"));
    }

    #[test]
    fn rejects_empty_message_list() {
        let req = request(serde_json::json!({"model": "m", "messages": []}));
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_tool_result_without_id() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "", "content": "x"}
                ]}
            ]
        }));
        assert!(req.validate().is_err());
    }

    #[test]
    fn latest_user_text_skips_assistant_turns() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"}
            ]
        }));
        assert_eq!(req.latest_user_text().as_deref(), Some("second"));
    }

    #[test]
    fn system_blocks_join_to_text() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "system": [
                {"type": "text", "text": "part one"},
                {"type": "text", "text": "part two"}
            ]
        }));
        assert_eq!(req.system_text().as_deref(), Some("part one\n\npart two"));
    }

    #[test]
    fn unknown_block_types_do_not_fail_parsing() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "server_tool_use", "weird": true},
                    {"type": "text", "text": "hello"}
                ]}
            ]
        }));
        assert!(req.validate().is_ok());
    }
}
