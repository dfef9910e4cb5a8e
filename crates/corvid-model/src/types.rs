// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Tool-result content parts ────────────────────────────────────────────────

/// Content returned by a tool: either a plain string or structured parts.
///
/// The `Parts` variant allows a tool to return text and image blocks together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<ToolContentPart>),
}

impl ToolResultContent {
    /// Lossy conversion to plain text (images are omitted).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Parts(_) => None,
        }
    }

    /// Collect all image URLs embedded in this content.
    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            Self::Text(_) => vec![],
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ToolContentPart::Image { image_url } => Some(image_url.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

impl From<String> for ToolResultContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResultContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl std::fmt::Display for ToolResultContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(t) => write!(f, "{t}"),
            Self::Parts(parts) => {
                let text = parts
                    .iter()
                    .filter_map(|p| match p {
                        ToolContentPart::Text { text } => Some(text.as_str()),
                        ToolContentPart::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                write!(f, "{text}")
            }
        }
    }
}

/// A single content part inside a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContentPart {
    Text { text: String },
    Image { image_url: String },
}

/// Parse a data URL of the form `data:<mime>;base64,<b64>`.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

// ─── Message parts ─────────────────────────────────────────────────────────────

/// A single ordered part of a message's content payload.
///
/// A message's content is an ordered list of typed parts: plain text,
/// reasoning (thinking) segments, tool calls, tool results, or file
/// attachments. Multiple tool calls produced by one assistant turn live as
/// sibling parts of a single assistant message; a tool message carries a
/// list of `ToolResult` parts answering the calls from the immediately
/// preceding assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        content: ToolResultContent,
    },
    File {
        media_type: String,
        /// Data URL (`data:<mime>;base64,...`) or HTTPS URL.
        url: String,
        /// OpenAI-style vision detail hint (`"low"`, `"high"`, `"auto"`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    pub fn tool_call(call_id: impl Into<String>, tool_name: impl Into<String>, input: Value) -> Self {
        Self::ToolCall { call_id: call_id.into(), tool_name: tool_name.into(), input }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<ToolResultContent>,
    ) -> Self {
        Self::ToolResult { call_id: call_id.into(), tool_name: tool_name.into(), content: content.into() }
    }

    pub fn file(media_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self::File { media_type: media_type.into(), url: url.into(), detail: None }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::File { media_type: "image".into(), url: url.into(), detail: None }
    }

    pub fn image_with_detail(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::File { media_type: "image".into(), url: url.into(), detail: Some(detail.into()) }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { call_id, .. } | Self::ToolResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolCall { tool_name, .. } | Self::ToolResult { tool_name, .. } => Some(tool_name),
            _ => None,
        }
    }

    /// Approximate token count for this part: 4 chars/token for text, fixed
    /// estimates for images (85 for "low" detail, 765 otherwise).
    pub fn approx_tokens(&self) -> usize {
        match self {
            Self::Text { text } | Self::Reasoning { text } => text.len() / 4,
            Self::ToolCall { tool_name, input, .. } => {
                (tool_name.len() + input.to_string().len()) / 4
            }
            Self::ToolResult { content, .. } => match content {
                ToolResultContent::Text(t) => t.len() / 4,
                ToolResultContent::Parts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        ToolContentPart::Text { text } => text.len() / 4,
                        ToolContentPart::Image { .. } => 765,
                    })
                    .sum(),
            },
            Self::File { detail, .. } => {
                if detail.as_deref() == Some("low") {
                    85
                } else {
                    765
                }
            }
        }
    }
}

// ─── Message ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation history.
///
/// Content is always an ordered list of [`MessagePart`]s, even for the
/// common single-text case (a one-element list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl Message {
    fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self { id: Uuid::new_v4().to_string(), timestamp: Utc::now(), role, parts }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![MessagePart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![MessagePart::text(text)])
    }

    pub fn user_with_parts(parts: Vec<MessagePart>) -> Self {
        Self::new(Role::User, parts)
    }

    pub fn assistant_with_parts(parts: Vec<MessagePart>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    /// A tool message carrying a batch of tool-result parts answering the
    /// calls made by the immediately preceding assistant message.
    pub fn tool_message(parts: Vec<MessagePart>) -> Self {
        Self::new(Role::Tool, parts)
    }

    /// Convenience: a tool message answering a single call.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<ToolResultContent>,
    ) -> Self {
        Self::tool_message(vec![MessagePart::tool_result(call_id, tool_name, content)])
    }

    /// Joined text of all `Text` parts, or `None` if there are none.
    pub fn as_text(&self) -> Option<String> {
        let joined: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if joined.is_empty() {
            None
        } else {
            Some(joined.join(""))
        }
    }

    pub fn tool_calls(&self) -> Vec<&MessagePart> {
        self.parts.iter().filter(|p| matches!(p, MessagePart::ToolCall { .. })).collect()
    }

    pub fn tool_results(&self) -> Vec<&MessagePart> {
        self.parts.iter().filter(|p| matches!(p, MessagePart::ToolResult { .. })).collect()
    }

    pub fn image_urls(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::File { url, .. } => Some(url.as_str()),
                MessagePart::ToolResult { content, .. } => content.image_urls().into_iter().next(),
                _ => None,
            })
            .collect()
    }

    /// Approximate token count used for context management (sum over parts,
    /// at least 1).
    pub fn approx_tokens(&self) -> usize {
        self.parts.iter().map(MessagePart::approx_tokens).sum::<usize>().max(1)
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Dynamic context (e.g. git branch/commit) appended outside the cached
    /// portion of the system prompt.
    pub system_dynamic_suffix: Option<String>,
}

/// A single streamed event from the model's delta stream.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A new text part has begun.
    TextStart,
    /// A text delta streamed from the model.
    TextDelta(String),
    /// A new reasoning/thinking part has begun, identified by `id`.
    ReasoningStart { id: String },
    /// A reasoning delta for the part identified by `id`.
    ReasoningDelta { id: String, text: String },
    /// The reasoning part identified by `id` is complete.
    ReasoningEnd { id: String },
    /// The model wants to call a tool.
    ToolCall {
        id: String,
        name: String,
        /// Accumulated JSON arguments (may arrive across multiple deltas).
        arguments: String,
    },
    /// A file attachment emitted by the model (e.g. generated image).
    File { media_type: String, data: String },
    /// An opaque provider-specific event, preserved for debugging.
    Raw(Value),
    /// Final usage statistics.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
    },
    /// The stream finished normally.
    Done,
    /// A recoverable or fatal error surfaced by the provider.
    Error(String),
}

/// Token usage from one turn.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
