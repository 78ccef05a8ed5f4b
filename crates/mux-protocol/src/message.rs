//! Streaming events and the final accumulated assistant message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the model's turn ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    ToolUse,
    Other,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::ToolUse => "tool_use",
            StopReason::Other => "other",
        };
        f.write_str(s)
    }
}

/// Token usage counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_write_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Errors carried inside the event stream.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamError {
    /// The vendor answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// Connect, DNS, TLS, timeout, or a broken body mid-stream.
    #[error("transport error: {0}")]
    Transport(String),
    /// The stream framing itself was unusable.
    #[error("decode error: {0}")]
    Decode(String),
    /// The vendor reported an error inside an otherwise healthy stream.
    #[error("provider error: {0}")]
    Provider(String),
    #[error("request cancelled")]
    Cancelled,
}

impl From<std::convert::Infallible> for StreamError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

/// Events emitted during a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        model: String,
    },

    /// A chunk of response text.
    ContentDelta {
        text: String,
    },

    /// The full text of a finished text block.
    ContentDone {
        text: String,
    },

    /// A chunk of thinking/reasoning text from the model.
    ThinkingDelta {
        text: String,
    },

    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A fragment of the tool input JSON. Fragments concatenate in order.
    ToolUseDelta {
        index: usize,
        partial_json: String,
    },

    ToolUseDone {
        id: String,
        name: String,
        input_json: String,
    },

    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },

    MessageDone {
        stop_reason: StopReason,
        usage: Usage,
    },

    Ping,

    Error {
        error: StreamError,
    },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::ContentDelta { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        StreamEvent::ThinkingDelta { text: text.into() }
    }

    pub fn error(error: StreamError) -> Self {
        StreamEvent::Error { error }
    }
}

/// One block of the final assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

/// The accumulated result of one streaming call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub model: String,
    pub api: String,
}

impl AssistantMessage {
    pub fn new(api: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    /// Concatenation of every text block.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse {
                id,
                name,
                input_json,
            } => Some((id.as_str(), name.as_str(), input_json.as_str())),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.usage.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_display_matches_serde() {
        for reason in [
            StopReason::EndTurn,
            StopReason::MaxTokens,
            StopReason::ToolUse,
            StopReason::Other,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{reason}\""));
        }
    }

    #[test]
    fn stream_error_messages() {
        let err = StreamError::Http {
            status: 429,
            body: "slow down".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 429: slow down");
        assert_eq!(StreamError::Cancelled.to_string(), "request cancelled");
    }

    #[test]
    fn assistant_message_text_skips_other_blocks() {
        let msg = AssistantMessage {
            content: vec![
                ContentBlock::Thinking {
                    thinking: "hmm".to_string(),
                },
                ContentBlock::Text {
                    text: "Hello".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "shell".to_string(),
                    input_json: "{}".to_string(),
                },
                ContentBlock::Text {
                    text: " again".to_string(),
                },
            ],
            ..AssistantMessage::default()
        };
        assert_eq!(msg.text(), "Hello again");
        assert_eq!(msg.tool_uses().count(), 1);
    }

    #[test]
    fn empty_message() {
        assert!(AssistantMessage::new("openai-completions", "gpt").is_empty());
        let with_usage = AssistantMessage {
            usage: Usage::new(1, 0),
            ..AssistantMessage::default()
        };
        assert!(!with_usage.is_empty());
    }

    #[test]
    fn content_block_serialization_is_tagged() {
        let block = ContentBlock::ToolUse {
            id: "t1".to_string(),
            name: "shell".to_string(),
            input_json: "{}".to_string(),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
    }
}
