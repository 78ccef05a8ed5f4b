//! Conversation input consumed by the provider adapters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An image attached to a user message or a tool result.
///
/// `data` is already base64-encoded; adapters pass it through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageData {
    pub mime_type: String,
    pub data: String,
}

impl ImageData {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Render as a `data:` URL, the form OpenAI-compatible APIs accept.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// A tool_use block from an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolUseRecord {
    pub id: String,
    pub name: String,
    pub input_json: String,
}

impl ToolUseRecord {
    /// Parsed tool input. Unparseable input degrades to an empty object so a
    /// single bad record never blocks a request from being built.
    pub fn input_value(&self) -> Value {
        serde_json::from_str(&self.input_json).unwrap_or(Value::Object(Default::default()))
    }
}

/// The result of executing one tool call, sent back on the next turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResultRecord {
    pub tool_use_id: String,
    /// Name of the tool that produced this result. Vertex matches results to
    /// calls by name rather than id.
    pub tool_name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageData>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResultRecord {
    pub fn text(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            images: Vec::new(),
            is_error: false,
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.images.push(image);
        self
    }

    pub fn as_error(mut self) -> Self {
        self.is_error = true;
        self
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUseRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResultRecord>,
}

impl ConversationMessage {
    fn empty(role: Role) -> Self {
        Self {
            role,
            content: String::new(),
            images: Vec::new(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::empty(Role::User)
        }
    }

    pub fn user_with_images(content: impl Into<String>, images: Vec<ImageData>) -> Self {
        Self {
            content: content.into(),
            images,
            ..Self::empty(Role::User)
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::empty(Role::Assistant)
        }
    }

    pub fn assistant_with_tool_use(
        content: impl Into<String>,
        tool_uses: Vec<ToolUseRecord>,
    ) -> Self {
        Self {
            content: content.into(),
            tool_uses,
            ..Self::empty(Role::Assistant)
        }
    }

    pub fn tool_result(results: Vec<ToolResultRecord>) -> Self {
        Self {
            tool_results: results,
            ..Self::empty(Role::User)
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Prompt-caching hint. Vendors without a caching knob ignore it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheHint {
    #[default]
    None,
    /// Mark the system prompt and the latest user turn as cacheable.
    Ephemeral,
}

/// Everything an adapter needs to build one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<ConversationMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub cache_hint: CacheHint,
}

impl Context {
    pub fn new(messages: Vec<ConversationMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cache_hint(mut self, hint: CacheHint) -> Self {
        self.cache_hint = hint;
        self
    }

    /// Index of the last plain user message (not a tool-result carrier).
    pub fn last_user_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.role == Role::User && m.tool_results.is_empty())
    }
}
