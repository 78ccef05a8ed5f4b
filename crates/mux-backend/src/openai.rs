//! OpenAI-compatible Chat Completions adapter.
//!
//! Works against api.openai.com and the many servers that mimic it (vLLM,
//! llama.cpp, Ollama, OpenRouter). Responses arrive as SSE `data:` frames
//! holding JSON chunks, optionally terminated by `data: [DONE]`.

use mux_protocol::{
    CacheHint, Context, ConversationMessage, Role, StopReason, StreamError, StreamEvent, Usage,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::accumulate::MessageAccumulator;
use crate::provider::{api, drive, emit, spawn_stream, ChunkProcessor, Provider, Step, StreamOptions};
use crate::sse::Frame;
use crate::stream::EventStream;
use crate::transport::{normalize_base_url, HttpTransport, RequestBody};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const COMPLETIONS_PATH: &str = "/v1/chat/completions";
const DONE_MARKER: &str = "[DONE]";

pub struct OpenAiProvider {
    base_url: String,
}

impl OpenAiProvider {
    /// An empty `base_url` selects the public OpenAI endpoint.
    pub fn new(base_url: &str) -> Self {
        let base_url = match normalize_base_url(base_url) {
            url if url.is_empty() => DEFAULT_BASE_URL.to_string(),
            url => url,
        };
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new("")
    }
}

impl Provider for OpenAiProvider {
    fn api(&self) -> &str {
        api::OPENAI_COMPLETIONS
    }

    fn stream(&self, model: &str, context: &Context, options: StreamOptions) -> EventStream {
        let request = build_request(model, context, &options);
        let base_url = self.base_url.clone();
        let model = model.to_string();

        spawn_stream(options.queue_capacity, move |tx| async move {
            let transport = match build_transport(&base_url, &options) {
                Ok(transport) => transport,
                Err(e) => {
                    tx.finish_with_error(e.into()).await;
                    return;
                }
            };
            let body = match RequestBody::json(&request) {
                Ok(body) => body,
                Err(e) => {
                    tx.finish_with_error(e.into()).await;
                    return;
                }
            };

            debug!(api = api::OPENAI_COMPLETIONS, %model, "starting stream");
            let frames = match transport
                .stream_frames(&options.cancel, Method::POST, COMPLETIONS_PATH, body)
                .await
            {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(api = api::OPENAI_COMPLETIONS, %model, error = %e, "request failed");
                    tx.finish_with_error(e.into()).await;
                    return;
                }
            };

            if !emit(&tx, vec![StreamEvent::MessageStart { model: model.clone() }]).await {
                return;
            }
            let processor = ChatChunkProcessor::new(&model);
            drive(&tx, frames, processor, &options.cancel).await;
        })
    }
}

fn build_transport(
    base_url: &str,
    options: &StreamOptions,
) -> Result<HttpTransport, crate::transport::TransportError> {
    let mut transport = HttpTransport::new(base_url, &options.transport)?;
    if let Some(key) = options.api_key.as_deref().filter(|k| !k.is_empty()) {
        transport = transport.bearer(key)?;
    }
    for (name, value) in &options.headers {
        transport = transport.header(name, value)?;
    }
    Ok(transport)
}

// ---------------------------------------------------------------------------
// Request shapes

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    stream_options: IncludeUsage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct IncludeUsage {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum ChatMessage {
    System {
        content: ChatContent,
    },
    User {
        content: ChatContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ChatToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

const EPHEMERAL: CacheControl = CacheControl { kind: "ephemeral" };

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionCall,
}

#[derive(Debug, Serialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionDef,
}

#[derive(Debug, Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

fn build_request(model: &str, context: &Context, options: &StreamOptions) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: build_messages(context),
        stream: true,
        stream_options: IncludeUsage {
            include_usage: true,
        },
        tools: context
            .tools
            .iter()
            .map(|tool| ChatTool {
                kind: "function",
                function: FunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect(),
        max_tokens: options.max_tokens,
        temperature: options.temperature,
    }
}

fn build_messages(context: &Context) -> Vec<ChatMessage> {
    let cache = context.cache_hint == CacheHint::Ephemeral;
    let cached_user = if cache { context.last_user_index() } else { None };
    let mut messages = Vec::new();

    if let Some(system) = context.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        let content = if cache {
            ChatContent::Parts(vec![ContentPart::Text {
                text: system.to_string(),
                cache_control: Some(EPHEMERAL),
            }])
        } else {
            ChatContent::Text(system.to_string())
        };
        messages.push(ChatMessage::System { content });
    }

    for (i, msg) in context.messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => messages.push(assistant_message(msg)),
            Role::User if !msg.tool_results.is_empty() => push_tool_results(&mut messages, msg),
            Role::User => messages.push(user_message(msg, cached_user == Some(i))),
        }
    }

    messages
}

fn assistant_message(msg: &ConversationMessage) -> ChatMessage {
    let tool_calls: Vec<ChatToolCall> = msg
        .tool_uses
        .iter()
        .map(|tu| ChatToolCall {
            id: tu.id.clone(),
            kind: "function",
            function: FunctionCall {
                name: tu.name.clone(),
                arguments: if tu.input_json.trim().is_empty() {
                    "{}".to_string()
                } else {
                    tu.input_json.clone()
                },
            },
        })
        .collect();
    let content = if msg.content.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(msg.content.clone())
    };
    ChatMessage::Assistant {
        content,
        tool_calls,
    }
}

fn user_message(msg: &ConversationMessage, cache: bool) -> ChatMessage {
    if msg.images.is_empty() && !cache {
        return ChatMessage::User {
            content: ChatContent::Text(msg.content.clone()),
        };
    }
    let mut parts = vec![ContentPart::Text {
        text: msg.content.clone(),
        cache_control: cache.then_some(EPHEMERAL),
    }];
    parts.extend(msg.images.iter().map(|image| ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: image.data_url(),
        },
    }));
    ChatMessage::User {
        content: ChatContent::Parts(parts),
    }
}

/// Tool messages only carry text, so images returned by tools, and any text
/// or images of the user's own, follow in a separate user message.
fn push_tool_results(messages: &mut Vec<ChatMessage>, msg: &ConversationMessage) {
    let mut images = Vec::new();
    for result in &msg.tool_results {
        let content = if result.is_error {
            format!("Error: {}", result.content)
        } else {
            result.content.clone()
        };
        messages.push(ChatMessage::Tool {
            tool_call_id: result.tool_use_id.clone(),
            content,
        });
        images.extend(result.images.iter().map(|image| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image.data_url(),
            },
        }));
    }
    let mut parts = Vec::new();
    if !images.is_empty() {
        parts.push(ContentPart::Text {
            text: "Images returned by the tool call above:".to_string(),
            cache_control: None,
        });
        parts.extend(images);
    }
    if !msg.content.is_empty() {
        parts.push(ContentPart::Text {
            text: msg.content.clone(),
            cache_control: None,
        });
    }
    parts.extend(msg.images.iter().map(|image| ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: image.data_url(),
        },
    }));
    if !parts.is_empty() {
        messages.push(ChatMessage::User {
            content: ChatContent::Parts(parts),
        });
    }
}

// ---------------------------------------------------------------------------
// Response chunks

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// Some compatible servers send explicit nulls for counts they don't track.
#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: String,
}

impl From<ChunkUsage> for Usage {
    fn from(usage: ChunkUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            cache_read_tokens: usage
                .prompt_tokens_details
                .and_then(|details| details.cached_tokens)
                .unwrap_or(0),
            cache_write_tokens: 0,
        }
    }
}

pub(crate) fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::Other,
    }
}

/// Folds chat completion chunks into the accumulator.
struct ChatChunkProcessor {
    acc: MessageAccumulator,
}

impl ChatChunkProcessor {
    fn new(model: &str) -> Self {
        Self {
            acc: MessageAccumulator::new(api::OPENAI_COMPLETIONS, model),
        }
    }
}

impl ChunkProcessor<Frame> for ChatChunkProcessor {
    fn process(&mut self, frame: Frame) -> Step {
        let data = frame.data.trim();
        if data.is_empty() {
            return Step::next(Vec::new());
        }
        if data == DONE_MARKER {
            return Step::done(Vec::new());
        }

        let chunk: ChatChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping malformed chunk");
                return Step::next(Vec::new());
            }
        };

        if let Some(error) = chunk.error {
            return Step::failed(Vec::new(), StreamError::Provider(error.message));
        }

        let mut events = Vec::new();

        // Usage may share a chunk with the finish reason; take it first.
        if let Some(usage) = chunk.usage {
            let usage = Usage::from(usage);
            self.acc.set_usage(usage);
            events.push(StreamEvent::MessageDelta {
                stop_reason: None,
                usage: Some(usage),
            });
        }
        if let Some(model) = chunk.model.as_deref() {
            self.acc.set_model(model);
        }

        let mut finished = false;
        for choice in chunk.choices {
            let delta = choice.delta.unwrap_or_default();
            if let Some(reasoning) = delta.reasoning_content.as_deref() {
                events.extend(self.acc.push_thinking(reasoning));
            }
            if let Some(text) = delta.content.as_deref() {
                events.extend(self.acc.push_text(text));
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let function = call.function.unwrap_or_default();
                let index = match call.index {
                    Some(index) => index,
                    None => self.acc.tools().index_for_id(call.id.as_deref()),
                };
                events.extend(self.acc.apply_tool(
                    index,
                    call.id.as_deref(),
                    function.name.as_deref(),
                    function.arguments.as_deref(),
                ));
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                let stop = map_finish_reason(reason);
                self.acc.set_stop_reason(stop);
                events.push(StreamEvent::MessageDelta {
                    stop_reason: Some(stop),
                    usage: None,
                });
                finished = true;
            }
        }

        if finished {
            Step::done(events)
        } else {
            Step::next(events)
        }
    }

    fn finish(self) -> (mux_protocol::AssistantMessage, Vec<StreamEvent>) {
        self.acc.finish()
    }
}
