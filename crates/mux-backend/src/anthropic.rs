//! Anthropic Messages API adapter with SSE streaming support.

use mux_protocol::{
    AssistantMessage, CacheHint, Context, ConversationMessage, ImageData, Role, StopReason,
    StreamError, StreamEvent,
};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::accumulate::MessageAccumulator;
use crate::provider::{api, drive, emit, spawn_stream, ChunkProcessor, Provider, Step, StreamOptions};
use crate::sse::Frame;
use crate::stream::EventStream;
use crate::transport::{normalize_base_url, HttpTransport, RequestBody, TransportError};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const MESSAGES_PATH: &str = "/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 16000;

pub struct AnthropicProvider {
    base_url: String,
}

impl AnthropicProvider {
    /// An empty `base_url` selects the public Anthropic endpoint.
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

impl Provider for AnthropicProvider {
    fn api(&self) -> &str {
        api::ANTHROPIC_MESSAGES
    }

    fn stream(&self, model: &str, context: &Context, options: StreamOptions) -> EventStream {
        let request = build_request(model, context, &options);
        let base_url = self.base_url.clone();
        let model = model.to_string();

        spawn_stream(options.queue_capacity, move |tx| async move {
            let prepared = build_transport(&base_url, &options)
                .and_then(|transport| Ok((transport, RequestBody::json(&request)?)));
            let (transport, body) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    tx.finish_with_error(e.into()).await;
                    return;
                }
            };

            debug!(api = api::ANTHROPIC_MESSAGES, %model, "starting stream");
            let frames = match transport
                .stream_frames(&options.cancel, Method::POST, MESSAGES_PATH, body)
                .await
            {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(api = api::ANTHROPIC_MESSAGES, %model, error = %e, "request failed");
                    tx.finish_with_error(e.into()).await;
                    return;
                }
            };

            if !emit(&tx, vec![StreamEvent::MessageStart { model: model.clone() }]).await {
                return;
            }
            drive(&tx, frames, SseProcessor::new(&model), &options.cancel).await;
        })
    }
}

fn build_transport(base_url: &str, options: &StreamOptions) -> Result<HttpTransport, TransportError> {
    let mut transport = HttpTransport::new(base_url, &options.transport)?
        .header("anthropic-version", API_VERSION)?;
    if let Some(key) = options.api_key.as_deref().filter(|k| !k.is_empty()) {
        transport = transport.header("x-api-key", key)?;
    }
    for (name, value) in &options.headers {
        transport = transport.header(name, value)?;
    }
    Ok(transport)
}

fn build_request(model: &str, context: &Context, options: &StreamOptions) -> ApiRequest {
    let cache = context.cache_hint == CacheHint::Ephemeral;
    let system = context
        .system_prompt
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            if cache {
                ApiContent::Blocks(vec![ApiContentBlock::Text {
                    text: s.to_string(),
                    cache_control: Some(EPHEMERAL),
                }])
            } else {
                ApiContent::Text(s.to_string())
            }
        });

    ApiRequest {
        model: model.to_string(),
        max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        stream: true,
        system,
        messages: build_messages(context),
        tools: context
            .tools
            .iter()
            .map(|tool| ApiTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect(),
        temperature: options.temperature,
    }
}

fn build_messages(context: &Context) -> Vec<ApiMessage> {
    let cached_user = match context.cache_hint {
        CacheHint::Ephemeral => context.last_user_index(),
        CacheHint::None => None,
    };

    context
        .messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            ApiMessage {
                role: role.to_string(),
                content: message_content(msg, cached_user == Some(i)),
            }
        })
        .collect()
}

fn message_content(msg: &ConversationMessage, cache: bool) -> ApiContent {
    if !msg.tool_uses.is_empty() {
        // Assistant message with tool_use blocks
        let mut blocks = Vec::new();
        if !msg.content.is_empty() {
            blocks.push(ApiContentBlock::text(&msg.content));
        }
        for tu in &msg.tool_uses {
            blocks.push(ApiContentBlock::ToolUse {
                id: tu.id.clone(),
                name: tu.name.clone(),
                input: tu.input_value(),
            });
        }
        return ApiContent::Blocks(blocks);
    }

    if !msg.tool_results.is_empty() {
        // tool_result blocks must lead the user turn
        let mut blocks: Vec<ApiContentBlock> = msg
            .tool_results
            .iter()
            .map(|tr| {
                let mut content = vec![ApiContentBlock::text(&tr.content)];
                content.extend(tr.images.iter().map(ApiContentBlock::image));
                ApiContentBlock::ToolResult {
                    tool_use_id: tr.tool_use_id.clone(),
                    content,
                    is_error: tr.is_error,
                }
            })
            .collect();
        if !msg.content.is_empty() {
            blocks.push(ApiContentBlock::text(&msg.content));
        }
        blocks.extend(msg.images.iter().map(ApiContentBlock::image));
        return ApiContent::Blocks(blocks);
    }

    if msg.images.is_empty() && !cache {
        return ApiContent::Text(msg.content.clone());
    }

    let mut blocks: Vec<ApiContentBlock> = msg.images.iter().map(ApiContentBlock::image).collect();
    blocks.push(ApiContentBlock::Text {
        text: msg.content.clone(),
        cache_control: cache.then_some(EPHEMERAL),
    });
    ApiContent::Blocks(blocks)
}

pub(crate) fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" | "stop_sequence" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Other,
    }
}

/// Interprets Messages API events.
///
/// Tool use blocks arrive as:
///   content_block_start (type=tool_use, id, name)
///   content_block_delta* (input_json_delta chunks)
///   content_block_stop
/// and are keyed by the block index until the message completes.
struct SseProcessor {
    acc: MessageAccumulator,
}

impl SseProcessor {
    fn new(model: &str) -> Self {
        Self {
            acc: MessageAccumulator::new(api::ANTHROPIC_MESSAGES, model),
        }
    }

    fn usage_event(&self) -> StreamEvent {
        StreamEvent::MessageDelta {
            stop_reason: None,
            usage: Some(self.acc.usage()),
        }
    }
}

fn u32_field(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

impl ChunkProcessor<Frame> for SseProcessor {
    fn process(&mut self, frame: Frame) -> Step {
        let mut events = Vec::new();

        let data: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping malformed event");
                return Step::next(events);
            }
        };

        let event_type = match frame.event_type.as_str() {
            "" => data.get("type").and_then(Value::as_str).unwrap_or(""),
            t => t,
        };

        match event_type {
            "message_start" => {
                let message = data.get("message");
                if let Some(model) = message.and_then(|m| m.get("model")).and_then(Value::as_str) {
                    self.acc.set_model(model);
                }
                if let Some(usage) = message.and_then(|m| m.get("usage")) {
                    let acc_usage = self.acc.usage_mut();
                    acc_usage.input_tokens = u32_field(usage, "input_tokens").unwrap_or(0);
                    acc_usage.output_tokens = u32_field(usage, "output_tokens").unwrap_or(0);
                    acc_usage.cache_read_tokens =
                        u32_field(usage, "cache_read_input_tokens").unwrap_or(0);
                    acc_usage.cache_write_tokens =
                        u32_field(usage, "cache_creation_input_tokens").unwrap_or(0);
                    events.push(self.usage_event());
                }
            }
            "content_block_start" => {
                let index = u32_field(&data, "index").unwrap_or(0) as usize;
                if let Some(block) = data.get("content_block") {
                    match block.get("type").and_then(Value::as_str).unwrap_or("") {
                        "tool_use" => {
                            let id = block.get("id").and_then(Value::as_str);
                            let name = block.get("name").and_then(Value::as_str);
                            events.extend(self.acc.apply_tool(index, id, name, None));
                        }
                        "text" => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                events.extend(self.acc.push_text(text));
                            }
                        }
                        _ => {}
                    }
                }
            }
            "content_block_delta" => {
                let index = u32_field(&data, "index").unwrap_or(0) as usize;
                if let Some(delta) = data.get("delta") {
                    match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                        "text_delta" => {
                            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                events.extend(self.acc.push_text(text));
                            }
                        }
                        "thinking_delta" => {
                            if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                                events.extend(self.acc.push_thinking(text));
                            }
                        }
                        "input_json_delta" => {
                            let partial = delta.get("partial_json").and_then(Value::as_str);
                            events.extend(self.acc.apply_tool(index, None, None, partial));
                        }
                        _ => {}
                    }
                }
            }
            "message_delta" => {
                if let Some(output) = data.get("usage").and_then(|u| u32_field(u, "output_tokens")) {
                    self.acc.usage_mut().output_tokens = output;
                    events.push(self.usage_event());
                }
                if let Some(reason) = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    let stop = map_stop_reason(reason);
                    self.acc.set_stop_reason(stop);
                    events.push(StreamEvent::MessageDelta {
                        stop_reason: Some(stop),
                        usage: None,
                    });
                    return Step::done(events);
                }
            }
            "message_stop" => return Step::done(events),
            "ping" => events.push(StreamEvent::Ping),
            "error" => {
                let error_msg = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                return Step::failed(events, StreamError::Provider(error_msg));
            }
            _ => {}
        }

        Step::next(events)
    }

    fn finish(self) -> (AssistantMessage, Vec<StreamEvent>) {
        self.acc.finish()
    }
}

// API request types

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<ApiContent>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

const EPHEMERAL: CacheControl = CacheControl { kind: "ephemeral" };

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: Vec<ApiContentBlock>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ApiContentBlock {
    fn text(text: &str) -> Self {
        Self::Text {
            text: text.to_string(),
            cache_control: None,
        }
    }

    fn image(image: &ImageData) -> Self {
        Self::Image {
            source: ImageSource {
                kind: "base64",
                media_type: image.mime_type.clone(),
                data: image.data.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}
