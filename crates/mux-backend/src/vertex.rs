//! Vertex AI (Gemini) `streamGenerateContent` adapter.
//!
//! The response body is a JSON array streamed element by element, read with
//! [`crate::json_stream`] rather than the SSE frame reader.

use bytes::Bytes;
use mux_protocol::{
    AssistantMessage, Context, ConversationMessage, Role, StopReason, StreamError, StreamEvent,
    Usage,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::accumulate::{generate_tool_call_id, MessageAccumulator};
use crate::json_stream::json_objects;
use crate::provider::{api, drive, emit, spawn_stream, ChunkProcessor, Provider, Step, StreamOptions};
use crate::stream::EventStream;
use crate::transport::{HttpTransport, RequestBody, TransportError};

pub const PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";
pub const LOCATION_ENV: &str = "GOOGLE_CLOUD_LOCATION";
pub const DEFAULT_LOCATION: &str = "us-central1";

pub struct VertexProvider {
    base_url: String,
    project: String,
    location: String,
}

impl VertexProvider {
    /// An empty `base_url` selects the regional endpoint for `location`.
    pub fn new(base_url: &str, project: impl Into<String>, location: impl Into<String>) -> Self {
        let location = match location.into() {
            l if l.is_empty() => DEFAULT_LOCATION.to_string(),
            l => l,
        };
        let base_url = match base_url.trim_end_matches('/') {
            "" => format!("https://{location}-aiplatform.googleapis.com/v1"),
            url => url.to_string(),
        };
        Self {
            base_url,
            project: project.into(),
            location,
        }
    }

    /// Project and location from `GOOGLE_CLOUD_PROJECT` / `GOOGLE_CLOUD_LOCATION`.
    pub fn from_env(base_url: &str) -> Self {
        Self::new(
            base_url,
            std::env::var(PROJECT_ENV).unwrap_or_default(),
            std::env::var(LOCATION_ENV).unwrap_or_default(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn path(&self, model: &str) -> String {
        format!(
            "/projects/{}/locations/{}/publishers/google/models/{}:streamGenerateContent",
            self.project, self.location, model
        )
    }
}

impl Provider for VertexProvider {
    fn api(&self) -> &str {
        api::GOOGLE_VERTEX
    }

    fn stream(&self, model: &str, context: &Context, options: StreamOptions) -> EventStream {
        let request = build_request(context, &options);
        let base_url = self.base_url.clone();
        let path = self.path(model);
        let project_missing = self.project.is_empty();
        let model = model.to_string();

        spawn_stream(options.queue_capacity, move |tx| async move {
            if project_missing {
                tx.finish_with_error(StreamError::Provider(format!(
                    "no Vertex project configured (set {PROJECT_ENV})"
                )))
                .await;
                return;
            }
            let prepared = build_transport(&base_url, &options)
                .and_then(|transport| Ok((transport, RequestBody::json(&request)?)));
            let (transport, body) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    tx.finish_with_error(e.into()).await;
                    return;
                }
            };

            debug!(api = api::GOOGLE_VERTEX, %model, "starting stream");
            let bytes = match transport
                .stream_bytes(&options.cancel, Method::POST, &path, body)
                .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(api = api::GOOGLE_VERTEX, %model, error = %e, "request failed");
                    tx.finish_with_error(e.into()).await;
                    return;
                }
            };

            if !emit(&tx, vec![StreamEvent::MessageStart { model: model.clone() }]).await {
                return;
            }
            let processor = GenerateChunkProcessor::new(&model);
            drive(&tx, json_objects(bytes), processor, &options.cancel).await;
        })
    }
}

fn build_transport(base_url: &str, options: &StreamOptions) -> Result<HttpTransport, TransportError> {
    let mut transport = HttpTransport::new(base_url, &options.transport)?;
    if let Some(token) = options.api_key.as_deref().filter(|k| !k.is_empty()) {
        transport = transport.bearer(token)?;
    }
    for (name, value) in &options.headers {
        transport = transport.header(name, value)?;
    }
    Ok(transport)
}

// Wire types. `Part` and `Content` are shared by requests and responses.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    fn inline_data(mime_type: &str, data: &str) -> Self {
        Self {
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            }),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

fn build_request(context: &Context, options: &StreamOptions) -> GenerateRequest {
    let generation_config = (options.max_tokens.is_some() || options.temperature.is_some())
        .then_some(GenerationConfig {
            max_output_tokens: options.max_tokens,
            temperature: options.temperature,
        });
    let tools = if context.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolDeclarations {
            function_declarations: context
                .tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                })
                .collect(),
        }]
    };

    GenerateRequest {
        contents: context.messages.iter().map(to_content).collect(),
        system_instruction: context
            .system_prompt
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| Content {
                role: None,
                parts: vec![Part::text(s)],
            }),
        tools,
        generation_config,
    }
}

fn to_content(msg: &ConversationMessage) -> Content {
    let mut parts = Vec::new();
    let role = match msg.role {
        Role::Assistant => {
            if !msg.content.is_empty() {
                parts.push(Part::text(&msg.content));
            }
            parts.extend(msg.tool_uses.iter().map(|tu| Part {
                function_call: Some(FunctionCall {
                    id: None,
                    name: tu.name.clone(),
                    args: tu.input_value(),
                }),
                ..Part::default()
            }));
            "model"
        }
        Role::User => {
            for result in &msg.tool_results {
                let response = if result.is_error {
                    json!({ "error": result.content })
                } else {
                    json!({ "output": result.content })
                };
                parts.push(Part {
                    function_response: Some(FunctionResponse {
                        name: result.tool_name.clone(),
                        response,
                    }),
                    ..Part::default()
                });
                parts.extend(
                    result
                        .images
                        .iter()
                        .map(|image| Part::inline_data(&image.mime_type, &image.data)),
                );
            }
            if !msg.content.is_empty() {
                parts.push(Part::text(&msg.content));
            }
            parts.extend(
                msg.images
                    .iter()
                    .map(|image| Part::inline_data(&image.mime_type, &image.data)),
            );
            "user"
        }
    };
    Content {
        role: Some(role.to_string()),
        parts,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    thoughts_token_count: u32,
    #[serde(default)]
    cached_content_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

impl From<UsageMetadata> for Usage {
    fn from(meta: UsageMetadata) -> Self {
        Usage {
            input_tokens: meta.prompt_token_count,
            output_tokens: meta.candidates_token_count + meta.thoughts_token_count,
            cache_read_tokens: meta.cached_content_token_count,
            cache_write_tokens: 0,
        }
    }
}

/// `STOP` becomes `ToolUse` later if the turn contained function calls.
pub(crate) fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        _ => StopReason::Other,
    }
}

struct GenerateChunkProcessor {
    acc: MessageAccumulator,
}

impl GenerateChunkProcessor {
    fn new(model: &str) -> Self {
        Self {
            acc: MessageAccumulator::new(api::GOOGLE_VERTEX, model),
        }
    }
}

impl ChunkProcessor<Bytes> for GenerateChunkProcessor {
    fn process(&mut self, object: Bytes) -> Step {
        let chunk: GenerateChunk = match serde_json::from_slice(&object) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping malformed chunk");
                return Step::next(Vec::new());
            }
        };

        if let Some(error) = chunk.error {
            let message = match error.code {
                Some(code) => format!("{code}: {}", error.message),
                None => error.message,
            };
            return Step::failed(Vec::new(), StreamError::Provider(message));
        }

        let mut events = Vec::new();
        if let Some(meta) = chunk.usage_metadata {
            let usage = Usage::from(meta);
            self.acc.set_usage(usage);
            events.push(StreamEvent::MessageDelta {
                stop_reason: None,
                usage: Some(usage),
            });
        }
        if let Some(version) = chunk.model_version.as_deref() {
            self.acc.set_model(version);
        }

        let mut finished = false;
        for candidate in chunk.candidates {
            let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
            for part in parts {
                if let Some(text) = part.text.as_deref() {
                    if part.thought == Some(true) {
                        events.extend(self.acc.push_thinking(text));
                    } else {
                        events.extend(self.acc.push_text(text));
                    }
                }
                if let Some(call) = part.function_call {
                    // Gemini rarely sends call ids; mint one so ToolUseStart carries it.
                    let index = self.acc.tools().next_index();
                    let id = call
                        .id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(generate_tool_call_id);
                    let args = match call.args {
                        Value::Null => None,
                        args => Some(args.to_string()),
                    };
                    events.extend(self.acc.apply_tool(
                        index,
                        Some(id.as_str()),
                        Some(call.name.as_str()),
                        args.as_deref(),
                    ));
                }
            }
            if let Some(reason) = candidate.finish_reason.as_deref() {
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

    fn finish(self) -> (AssistantMessage, Vec<StreamEvent>) {
        self.acc.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Flow;
    use mux_protocol::{ImageData, ToolDefinition, ToolResultRecord, ToolUseRecord};

    fn chunk(json: &str) -> Bytes {
        Bytes::from(json.to_string())
    }

    #[test]
    fn default_endpoint_uses_location() {
        let provider = VertexProvider::new("", "proj", "europe-west4");
        assert_eq!(
            provider.base_url(),
            "https://europe-west4-aiplatform.googleapis.com/v1"
        );
        assert_eq!(
            provider.path("gemini-2.5-pro"),
            "/projects/proj/locations/europe-west4/publishers/google/models/gemini-2.5-pro:streamGenerateContent"
        );
        assert_eq!(VertexProvider::new("", "p", "").location, DEFAULT_LOCATION);
    }

    #[test]
    fn request_shape() {
        let context = Context::new(vec![
            ConversationMessage::user("weather?"),
            ConversationMessage::assistant_with_tool_use(
                "checking",
                vec![ToolUseRecord {
                    id: "t1".to_string(),
                    name: "weather".to_string(),
                    input_json: r#"{"city":"Paris"}"#.to_string(),
                }],
            ),
            ConversationMessage::tool_result(vec![
                ToolResultRecord::text("t1", "weather", "sunny")
                    .with_image(ImageData::new("image/png", "AAAA")),
                ToolResultRecord::text("t2", "clock", "broken").as_error(),
            ]),
        ])
        .with_system_prompt("be brief")
        .with_tools(vec![ToolDefinition::new(
            "weather",
            "look up weather",
            json!({"type": "object"}),
        )]);
        let options = StreamOptions::new().with_max_tokens(100);
        let json = serde_json::to_value(build_request(&context, &options)).unwrap();

        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(
            json["tools"][0]["functionDeclarations"][0]["name"],
            "weather"
        );
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 100);

        let contents = json["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "checking");
        assert_eq!(contents[1]["parts"][1]["functionCall"]["name"], "weather");
        assert_eq!(contents[1]["parts"][1]["functionCall"]["args"]["city"], "Paris");

        let results = contents[2]["parts"].as_array().unwrap();
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(results[0]["functionResponse"]["name"], "weather");
        assert_eq!(results[0]["functionResponse"]["response"]["output"], "sunny");
        assert_eq!(results[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(results[1]["inlineData"]["data"], "AAAA");
        assert_eq!(results[2]["functionResponse"]["response"]["error"], "broken");
    }

    #[test]
    fn no_generation_config_without_limits() {
        let context = Context::new(vec![ConversationMessage::user("hi")]);
        let json = serde_json::to_value(build_request(&context, &StreamOptions::new())).unwrap();
        assert!(json.get("generationConfig").is_none());
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn text_thought_and_usage() {
        let mut processor = GenerateChunkProcessor::new("gemini");
        let step = processor.process(chunk(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"plan","thought":true},{"text":"Hel"}]}}]}"#,
        ));
        assert_eq!(
            step.events,
            vec![StreamEvent::thinking("plan"), StreamEvent::content("Hel")]
        );
        let step = processor.process(chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"thoughtsTokenCount":1}}"#,
        ));
        assert_eq!(step.flow, Flow::Done);

        let (message, _) = processor.finish();
        assert_eq!(message.text(), "Hello");
        assert_eq!(message.stop_reason, StopReason::EndTurn);
        assert_eq!(message.usage, Usage::new(4, 3));
    }

    #[test]
    fn function_calls_become_tool_use() {
        let mut processor = GenerateChunkProcessor::new("gemini");
        let step = processor.process(chunk(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"weather","args":{"city":"London"}}},{"functionCall":{"name":"clock"}}]},"finishReason":"STOP"}]}"#,
        ));
        assert_eq!(step.flow, Flow::Done);
        assert!(matches!(
            step.events[0],
            StreamEvent::ToolUseStart { index: 0, .. }
        ));

        let (message, _) = processor.finish();
        let calls: Vec<_> = message.tool_uses().collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "weather");
        assert_eq!(calls[0].2, r#"{"city":"London"}"#);
        assert!(calls[0].0.starts_with("call_"));
        assert_eq!(calls[1].2, "{}");
        assert_eq!(message.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn finish_reasons() {
        assert_eq!(map_finish_reason("STOP"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("MAX_TOKENS"), StopReason::MaxTokens);
        assert_eq!(map_finish_reason("SAFETY"), StopReason::Other);
    }

    #[test]
    fn error_object_fails_and_noise_is_skipped() {
        let mut processor = GenerateChunkProcessor::new("gemini");
        assert_eq!(processor.process(chunk("{not json")).flow, Flow::Continue);
        let step = processor.process(chunk(
            r#"{"error":{"code":429,"message":"Resource exhausted","status":"RESOURCE_EXHAUSTED"}}"#,
        ));
        assert_eq!(
            step.flow,
            Flow::Failed(StreamError::Provider("429: Resource exhausted".to_string()))
        );
    }
}
