//! Mock provider for testing.
//!
//! Drives scripted responses through the same accumulator and event stream
//! as the HTTP adapters, so consumers see exactly the adapter contract
//! without a network.

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use mux_protocol::{AssistantMessage, Context, StopReason, StreamError, StreamEvent, Usage};
use tokio::time::sleep;

use crate::accumulate::MessageAccumulator;
use crate::provider::{api, drive, emit, spawn_stream, ChunkProcessor, Provider, Step, StreamOptions};
use crate::stream::EventStream;

/// Configurable mock responses for testing.
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// Emit a thinking delta.
    Thinking { content: String },
    /// Emit a text delta.
    Text { content: String },
    /// One tool call, split into the given argument fragments.
    ToolCall {
        id: String,
        name: String,
        fragments: Vec<String>,
    },
    /// Report usage.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    /// End the turn with this stop reason.
    Stop { reason: StopReason },
    /// Fail the stream with a provider error.
    Error { message: String },
    /// Delay before next event (for timing tests).
    Delay { ms: u64 },
}

/// Configuration for mock stream.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// Sequence of responses to emit.
    pub responses: Vec<MockResponse>,
    /// Optional delay between each event (ms).
    pub chunk_delay_ms: Option<u64>,
}

impl MockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(mut self, responses: Vec<MockResponse>) -> Self {
        self.responses = responses;
        self
    }

    pub fn with_chunk_delay(mut self, ms: u64) -> Self {
        self.chunk_delay_ms = Some(ms);
        self
    }
}

/// Replay a config as a chunk stream, applying its delays.
fn mock_chunks(config: MockConfig) -> impl Stream<Item = Result<MockResponse, Infallible>> {
    stream! {
        for response in config.responses {
            if let Some(delay_ms) = config.chunk_delay_ms {
                sleep(Duration::from_millis(delay_ms)).await;
            }
            match response {
                MockResponse::Delay { ms } => {
                    // Delay doesn't emit an event
                    sleep(Duration::from_millis(ms)).await;
                }
                other => yield Ok::<_, Infallible>(other),
            }
        }
    }
}

struct MockProcessor {
    acc: MessageAccumulator,
}

impl ChunkProcessor<MockResponse> for MockProcessor {
    fn process(&mut self, response: MockResponse) -> Step {
        let mut events = Vec::new();
        match response {
            MockResponse::Thinking { content } => events.extend(self.acc.push_thinking(&content)),
            MockResponse::Text { content } => events.extend(self.acc.push_text(&content)),
            MockResponse::ToolCall {
                id,
                name,
                fragments,
            } => {
                let index = self.acc.tools().next_index();
                events.extend(self.acc.apply_tool(
                    index,
                    Some(id.as_str()),
                    Some(name.as_str()),
                    None,
                ));
                for fragment in &fragments {
                    events.extend(self.acc.apply_tool(index, None, None, Some(fragment.as_str())));
                }
            }
            MockResponse::Usage {
                input_tokens,
                output_tokens,
            } => {
                let usage = Usage::new(input_tokens, output_tokens);
                self.acc.set_usage(usage);
                events.push(StreamEvent::MessageDelta {
                    stop_reason: None,
                    usage: Some(usage),
                });
            }
            MockResponse::Stop { reason } => {
                self.acc.set_stop_reason(reason);
                events.push(StreamEvent::MessageDelta {
                    stop_reason: Some(reason),
                    usage: None,
                });
                return Step::done(events);
            }
            MockResponse::Error { message } => {
                return Step::failed(events, StreamError::Provider(message));
            }
            MockResponse::Delay { .. } => {}
        }
        Step::next(events)
    }

    fn finish(self) -> (AssistantMessage, Vec<StreamEvent>) {
        self.acc.finish()
    }
}

/// A provider that replays a fixed script on every call.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    config: MockConfig,
}

impl MockProvider {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }
}

impl Provider for MockProvider {
    fn api(&self) -> &str {
        api::MOCK
    }

    fn stream(&self, model: &str, _context: &Context, options: StreamOptions) -> EventStream {
        let config = self.config.clone();
        let model = model.to_string();

        spawn_stream(options.queue_capacity, move |tx| async move {
            if !emit(&tx, vec![StreamEvent::MessageStart { model: model.clone() }]).await {
                return;
            }
            let processor = MockProcessor {
                acc: MessageAccumulator::new(api::MOCK, &model),
            };
            let chunks = Box::pin(mock_chunks(config));
            drive(&tx, chunks, processor, &options.cancel).await;
        })
    }
}

/// Built-in test fixtures for common scenarios.
pub mod fixtures {
    use super::*;

    /// Create a mock config that streams text in chunks.
    pub fn streaming_text(chunks: &[&str]) -> MockConfig {
        let responses = chunks
            .iter()
            .map(|chunk| MockResponse::Text {
                content: (*chunk).to_string(),
            })
            .collect();

        MockConfig::new().with_responses(responses)
    }

    /// Create a mock config with thinking followed by an answer.
    pub fn thinking_then_text(thinking: &str, text: &str) -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::Thinking {
                content: thinking.to_string(),
            },
            MockResponse::Text {
                content: text.to_string(),
            },
        ])
    }

    /// Text, then a tool call whose arguments arrive in fragments.
    pub fn tool_call(explanation: &str, name: &str, fragments: &[&str]) -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::Text {
                content: explanation.to_string(),
            },
            MockResponse::ToolCall {
                id: "call_mock_1".to_string(),
                name: name.to_string(),
                fragments: fragments.iter().map(|f| (*f).to_string()).collect(),
            },
            MockResponse::Stop {
                reason: StopReason::ToolUse,
            },
        ])
    }

    /// Echo a prompt back as the answer, with made-up usage.
    pub fn echo(prompt: &str) -> MockConfig {
        let words: Vec<MockResponse> = prompt
            .split_inclusive(' ')
            .map(|word| MockResponse::Text {
                content: word.to_string(),
            })
            .collect();
        let output_tokens = u32::try_from(words.len()).unwrap_or(u32::MAX);
        let mut responses = words;
        responses.push(MockResponse::Usage {
            input_tokens: output_tokens,
            output_tokens,
        });
        responses.push(MockResponse::Stop {
            reason: StopReason::EndTurn,
        });
        MockConfig::new().with_responses(responses)
    }

    /// Create a mock config that errors mid-stream.
    pub fn error_mid_stream(text_before: &str, error: &str) -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::Text {
                content: text_before.to_string(),
            },
            MockResponse::Error {
                message: error.to_string(),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mux_protocol::{ConversationMessage, StopReason};
    use tokio_util::sync::CancellationToken;

    fn run(config: MockConfig) -> EventStream {
        run_with(config, StreamOptions::new())
    }

    fn run_with(config: MockConfig, options: StreamOptions) -> EventStream {
        let context = Context::new(vec![ConversationMessage::user("hi")]);
        MockProvider::new(config).stream("mock-model", &context, options)
    }

    #[tokio::test]
    async fn mock_stream_emits_events() {
        let mut stream = run(fixtures::streaming_text(&["Hello", " world"]));
        let events: Vec<_> = (&mut stream).collect().await;

        assert_eq!(
            events,
            vec![
                StreamEvent::MessageStart {
                    model: "mock-model".to_string()
                },
                StreamEvent::content("Hello"),
                StreamEvent::content(" world"),
                StreamEvent::ContentDone {
                    text: "Hello world".to_string()
                },
                StreamEvent::MessageDone {
                    stop_reason: StopReason::EndTurn,
                    usage: Usage::default(),
                },
            ]
        );
        let result = stream.result().await;
        assert_eq!(result.text(), "Hello world");
        assert_eq!(result.api, "mock");
    }

    #[tokio::test]
    async fn fixture_thinking_then_text() {
        let result = run(fixtures::thinking_then_text("The user wants files", "Here"))
            .collect_result()
            .await;
        assert_eq!(result.content.len(), 2);
        assert_eq!(result.text(), "Here");
    }

    #[tokio::test]
    async fn fixture_tool_call() {
        let mut stream = run(fixtures::tool_call(
            "Checking.",
            "weather",
            &[r#"{"city":"L"#, "on", r#"don"}"#],
        ));
        let events: Vec<_> = (&mut stream).collect().await;
        let deltas = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolUseDelta { .. }))
            .count();
        assert_eq!(deltas, 3);

        let result = stream.result().await;
        assert_eq!(result.stop_reason, StopReason::ToolUse);
        assert_eq!(
            result.tool_uses().collect::<Vec<_>>(),
            vec![("call_mock_1", "weather", r#"{"city":"London"}"#)]
        );
    }

    #[tokio::test]
    async fn fixture_echo_reports_usage() {
        let result = run(fixtures::echo("say it back")).collect_result().await;
        assert_eq!(result.text(), "say it back");
        assert_eq!(result.usage, Usage::new(3, 3));
    }

    #[tokio::test]
    async fn fixture_error_mid_stream() {
        let mut stream = run(fixtures::error_mid_stream("Processing...", "Rate limited"));
        let events: Vec<_> = (&mut stream).collect().await;

        // partial text is not retracted
        assert_eq!(events[1], StreamEvent::content("Processing..."));
        assert_eq!(
            events[2],
            StreamEvent::error(StreamError::Provider("Rate limited".to_string()))
        );
        assert_eq!(events.len(), 3);
        assert!(stream.result().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_during_delay() {
        let cancel = CancellationToken::new();
        let config = MockConfig::new().with_responses(vec![
            MockResponse::Text {
                content: "a".to_string(),
            },
            MockResponse::Delay { ms: 60_000 },
            MockResponse::Text {
                content: "never".to_string(),
            },
        ]);
        let mut stream = run_with(config, StreamOptions::new().with_cancel(cancel.clone()));

        assert!(matches!(
            stream.next_event().await,
            Some(StreamEvent::MessageStart { .. })
        ));
        assert_eq!(stream.next_event().await, Some(StreamEvent::content("a")));
        cancel.cancel();
        assert_eq!(
            stream.next_event().await,
            Some(StreamEvent::error(StreamError::Cancelled))
        );
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test]
    async fn chunk_delay_is_applied() {
        let config = fixtures::streaming_text(&["a", "b"]).with_chunk_delay(20);
        let start = std::time::Instant::now();
        run(config).collect_result().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
