//! One-shot streaming of a prompt to stdout.
//!
//! Answer text goes to stdout as it arrives. Thinking, tool calls, the final
//! summary and errors go to stderr, so stdout can be piped cleanly.

use std::io::Write;
use std::time::Instant;

use futures::StreamExt;
use mux_backend::EventStream;
use mux_protocol::{StreamError, StreamEvent};
use tracing::debug;

/// Exit status when the stream was cancelled with Ctrl-C.
pub const EXIT_CANCELLED: i32 = 130;

/// Writes stream events to an output and a diagnostics writer.
pub struct BatchOutput<O: Write, E: Write> {
    out: O,
    err: E,
    in_thinking: bool,
    wrote_text: bool,
    start_time: Instant,
}

impl<O: Write, E: Write> BatchOutput<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            in_thinking: false,
            wrote_text: false,
            start_time: Instant::now(),
        }
    }

    fn end_thinking(&mut self) {
        if self.in_thinking {
            let _ = writeln!(self.err);
            self.in_thinking = false;
        }
    }

    /// Render one event. Write failures are ignored; a closed pipe should
    /// not abort the stream.
    pub fn emit(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { model } => {
                debug!(%model, "message started");
            }
            StreamEvent::ThinkingDelta { text } => {
                if !self.in_thinking {
                    let _ = write!(self.err, "[llmux] thinking: ");
                    self.in_thinking = true;
                }
                let _ = write!(self.err, "{text}");
                let _ = self.err.flush();
            }
            StreamEvent::ContentDelta { text } => {
                self.end_thinking();
                let _ = write!(self.out, "{text}");
                let _ = self.out.flush();
                self.wrote_text = true;
            }
            StreamEvent::ToolUseStart { name, .. } => {
                self.end_thinking();
                let _ = writeln!(self.err, "[llmux] tool call: {name}");
            }
            StreamEvent::ToolUseDone {
                id,
                name,
                input_json,
            } => {
                let _ = writeln!(self.err, "[llmux] {name} ({id}) {input_json}");
            }
            StreamEvent::MessageDone { stop_reason, usage } => {
                self.end_thinking();
                if self.wrote_text {
                    let _ = writeln!(self.out);
                    let _ = self.out.flush();
                }
                let _ = writeln!(
                    self.err,
                    "[llmux] {stop_reason} · {} in / {} out tokens · {:.1}s",
                    usage.input_tokens,
                    usage.output_tokens,
                    self.start_time.elapsed().as_secs_f64()
                );
            }
            StreamEvent::Error { error } => {
                self.end_thinking();
                if self.wrote_text {
                    let _ = writeln!(self.out);
                    let _ = self.out.flush();
                }
                let _ = writeln!(self.err, "[llmux] error: {error}");
            }
            StreamEvent::ContentDone { .. }
            | StreamEvent::ToolUseDelta { .. }
            | StreamEvent::MessageDelta { .. }
            | StreamEvent::Ping => {}
        }
    }
}

/// Drain `stream` into `output`. Returns the process exit code.
pub async fn run_batch<O: Write, E: Write>(
    mut stream: EventStream,
    output: &mut BatchOutput<O, E>,
) -> i32 {
    let mut code = 0;
    while let Some(event) = stream.next().await {
        if let StreamEvent::Error { error } = &event {
            code = match error {
                StreamError::Cancelled => EXIT_CANCELLED,
                _ => 1,
            };
        }
        output.emit(&event);
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use mux_backend::mock::fixtures;
    use mux_backend::{MockProvider, Provider, StreamOptions};
    use mux_protocol::{Context, ConversationMessage};

    async fn run(config: mux_backend::MockConfig) -> (i32, String, String) {
        let context = Context::new(vec![ConversationMessage::user("hi")]);
        let stream = MockProvider::new(config).stream("mock-model", &context, StreamOptions::new());
        let mut output = BatchOutput::new(Vec::new(), Vec::new());
        let code = run_batch(stream, &mut output).await;
        (
            code,
            String::from_utf8(output.out).unwrap(),
            String::from_utf8(output.err).unwrap(),
        )
    }

    #[tokio::test]
    async fn text_goes_to_stdout() {
        let (code, out, err) = run(fixtures::streaming_text(&["Hello", " world"])).await;
        assert_eq!(code, 0);
        assert_eq!(out, "Hello world\n");
        assert!(err.contains("[llmux] end_turn"));
    }

    #[tokio::test]
    async fn thinking_goes_to_stderr() {
        let (_, out, err) = run(fixtures::thinking_then_text("hmm", "Answer")).await;
        assert_eq!(out, "Answer\n");
        assert!(err.starts_with("[llmux] thinking: hmm\n"));
    }

    #[tokio::test]
    async fn tool_calls_are_reported() {
        let (code, out, err) =
            run(fixtures::tool_call("Checking.", "weather", &[r#"{"city":"#, r#""Oslo"}"#])).await;
        assert_eq!(code, 0);
        assert_eq!(out, "Checking.\n");
        assert!(err.contains("[llmux] tool call: weather"));
        assert!(err.contains(r#"weather (call_mock_1) {"city":"Oslo"}"#));
        assert!(err.contains("tool_use"));
    }

    #[tokio::test]
    async fn error_exits_nonzero() {
        let (code, out, err) = run(fixtures::error_mid_stream("partial", "overloaded")).await;
        assert_eq!(code, 1);
        assert_eq!(out, "partial\n");
        assert!(err.contains("[llmux] error: provider error: overloaded"));
    }

    #[tokio::test]
    async fn echo_reports_usage() {
        let (_, out, err) = run(fixtures::echo("one two")).await;
        assert_eq!(out, "one two\n");
        assert!(err.contains("2 in / 2 out tokens"));
    }
}
