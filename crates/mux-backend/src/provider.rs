//! The adapter trait and the read loop every adapter shares.

use std::future::Future;

use futures::{Stream, StreamExt};
use mux_protocol::{AssistantMessage, Context, StreamError, StreamEvent};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stream::{EventStream, StreamSender, DEFAULT_QUEUE_CAPACITY};
use crate::transport::TransportConfig;

/// Vendor identifiers used as registry keys.
pub mod api {
    pub const OPENAI_COMPLETIONS: &str = "openai-completions";
    pub const GOOGLE_VERTEX: &str = "google-vertex";
    pub const ANTHROPIC_MESSAGES: &str = "anthropic-messages";
    pub const MOCK: &str = "mock";
}

/// Per-call settings supplied by the caller.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Extra request headers, applied after the adapter's own.
    pub headers: Vec<(String, String)>,
    pub cancel: CancellationToken,
    pub queue_capacity: usize,
    pub transport: TransportConfig,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            max_tokens: None,
            temperature: None,
            headers: Vec::new(),
            cancel: CancellationToken::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            transport: TransportConfig::default(),
        }
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

/// One LLM API family.
pub trait Provider: Send + Sync {
    /// Registry identifier, e.g. `"openai-completions"`.
    fn api(&self) -> &str;

    /// Start a streaming call.
    ///
    /// Returns at once; the request runs on a spawned task, so this must be
    /// called from within a Tokio runtime. The returned stream always
    /// completes, whether the call succeeds, fails or is cancelled.
    fn stream(&self, model: &str, context: &Context, options: StreamOptions) -> EventStream;
}

/// Create an event stream and run `work` on a new task to produce it.
pub(crate) fn spawn_stream<F, Fut>(queue_capacity: usize, work: F) -> EventStream
where
    F: FnOnce(StreamSender) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, stream) = EventStream::channel(queue_capacity);
    tokio::spawn(work(tx));
    stream
}

/// What the read loop should do after a chunk.
#[derive(Debug, PartialEq)]
pub(crate) enum Flow {
    Continue,
    /// A finish reason or terminator was seen. Stop reading now, even if the
    /// server keeps the connection open.
    Done,
    Failed(StreamError),
}

#[derive(Debug)]
pub(crate) struct Step {
    pub events: Vec<StreamEvent>,
    pub flow: Flow,
}

impl Step {
    pub fn next(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            flow: Flow::Continue,
        }
    }

    pub fn done(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            flow: Flow::Done,
        }
    }

    pub fn failed(events: Vec<StreamEvent>, error: StreamError) -> Self {
        Self {
            events,
            flow: Flow::Failed(error),
        }
    }
}

/// Turns vendor chunks into normalized events.
pub(crate) trait ChunkProcessor<T> {
    fn process(&mut self, chunk: T) -> Step;

    /// The closing events and the final message.
    fn finish(self) -> (AssistantMessage, Vec<StreamEvent>);
}

/// Send events in order. `false` once the consumer is gone.
pub(crate) async fn emit(tx: &StreamSender, events: Vec<StreamEvent>) -> bool {
    for event in events {
        if !tx.send(event).await {
            return false;
        }
    }
    true
}

/// Read `source` to completion through `processor` and complete `tx`.
///
/// Ends on a terminator or finish reason, end of input, a source error, a
/// vendor error, or cancellation. Every exit completes the stream exactly
/// once, and the source is dropped before completion so an idle connection
/// is closed rather than waited on.
pub(crate) async fn drive<S, T, E, P>(
    tx: &StreamSender,
    mut source: S,
    mut processor: P,
    cancel: &CancellationToken,
) where
    S: Stream<Item = Result<T, E>> + Unpin,
    StreamError: From<E>,
    P: ChunkProcessor<T>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(source);
                tx.finish_with_error(StreamError::Cancelled).await;
                return;
            }
            next = source.next() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                drop(source);
                tx.finish_with_error(StreamError::from(e)).await;
                return;
            }
            None => {
                debug!("stream ended without a terminator");
                break;
            }
        };

        let step = processor.process(chunk);
        if !emit(tx, step.events).await {
            debug!("consumer went away, abandoning stream");
            tx.finish(AssistantMessage::default());
            return;
        }
        match step.flow {
            Flow::Continue => {}
            Flow::Done => break,
            Flow::Failed(error) => {
                drop(source);
                tx.finish_with_error(error).await;
                return;
            }
        }
    }

    drop(source);
    let (message, events) = processor.finish();
    emit(tx, events).await;
    tx.finish(message);
}
