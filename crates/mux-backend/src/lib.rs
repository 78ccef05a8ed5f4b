//! mux-backend: streaming LLM provider adapters.
//!
//! Each adapter turns one vendor's streaming HTTP API into the normalized
//! [`StreamEvent`](mux_protocol::StreamEvent) sequence, delivered through an
//! [`EventStream`] that always completes exactly once. Adapters are looked up
//! by API identifier in a [`ProviderRegistry`].

pub mod accumulate;
pub mod anthropic;
pub mod json_stream;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod sse;
pub mod stream;
pub mod transport;
pub mod vertex;

pub use accumulate::{MessageAccumulator, ToolCallAccumulator};
pub use anthropic::AnthropicProvider;
pub use mock::{MockConfig, MockProvider, MockResponse};
pub use openai::OpenAiProvider;
pub use provider::{api, Provider, StreamOptions};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use sse::{frame_reader, Frame, FrameReader};
pub use stream::{EventStream, StreamSender};
pub use transport::{
    normalize_base_url, HttpTransport, RequestBody, RetryPolicy, TransportConfig, TransportError,
};
pub use vertex::VertexProvider;
