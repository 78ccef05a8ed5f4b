//! Incremental splitter for streams of JSON objects.
//!
//! Vertex streams `streamGenerateContent` as one JSON array whose elements
//! arrive over time: `[{...}\r\n,{...}\r\n]`. Other servers send bare
//! concatenated or newline-delimited objects. The decoder handles both by
//! skipping anything between top-level objects.

use std::pin::Pin;

use async_stream::try_stream;
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use mux_protocol::StreamError;
use thiserror::Error;
use tracing::debug;

pub const MAX_OBJECT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum JsonStreamError {
    #[error("stream read error: {0}")]
    Body(String),
    #[error("JSON object exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl From<JsonStreamError> for StreamError {
    fn from(err: JsonStreamError) -> Self {
        match err {
            JsonStreamError::Body(msg) => StreamError::Transport(msg),
            JsonStreamError::TooLarge { .. } => StreamError::Decode(err.to_string()),
        }
    }
}

/// Splits buffered bytes into complete top-level JSON objects.
///
/// Only brace/bracket depth and string state are tracked; each object is
/// handed on as raw bytes and parsed by the caller.
#[derive(Debug, Default)]
pub struct JsonObjectDecoder {
    buf: BytesMut,
    /// Scan position within `buf`.
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// The next complete object, or `None` if more input is needed.
    pub fn decode(&mut self) -> Result<Option<Bytes>, JsonStreamError> {
        while self.pos < self.buf.len() {
            let byte = self.buf[self.pos];
            self.pos += 1;

            if self.depth == 0 {
                // Array brackets, commas, whitespace and stray bytes between objects.
                if byte == b'{' {
                    self.buf.advance(self.pos - 1);
                    self.pos = 1;
                    self.depth = 1;
                }
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let object = self.buf.split_to(self.pos).freeze();
                        self.pos = 0;
                        return Ok(Some(object));
                    }
                }
                _ => {}
            }
        }

        if self.depth == 0 {
            self.buf.clear();
            self.pos = 0;
        } else if self.buf.len() > MAX_OBJECT_BYTES {
            return Err(JsonStreamError::TooLarge {
                limit: MAX_OBJECT_BYTES,
            });
        }
        Ok(None)
    }

    /// Whether an object has started but not finished.
    pub fn has_partial(&self) -> bool {
        self.depth > 0
    }
}

pub type JsonObjectStream = Pin<Box<dyn Stream<Item = Result<Bytes, JsonStreamError>> + Send>>;

/// Yield each complete top-level JSON object from a byte stream.
///
/// A trailing incomplete object at end of input is dropped.
pub fn json_objects<S, E>(input: S) -> JsonObjectStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(try_stream! {
        let mut input = input;
        let mut decoder = JsonObjectDecoder::new();
        while let Some(chunk) = input.next().await {
            let chunk = chunk.map_err(|e| JsonStreamError::Body(e.to_string()))?;
            decoder.push(&chunk);
            while let Some(object) = decoder.decode()? {
                yield object;
            }
        }
        if decoder.has_partial() {
            debug!("dropping truncated JSON object at end of stream");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(parts: &[&'static str]) -> Vec<String> {
        json_objects(chunks(parts))
            .map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn splits_array_elements() {
        let objects = collect(&["[{\"a\":1}\r\n,{\"b\":[2,3]}\r\n]"]).await;
        assert_eq!(objects, vec![r#"{"a":1}"#, r#"{"b":[2,3]}"#]);
    }

    #[tokio::test]
    async fn objects_split_across_chunks() {
        let objects = collect(&["[{\"text\":\"he", "llo\"},", "{\"n\"", ":1}]"]).await;
        assert_eq!(objects, vec![r#"{"text":"hello"}"#, r#"{"n":1}"#]);
    }

    #[tokio::test]
    async fn braces_inside_strings_are_ignored() {
        let objects = collect(&[r#"{"s":"}{ \" ]["}"#, "\n", r#"{"t":"\\"}"#]).await;
        assert_eq!(objects, vec![r#"{"s":"}{ \" ]["}"#, r#"{"t":"\\"}"#]);
    }

    #[tokio::test]
    async fn newline_delimited_objects() {
        let objects = collect(&["{\"a\":1}\n{\"a\":2}\n"]).await;
        assert_eq!(objects.len(), 2);
    }

    #[tokio::test]
    async fn truncated_object_is_dropped() {
        let objects = collect(&["[{\"a\":1},{\"b\":"]).await;
        assert_eq!(objects, vec![r#"{"a":1}"#]);
    }

    #[tokio::test]
    async fn empty_input() {
        assert!(collect(&[]).await.is_empty());
        assert!(collect(&["[]"]).await.is_empty());
    }

    #[tokio::test]
    async fn body_error_ends_stream() {
        let input = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"a\":1}")),
            Err(std::io::Error::other("reset")),
        ]);
        let items: Vec<_> = json_objects(input).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(JsonStreamError::Body(_))));
    }

    #[test]
    fn decoder_waits_for_more_input() {
        let mut decoder = JsonObjectDecoder::new();
        decoder.push(b"{\"a\":");
        assert!(decoder.decode().unwrap().is_none());
        assert!(decoder.has_partial());
        decoder.push(b"1}");
        assert_eq!(decoder.decode().unwrap().unwrap(), Bytes::from_static(b"{\"a\":1}"));
        assert!(!decoder.has_partial());
    }
}
