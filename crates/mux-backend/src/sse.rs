//! Server-Sent Events (SSE) frame reader.
//!
//! Parses a byte stream into frames following the W3C event-stream format:
//! `field: value` lines, `:` comments, and a blank line closing each frame.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use mux_protocol::StreamError;
use thiserror::Error;

/// Longest physical line accepted before the reader gives up.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const INITIAL_BUFFER_BYTES: usize = 8 * 1024;
const MAX_POOLED_BUFFERS: usize = 64;
// Buffers that grew past this are dropped instead of pooled.
const MAX_POOLED_CAPACITY: usize = 64 * 1024;

static BUFFER_POOL: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

fn acquire_buffer() -> BytesMut {
    BUFFER_POOL
        .lock()
        .ok()
        .and_then(|mut pool| pool.pop())
        .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_BUFFER_BYTES))
}

fn release_buffer(mut buf: BytesMut) {
    if buf.capacity() > MAX_POOLED_CAPACITY {
        return;
    }
    buf.clear();
    if let Ok(mut pool) = BUFFER_POOL.lock() {
        if pool.len() < MAX_POOLED_BUFFERS {
            pool.push(buf);
        }
    }
}

/// One parsed SSE frame. Absent fields are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// The `event:` field.
    pub event_type: String,
    /// All `data:` lines of the frame joined with `\n`.
    pub data: String,
    /// The `id:` field.
    pub id: String,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream read error: {0}")]
    Body(String),
    #[error("SSE line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

impl From<FrameError> for StreamError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Body(msg) => StreamError::Transport(msg),
            FrameError::LineTooLong { .. } => StreamError::Decode(err.to_string()),
        }
    }
}

/// Accumulates the fields of the frame currently being read.
#[derive(Default)]
struct FrameBuilder {
    event_type: String,
    id: String,
    /// Data lines, joined only when the frame closes.
    data: Vec<String>,
    has_content: bool,
}

impl FrameBuilder {
    /// Process one line (without its terminator). Returns a frame when a
    /// blank line closes one that has content.
    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.take();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => {
                self.event_type = value.to_string();
                self.has_content = true;
            }
            "data" => {
                self.data.push(value.to_string());
                self.has_content = true;
            }
            "id" => {
                self.id = value.to_string();
                self.has_content = true;
            }
            // retry and unknown fields
            _ => {}
        }

        None
    }

    fn take(&mut self) -> Option<Frame> {
        if !self.has_content {
            return None;
        }
        self.has_content = false;
        let frame = Frame {
            event_type: std::mem::take(&mut self.event_type),
            data: self.data.join("\n"),
            id: std::mem::take(&mut self.id),
        };
        self.data.clear();
        Some(frame)
    }
}

/// Stream wrapper that parses SSE frames from a byte stream.
///
/// Yields `Ok(frame)` per frame, at most one `Err`, then `None` forever.
pub struct FrameReader<S> {
    inner: S,
    buf: BytesMut,
    builder: FrameBuilder,
    pending: VecDeque<Frame>,
    /// Reported once the frames parsed before it have been yielded.
    deferred_error: Option<FrameError>,
    /// The previous chunk ended in `\r`; a leading `\n` belongs to it.
    skip_lf: bool,
    finished: bool,
}

impl<S> FrameReader<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: acquire_buffer(),
            builder: FrameBuilder::default(),
            pending: VecDeque::new(),
            deferred_error: None,
            skip_lf: false,
            finished: false,
        }
    }

    /// Split every complete line out of `buf` and feed it to the builder.
    fn drain_lines(&mut self) -> Result<(), FrameError> {
        loop {
            if self.skip_lf {
                match self.buf.first() {
                    None => return Ok(()),
                    Some(b'\n') => self.buf.advance(1),
                    Some(_) => {}
                }
                self.skip_lf = false;
            }

            let Some(end) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                if self.buf.len() > MAX_LINE_BYTES {
                    return Err(FrameError::LineTooLong {
                        limit: MAX_LINE_BYTES,
                    });
                }
                return Ok(());
            };
            if end > MAX_LINE_BYTES {
                return Err(FrameError::LineTooLong {
                    limit: MAX_LINE_BYTES,
                });
            }

            let line = String::from_utf8_lossy(&self.buf[..end]);
            if let Some(frame) = self.builder.process_line(&line) {
                self.pending.push_back(frame);
            }
            self.skip_lf = self.buf[end] == b'\r';
            self.buf.advance(end + 1);
        }
    }

    /// Flush an unterminated trailing line and frame at end of input.
    fn finish_input(&mut self) {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            if let Some(frame) = self.builder.process_line(&line) {
                self.pending.push_back(frame);
            }
        }
        if let Some(frame) = self.builder.take() {
            self.pending.push_back(frame);
        }
    }
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    /// Read the next frame. `Ok(None)` means the stream has ended.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        self.next().await.transpose()
    }
}

impl<S> Drop for FrameReader<S> {
    fn drop(&mut self) {
        release_buffer(std::mem::take(&mut self.buf));
    }
}

impl<S, E> Stream for FrameReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Frame, FrameError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if let Some(e) = this.deferred_error.take() {
                this.finished = true;
                return Poll::Ready(Some(Err(e)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buf.extend_from_slice(&bytes);
                    if let Err(e) = this.drain_lines() {
                        this.buf.clear();
                        this.deferred_error = Some(e);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(FrameError::Body(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.finish_input();
                    this.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Create a frame reader over a byte stream.
pub fn frame_reader<S, E>(stream: S) -> FrameReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    FrameReader::new(stream)
}
