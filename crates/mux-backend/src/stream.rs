//! Event stream with a single, exactly-once completion.
//!
//! A producer task pushes [`StreamEvent`]s through a bounded queue and calls
//! [`StreamSender::finish`] once with the final [`AssistantMessage`]. The
//! consumer iterates [`EventStream`] and then awaits [`EventStream::result`].
//!
//! Completion order is: store the result, fire the done signal, close the
//! queue. A consumer that drained the events to the end therefore never
//! waits in `result()`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use mux_protocol::{AssistantMessage, StreamError, StreamEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct Shared {
    /// `None` once the queue has been closed.
    tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    done: CancellationToken,
    result: OnceLock<AssistantMessage>,
    finished: AtomicBool,
    /// Live `StreamSender` handles.
    senders: AtomicUsize,
}

/// Producer half. Cheap to clone; every clone shares one completion.
///
/// If the last handle is dropped without finishing, the stream is completed
/// with a `Provider` error and an empty message.
pub struct StreamSender {
    shared: Arc<Shared>,
}

/// Consumer half.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    /// Events pulled off the queue while waiting in `result()`.
    backlog: VecDeque<StreamEvent>,
    shared: Arc<Shared>,
}

impl EventStream {
    /// Create a connected sender/stream pair with a queue of `capacity` events.
    pub fn channel(capacity: usize) -> (StreamSender, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            tx: Mutex::new(Some(tx)),
            done: CancellationToken::new(),
            result: OnceLock::new(),
            finished: AtomicBool::new(false),
            senders: AtomicUsize::new(1),
        });
        (
            StreamSender {
                shared: Arc::clone(&shared),
            },
            EventStream {
                rx,
                backlog: VecDeque::new(),
                shared,
            },
        )
    }

    /// Next event, or `None` once the stream finished and the queue drained.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Wait for completion and return the final message.
    ///
    /// Events still queued are moved to an internal backlog so a producer
    /// blocked on a full queue can make progress; they remain available
    /// from [`EventStream::next_event`] afterwards.
    pub async fn result(&mut self) -> AssistantMessage {
        while !self.shared.done.is_cancelled() {
            tokio::select! {
                biased;
                _ = self.shared.done.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.backlog.push_back(event),
                    None => break,
                },
            }
        }
        self.shared.done.cancelled().await;
        self.shared.result.get().cloned().unwrap_or_default()
    }

    /// Discard remaining events and return the final message.
    pub async fn collect_result(mut self) -> AssistantMessage {
        while self.next_event().await.is_some() {}
        self.result().await
    }

    /// Resolves once the stream has finished.
    pub async fn done(&self) {
        self.shared.done.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.is_cancelled()
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.backlog.pop_front() {
            return Poll::Ready(Some(event));
        }
        self.rx.poll_recv(cx)
    }
}

impl Clone for StreamSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for StreamSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) != 1 || !self.claim() {
            return;
        }
        if let Some(tx) = self.sender() {
            let _ = tx.try_send(StreamEvent::error(StreamError::Provider(
                "stream producer exited without finishing".to_string(),
            )));
        }
        self.complete(AssistantMessage::default());
    }
}

impl StreamSender {
    fn sender(&self) -> Option<mpsc::Sender<StreamEvent>> {
        self.shared
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue one event, waiting while the queue is full.
    ///
    /// Returns `false` if the stream already finished or the consumer went
    /// away; the event is dropped in that case.
    pub async fn send(&self, event: StreamEvent) -> bool {
        if self.shared.done.is_cancelled() {
            return false;
        }
        let Some(tx) = self.sender() else {
            return false;
        };
        tokio::select! {
            biased;
            _ = self.shared.done.cancelled() => false,
            sent = tx.send(event) => sent.is_ok(),
        }
    }

    /// Complete the stream with `result`. Only the first completion call
    /// (this or [`StreamSender::finish_with_error`]) has any effect; it
    /// returns `true`.
    pub fn finish(&self, result: AssistantMessage) -> bool {
        if !self.claim() {
            return false;
        }
        self.complete(result);
        true
    }

    /// Emit one `Error` event, then finish with an empty message.
    pub async fn finish_with_error(&self, error: StreamError) -> bool {
        if !self.claim() {
            return false;
        }
        self.send(StreamEvent::error(error)).await;
        self.complete(AssistantMessage::default());
        true
    }

    fn claim(&self) -> bool {
        !self.shared.finished.swap(true, Ordering::AcqRel)
    }

    fn complete(&self, result: AssistantMessage) {
        let _ = self.shared.result.set(result);
        self.shared.done.cancel();
        let tx = self
            .shared
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Resolves once the stream has finished.
    pub async fn done(&self) {
        self.shared.done.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mux_protocol::{ContentBlock, StopReason};
    use std::time::Duration;
    use tokio::time::timeout;

    fn message(text: &str) -> AssistantMessage {
        AssistantMessage {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            ..AssistantMessage::default()
        }
    }

    #[tokio::test]
    async fn events_arrive_in_order_then_close() {
        let (tx, mut stream) = EventStream::channel(8);
        tokio::spawn(async move {
            for word in ["a", "b", "c"] {
                assert!(tx.send(StreamEvent::content(word)).await);
            }
            tx.finish(message("abc"));
        });

        let events: Vec<_> = (&mut stream).collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::content("a"),
                StreamEvent::content("b"),
                StreamEvent::content("c"),
            ]
        );
        assert_eq!(stream.result().await.text(), "abc");
    }

    #[tokio::test]
    async fn first_finish_wins() {
        let (tx, mut stream) = EventStream::channel(4);
        assert!(tx.finish(message("first")));
        assert!(!tx.finish(message("second")));
        assert!(!tx.finish_with_error(StreamError::Cancelled).await);
        assert_eq!(stream.result().await.text(), "first");
    }

    #[tokio::test]
    async fn send_after_finish_returns_false() {
        let (tx, mut stream) = EventStream::channel(4);
        tx.finish(AssistantMessage::default());
        assert!(!tx.send(StreamEvent::Ping).await);
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test]
    async fn finish_with_error_sends_one_error_and_empty_result() {
        let (tx, stream) = EventStream::channel(4);
        assert!(tx.send(StreamEvent::content("partial")).await);
        assert!(
            tx.finish_with_error(StreamError::Transport("reset".to_string()))
                .await
        );

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::content("partial"));
        assert_eq!(
            events[1],
            StreamEvent::error(StreamError::Transport("reset".to_string()))
        );
    }

    #[tokio::test]
    async fn result_waits_for_finish() {
        let (tx, mut stream) = EventStream::channel(4);
        assert!(timeout(Duration::from_millis(20), stream.result())
            .await
            .is_err());
        assert!(!stream.is_done());

        tx.finish(AssistantMessage {
            stop_reason: StopReason::MaxTokens,
            ..AssistantMessage::default()
        });
        assert!(stream.is_done());
        let result = timeout(Duration::from_secs(1), stream.result())
            .await
            .expect("result after finish");
        assert_eq!(result.stop_reason, StopReason::MaxTokens);
    }

    #[tokio::test]
    async fn drained_consumer_never_blocks_on_result() {
        let (tx, mut stream) = EventStream::channel(2);
        tokio::spawn(async move {
            for _ in 0..10 {
                tx.send(StreamEvent::Ping).await;
            }
            tx.finish(message("done"));
        });

        let mut count = 0;
        while stream.next_event().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
        let result = timeout(Duration::from_millis(50), stream.result())
            .await
            .expect("result must be ready once the queue closed");
        assert_eq!(result.text(), "done");
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let (tx, mut stream) = EventStream::channel(1);
        assert!(tx.send(StreamEvent::Ping).await);

        let blocked = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.send(StreamEvent::content("second")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(stream.next_event().await, Some(StreamEvent::Ping));
        assert!(blocked.await.unwrap());
        assert_eq!(stream.next_event().await, Some(StreamEvent::content("second")));
    }

    #[tokio::test]
    async fn blocked_send_is_released_by_finish() {
        let (tx, stream) = EventStream::channel(1);
        assert!(tx.send(StreamEvent::Ping).await);

        let blocked = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.send(StreamEvent::Ping).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.finish(AssistantMessage::default());

        let sent = timeout(Duration::from_secs(1), blocked)
            .await
            .expect("send must not hang after finish")
            .unwrap();
        assert!(!sent);
        assert_eq!(stream.collect_result().await, AssistantMessage::default());
    }

    #[tokio::test]
    async fn dropped_consumer_makes_send_fail() {
        let (tx, stream) = EventStream::channel(1);
        drop(stream);
        assert!(!tx.send(StreamEvent::Ping).await);
        assert!(tx.finish(AssistantMessage::default()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finishers_complete_once() {
        let (tx, stream) = EventStream::channel(4);
        let mut handles = Vec::new();
        for i in 0..16 {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    tx.finish(message(&i.to_string()))
                } else {
                    tx.finish_with_error(StreamError::Cancelled).await
                }
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let _ = stream.collect_result().await;
    }

    #[tokio::test]
    async fn result_keeps_events_it_pulled_off_a_full_queue() {
        let (tx, mut stream) = EventStream::channel(1);
        tokio::spawn(async move {
            for word in ["x", "y", "z"] {
                tx.send(StreamEvent::content(word)).await;
            }
            tx.finish(message("xyz"));
        });

        let result = timeout(Duration::from_secs(1), stream.result())
            .await
            .expect("result must not deadlock on a full queue");
        assert_eq!(result.text(), "xyz");

        let events: Vec<_> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::content("x"),
                StreamEvent::content("y"),
                StreamEvent::content("z"),
            ]
        );
    }

    #[tokio::test]
    async fn dropping_every_sender_completes_with_error() {
        let (tx, mut stream) = EventStream::channel(4);
        let extra = tx.clone();
        drop(tx);
        assert!(!stream.is_done());
        drop(extra);

        assert!(stream.is_done());
        assert!(matches!(
            stream.next_event().await,
            Some(StreamEvent::Error {
                error: StreamError::Provider(_)
            })
        ));
        assert_eq!(stream.next_event().await, None);
        assert_eq!(stream.result().await, AssistantMessage::default());
    }
}
