use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use gatekeeper_protocol::sse::SseParser;
use serde_json::Value as JsonValue;

use crate::event::UpstreamEvent;

const DONE_SENTINEL: &str = "[DONE]";

/// Adapts a raw upstream byte stream into [`UpstreamEvent`]s using the
/// `data: {json}\n\n` / `data: [DONE]\n\n` contract. JSON decode errors on
/// individual frames are skipped rather than ending the stream, since
/// vendors occasionally interleave non-JSON keep-alive lines.
pub struct SseEventStream<S> {
    inner: S,
    parser: SseParser,
    pending: VecDeque<UpstreamEvent>,
    done: bool,
}

impl<S> SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn drain_parsed(&mut self, chunk: &Bytes) {
        for event in self.parser.push_bytes(chunk) {
            if event.data == DONE_SENTINEL {
                self.pending.push_back(UpstreamEvent::Done);
                continue;
            }
            match serde_json::from_str::<JsonValue>(&event.data) {
                Ok(value) => self.pending.push_back(UpstreamEvent::Data(value)),
                Err(_) => continue,
            }
        }
    }
}

impl<S> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = UpstreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.drain_parsed(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    self.done = true;
                    return Poll::Ready(Some(UpstreamEvent::Error {
                        status: 0,
                        body: serde_json::json!({"error": {"message": err.to_string()}}),
                    }));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    for event in self.parser.finish() {
                        if event.data == DONE_SENTINEL {
                            self.pending.push_back(UpstreamEvent::Done);
                        } else if let Ok(value) = serde_json::from_str::<JsonValue>(&event.data) {
                            self.pending.push_back(UpstreamEvent::Data(value));
                        }
                    }
                    if self.pending.is_empty() {
                        return Poll::Ready(None);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn decodes_data_frames_then_done() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"usage\":{\"total_tokens\":5}}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let mut events = SseEventStream::new(stream::iter(chunks));
        match events.next().await.unwrap() {
            UpstreamEvent::Data(v) => assert_eq!(v["usage"]["total_tokens"], 5),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events.next().await.unwrap(), UpstreamEvent::Done));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn skips_undecodable_frames() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b": keep-alive\n\n")),
            Ok(Bytes::from_static(b"data: not json\n\n")),
            Ok(Bytes::from_static(b"data: {\"a\":1}\n\n")),
        ];
        let mut events = SseEventStream::new(stream::iter(chunks));
        match events.next().await.unwrap() {
            UpstreamEvent::Data(v) => assert_eq!(v["a"], 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.next().await.is_none());
    }
}
