//! Shared streaming lifecycle: a cold producer task, a single bounded
//! channel, and a cancellation token tying the two together.
//!
//! Adapters spawn their SSE forwarder through [`spawn_producer`]; the
//! returned [`ChunkStream`] is consumed by the dispatcher. Whichever side
//! terminates first - upstream exhaustion, caller close, or client
//! disconnect (stream drop) - the producer future is dropped exactly once,
//! which closes the upstream connection exactly once. Chunks are delivered
//! in producer order through a capacity-1 channel.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::openai::{ChatChunk, SSE_DONE};
use crate::providers::AdapterError;

type ChunkResult = Result<ChatChunk, AdapterError>;

/// Producer half: adapters push chunks through this.
pub struct ChunkSender {
    tx: mpsc::Sender<ChunkResult>,
    cancel: CancellationToken,
}

impl ChunkSender {
    /// Send one chunk downstream. Returns `false` when the consumer is gone
    /// or the stream was closed; producers should stop promptly.
    pub async fn send(&self, item: ChunkResult) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(item).await.is_ok()
    }
}

/// Consumer half handed to the dispatcher.
pub struct ChunkStream {
    rx: mpsc::Receiver<ChunkResult>,
    cancel: CancellationToken,
}

impl ChunkStream {
    /// Next chunk in producer order; `None` once the producer has finished.
    pub async fn next_chunk(&mut self) -> Option<ChunkResult> {
        self.rx.recv().await
    }

    /// Tear the stream down early. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        // Client disconnects surface as a stream drop; stop the producer.
        self.cancel.cancel();
    }
}

/// Spawn a producer future wired to a fresh channel.
///
/// The future runs inside a `select!` against the cancellation token, so a
/// consumer-side close drops it at its next await point - taking the
/// upstream connection it owns down with it.
pub fn spawn_producer<F, Fut>(producer: F) -> ChunkStream
where
    F: FnOnce(ChunkSender) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let sender = ChunkSender {
        tx,
        cancel: cancel.clone(),
    };
    let task_cancel = cancel.clone();
    let fut = producer(sender);
    tokio::spawn(async move {
        tokio::select! {
            _ = task_cancel.cancelled() => {}
            _ = fut => {}
        }
    });

    ChunkStream { rx, cancel }
}

/// Incremental server-sent-events parser.
///
/// Feed raw bytes, get back completed `data:` payloads. Multi-line data
/// fields are joined with `\n` per the SSE spec; comment and other fields
/// are ignored.
#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            let Some(boundary) = find_event_boundary(&self.buf) else {
                break;
            };
            let (event_bytes, sep_len) = boundary;
            let event: Vec<u8> = self.buf.drain(..event_bytes + sep_len).take(event_bytes).collect();

            let text = String::from_utf8_lossy(&event);
            let mut data_lines = Vec::new();
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            if !data_lines.is_empty() {
                events.push(data_lines.join("\n"));
            }
        }

        events
    }
}

/// Locate the first `\n\n` or `\r\n\r\n` event separator.
fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

/// Forward an upstream SSE response as [`ChatChunk`]s until `[DONE]`,
/// stream end, or consumer close.
///
/// The `reqwest::Response` is owned here, so the connection closes when
/// this future completes or is dropped - never twice.
pub async fn forward_sse(response: reqwest::Response, sender: ChunkSender) {
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = if e.is_timeout() {
                    AdapterError::Timeout
                } else {
                    AdapterError::Connection(e.to_string())
                };
                let _ = sender.send(Err(err)).await;
                return;
            }
        };

        for payload in parser.push(&bytes) {
            if payload == SSE_DONE {
                return;
            }
            match serde_json::from_str::<ChatChunk>(&payload) {
                Ok(chunk) => {
                    if !sender.send(Ok(chunk)).await {
                        return;
                    }
                }
                Err(e) => {
                    // Tolerate frames we do not model (pings, annotations)
                    tracing::debug!("skipping unparseable SSE frame: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::Usage;
    use std::time::Duration;

    #[test]
    fn test_sse_parser_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"x\":1}\n\n");
        assert_eq!(events, vec!["{\"x\":1}"]);
    }

    #[test]
    fn test_sse_parser_split_across_pushes() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"x\"").is_empty());
        assert!(parser.push(b":1}").is_empty());
        let events = parser.push(b"\n\n");
        assert_eq!(events, vec!["{\"x\":1}"]);
    }

    #[test]
    fn test_sse_parser_multiple_events_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: one\r\n\r\ndata: two\n\n");
        assert_eq!(events, vec!["one", "two"]);
    }

    #[test]
    fn test_sse_parser_joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(events, vec!["line1\nline2"]);
    }

    #[test]
    fn test_sse_parser_ignores_comments_and_fields() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\nevent: message\ndata: payload\n\n");
        assert_eq!(events, vec!["payload"]);
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_producer_order() {
        let mut stream = spawn_producer(|sender| async move {
            for i in 0..5 {
                let chunk = ChatChunk::content_delta("m", "chatcmpl-1", format!("part{i}"));
                if !sender.send(Ok(chunk)).await {
                    return;
                }
            }
        });

        let mut seen = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            seen.push(chunk.unwrap().text().to_string());
        }
        assert_eq!(seen, vec!["part0", "part1", "part2", "part3", "part4"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_close_stops_producer() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        let mut stream = spawn_producer(|sender| async move {
            // Keep the signal handle alive: dropped only when this future drops
            let _done_tx = done_tx;
            let mut i = 0u64;
            loop {
                let chunk = ChatChunk::content_delta("m", "chatcmpl-1", i.to_string());
                if !sender.send(Ok(chunk)).await {
                    return;
                }
                i += 1;
            }
        });

        // Pull a few chunks, then hang up
        for _ in 0..3 {
            assert!(stream.next_chunk().await.is_some());
        }
        stream.close();

        // Producer future must be dropped (oneshot sender closed) promptly
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("producer did not stop after close")
            .expect_err("producer should have been dropped, not completed");
    }

    #[test_log::test(tokio::test)]
    async fn test_drop_cancels_producer() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let stream = spawn_producer(|sender| async move {
            let _done_tx = done_tx;
            loop {
                let chunk = ChatChunk::usage_only("m", "chatcmpl-1", Usage::new(1, 1));
                if !sender.send(Ok(chunk)).await {
                    return;
                }
            }
        });
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("producer did not stop after drop")
            .expect_err("producer should have been dropped");
    }
}
