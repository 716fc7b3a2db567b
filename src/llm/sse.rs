// ABOUTME: SSE (Server-Sent Events) line-buffering decoder for upstream streaming responses
// ABOUTME: Handles partial lines across TCP boundaries and multiple events per chunk
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # SSE Stream Decoder
//!
//! A line-buffering decoder for the Server-Sent Events wire format used by
//! OpenAI-compatible streaming endpoints. Solves two correctness issues:
//!
//! 1. **Multiple events per TCP chunk**: When network buffers batch several SSE
//!    events into a single `bytes_stream()` chunk, all events are emitted.
//!
//! 2. **Partial JSON across TCP boundaries**: When a payload is split across two
//!    TCP chunks, the line buffer accumulates partial data until a complete line
//!    arrives.
//!
//! Malformed `data:` payloads are logged and skipped, never fatal. The
//! `data: [DONE]` sentinel terminates the decoded stream as a successful end.

use std::collections::VecDeque;
use std::mem;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::unfold;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use super::{DeltaEvent, DeltaStream};
use crate::errors::AppError;

/// A parsed SSE frame from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A `data:` payload with the JSON string (prefix stripped)
    Data(String),
    /// The `[DONE]` termination sentinel (OpenAI convention)
    Done,
}

/// Reassembles SSE lines from arbitrarily sliced network reads
///
/// The upstream writes one `data:` line per event, but `bytes_stream()` hands
/// back whatever the transport delivered: half a line, one line, or ten. The
/// buffer holds the unterminated tail between reads so frame extraction only
/// ever sees whole lines.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    /// Tail of the last read, up to but not including a `\n`
    buffer: String,
}

impl SseLineBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Absorb one network read and return the frames it completed
    ///
    /// Every `\n`-terminated line now available is parsed; whatever follows
    /// the last newline stays buffered for the next read.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        let text = String::from_utf8_lossy(bytes);
        self.buffer.push_str(&text);

        let mut frames = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_owned();
            self.buffer = self.buffer[newline_pos + 1..].to_owned();

            if let Some(frame) = Self::parse_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Drain the buffer once the transport closes
    ///
    /// A server that ends the stream without a final newline still gets its
    /// last line parsed.
    pub fn flush(&mut self) -> Vec<SseFrame> {
        let remaining = mem::take(&mut self.buffer);
        Self::parse_line(&remaining).into_iter().collect()
    }

    /// Classify one whole line
    ///
    /// Only `data:` lines become frames; separators, `: keep-alive` comments,
    /// and the `event:`/`id:`/`retry:` fields are dropped.
    fn parse_line(line: &str) -> Option<SseFrame> {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            return None;
        }

        if trimmed == "data: [DONE]" {
            return Some(SseFrame::Done);
        }

        if let Some(data) = trimmed.strip_prefix("data: ") {
            if !data.trim().is_empty() {
                return Some(SseFrame::Data(data.to_owned()));
            }
        }

        None
    }
}

// ============================================================================
// Upstream Chunk Decoding
// ============================================================================

/// Raw streaming chunk shape from the upstream wire
#[derive(Debug, Deserialize)]
struct WireChunk {
    id: Option<String>,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one `data:` payload into a delta event
///
/// Returns `None` for payloads that are not valid JSON, that lack the `id`
/// field, or that carry no choices. None of these abort the stream.
fn decode_data_payload(json_str: &str) -> Option<DeltaEvent> {
    let chunk: WireChunk = match serde_json::from_str(json_str) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!("Skipping malformed stream chunk: {e}");
            return None;
        }
    };

    let Some(id) = chunk.id else {
        debug!("Skipping stream chunk without id field");
        return None;
    };

    let choice = chunk.choices.into_iter().next()?;

    Some(DeltaEvent {
        id,
        created: chunk.created,
        model: chunk.model,
        content: choice.delta.content,
        finish_reason: choice.finish_reason,
    })
}

/// Internal state for the decode unfold
struct DecodeState {
    parser: SseLineBuffer,
    pending: VecDeque<Result<DeltaEvent, AppError>>,
    stream_ended: bool,
}

impl DecodeState {
    /// Queue the decoded events for a batch of SSE frames
    ///
    /// A `Done` sentinel marks the stream ended; frames after it are ignored.
    fn absorb(&mut self, frames: Vec<SseFrame>) {
        for frame in frames {
            if self.stream_ended {
                break;
            }
            match frame {
                SseFrame::Data(json_str) => {
                    if let Some(event) = decode_data_payload(&json_str) {
                        self.pending.push_back(Ok(event));
                    }
                }
                SseFrame::Done => {
                    self.stream_ended = true;
                }
            }
        }
    }
}

/// Decode a raw upstream byte stream into a stream of delta events
///
/// Lazy and single-pass: each poll either drains an already-decoded event or
/// reads the next TCP chunk. The stream terminates when the `[DONE]` sentinel
/// arrives or the byte stream closes, whichever comes first. A transport read
/// error is surfaced as the final item.
pub fn decode_delta_stream<S>(byte_stream: S) -> DeltaStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = DecodeState {
        parser: SseLineBuffer::new(),
        pending: VecDeque::new(),
        stream_ended: false,
    };

    let stream = unfold(
        (
            Box::pin(byte_stream)
                as Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
            state,
        ),
        |(mut byte_stream, mut state)| async move {
            loop {
                // Drain pending events first (multiple SSE events per TCP chunk)
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, (byte_stream, state)));
                }

                if state.stream_ended {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        let frames = state.parser.feed(&bytes);
                        state.absorb(frames);
                        // Loop to drain pending events
                    }
                    Some(Err(e)) => {
                        state.stream_ended = true;
                        return Some((
                            Err(AppError::external_service(
                                "upstream",
                                format!("Stream read error: {e}"),
                            )),
                            (byte_stream, state),
                        ));
                    }
                    None => {
                        // Byte stream ended without [DONE]; flush the partial tail
                        let frames = state.parser.flush();
                        state.stream_ended = true;
                        state.absorb(frames);
                        return state
                            .pending
                            .pop_front()
                            .map(|item| (item, (byte_stream, state)));
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn data_frame(payload: &str) -> SseFrame {
        SseFrame::Data(payload.to_owned())
    }

    fn chunk_json(id: &str, content: &str) -> String {
        format!(
            r#"{{"id":"{id}","object":"chat.completion.chunk","created":1700000000,"model":"test-model","choices":[{{"index":0,"delta":{{"content":"{content}"}},"finish_reason":null}}]}}"#
        )
    }

    async fn collect_events(chunks: Vec<&str>) -> Vec<Result<DeltaEvent, AppError>> {
        let byte_stream = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, reqwest::Error>(Bytes::from(c.to_owned())))
                .collect::<Vec<_>>(),
        );
        decode_delta_stream(byte_stream).collect().await
    }

    #[test]
    fn test_complete_line_produces_frame() {
        let mut buffer = SseLineBuffer::new();
        let frames = buffer.feed(b"data: {\"x\":1}\n");
        assert_eq!(frames, vec![data_frame("{\"x\":1}")]);
    }

    #[test]
    fn test_partial_line_buffered_across_feeds() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.feed(b"data: {\"x\"").is_empty());
        let frames = buffer.feed(b":1}\n");
        assert_eq!(frames, vec![data_frame("{\"x\":1}")]);
    }

    #[test]
    fn test_multiple_events_per_chunk() {
        let mut buffer = SseLineBuffer::new();
        let frames = buffer.feed(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: [DONE]\n\n");
        assert_eq!(
            frames,
            vec![
                data_frame("{\"a\":1}"),
                data_frame("{\"b\":2}"),
                SseFrame::Done
            ]
        );
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut buffer = SseLineBuffer::new();
        let frames = buffer.feed(b"data: {\"x\":1}\r\n\r\n");
        assert_eq!(frames, vec![data_frame("{\"x\":1}")]);
    }

    #[test]
    fn test_non_data_fields_ignored() {
        let mut buffer = SseLineBuffer::new();
        let frames = buffer.feed(b"event: ping\nid: 42\nretry: 1000\n: keep-alive\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn test_flush_recovers_unterminated_tail() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.feed(b"data: [DONE]").is_empty());
        assert_eq!(buffer.flush(), vec![SseFrame::Done]);
    }

    #[tokio::test]
    async fn test_decode_concatenation_independent_of_batching() {
        // Same logical events, three different TCP batchings
        let one = chunk_json("c-1", "Hel");
        let two = chunk_json("c-1", "lo");
        let done = "data: [DONE]\n\n";

        let as_one = format!("data: {one}\n\ndata: {two}\n\n{done}");
        let split_mid_json = format!("data: {one}\n\ndata: {}", &two[..10]);
        let split_rest = format!("{}\n\n{done}", &two[10..]);

        for chunks in [
            vec![as_one.as_str()],
            vec![split_mid_json.as_str(), split_rest.as_str()],
        ] {
            let events = collect_events(chunks).await;
            let text: String = events
                .iter()
                .filter_map(|e| e.as_ref().ok())
                .filter_map(|e| e.content.clone())
                .collect();
            assert_eq!(text, "Hello");
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_skipped_later_events_decoded() {
        let good = chunk_json("c-2", "ok");
        let input = format!("data: {{not json}}\n\ndata: {good}\n\ndata: [DONE]\n\n");

        let events = collect_events(vec![&input]).await;
        assert_eq!(events.len(), 1);
        let event = events[0].as_ref().unwrap();
        assert_eq!(event.id, "c-2");
        assert_eq!(event.content.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_chunk_without_id_skipped() {
        let input = concat!(
            "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        );
        let events = collect_events(vec![input]).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_done_terminates_before_later_data() {
        let late = chunk_json("c-3", "late");
        let input = format!("data: [DONE]\n\ndata: {late}\n\n");
        let events = collect_events(vec![&input]).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_stream_close_without_done_still_ends() {
        let only = chunk_json("c-4", "tail");
        let input = format!("data: {only}\n\n");
        let events = collect_events(vec![&input]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().content.as_deref(), Some("tail"));
    }

    #[tokio::test]
    async fn test_finish_reason_passthrough() {
        let input = concat!(
            "data: {\"id\":\"c-5\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let events = collect_events(vec![input]).await;
        assert_eq!(events.len(), 1);
        let event = events[0].as_ref().unwrap();
        assert!(event.content.is_none());
        assert_eq!(event.finish_reason.as_deref(), Some("stop"));
    }
}
