//! turns a chunked response body into `StreamEvent`s.
//!
//! wire format, one event per line:
//!
//! ```text
//! data: {"chunk": "<partial text>"}
//! data: [DONE]
//! ```
//!
//! lines without the `data: ` prefix are ignored. payloads that fail to decode
//! or carry no `chunk` string are dropped. chunk boundaries may fall anywhere,
//! including inside a multi-byte character: bytes are only interpreted once a
//! full line has arrived.

use crate::error::ChatError;
use bevy::log::debug;
use futures_lite::Stream;
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// one application-level event of a response stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment { text: String },
    Terminal,
}

impl StreamEvent {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self::Fragment { text: text.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }
}

#[derive(Deserialize)]
struct ChunkPayload {
    chunk: Option<String>,
}

/// decode a single line; `None` for anything that is not an event.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    if payload == DONE_SENTINEL {
        return Some(StreamEvent::Terminal);
    }
    match serde_json::from_str::<ChunkPayload>(payload) {
        Ok(ChunkPayload { chunk: Some(text) }) => Some(StreamEvent::Fragment { text }),
        Ok(ChunkPayload { chunk: None }) => {
            debug!(target: "bevy_chat_stream", "dropping data line without chunk: {}", payload);
            None
        }
        Err(err) => {
            debug!(target: "bevy_chat_stream", "dropping malformed data line ({err}): {}", payload);
            None
        }
    }
}

/// incremental byte -> event splitter. holds the unterminated tail between pushes.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// feed one chunk; returns the events of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(chunk);
        let Some(last_nl) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        // '\n' never occurs inside a multi-byte utf-8 sequence, so every
        // complete line is also complete utf-8.
        let rest = self.pending.split_off(last_nl + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|b| *b == b'\n')
            .filter_map(|line| decode_line(&String::from_utf8_lossy(line)))
            .collect()
    }

    /// source exhausted: treat the unterminated tail as a final line.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let tail = std::mem::take(&mut self.pending);
        if tail.is_empty() {
            return Vec::new();
        }
        decode_line(&String::from_utf8_lossy(&tail)).into_iter().collect()
    }

    /// bytes waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// lazy event sequence over a byte stream.
///
/// ends after `Terminal`, after the source is exhausted (no implicit
/// `Terminal`), or after yielding the first source error.
pub struct EventStream<S> {
    source: S,
    decoder: LineDecoder,
    queued: VecDeque<StreamEvent>,
    done: bool,
}

impl<S> EventStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            decoder: LineDecoder::new(),
            queued: VecDeque::new(),
            done: false,
        }
    }
}

impl<S> Stream for EventStream<S>
where
    S: Stream<Item = Result<Vec<u8>, ChatError>> + Unpin,
{
    type Item = Result<StreamEvent, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(ev) = this.queued.pop_front() {
                if ev.is_terminal() {
                    this.queued.clear();
                    this.done = true;
                }
                return Poll::Ready(Some(Ok(ev)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut this.source).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => this.queued.extend(this.decoder.push(&chunk)),
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.queued.extend(this.decoder.finish());
                    this.done = true;
                }
            }
        }
    }
}

/// convenience wrapper: `decode_stream(body).next().await`.
pub fn decode_stream<S>(source: S) -> EventStream<S>
where
    S: Stream<Item = Result<Vec<u8>, ChatError>> + Unpin,
{
    EventStream::new(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::{StreamExt, stream};
    use pretty_assertions::assert_eq;

    const BODY: &str = concat!(
        "data: {\"chunk\": \"Hel\"}\n",
        ": keep-alive\n",
        "data: {\"chunk\": \"lo, \"}\r\n",
        "data: {not json}\n",
        "data: {\"other\": 1}\n",
        "data: {\"chunk\": \"wörld 🌍\"}\n",
        "data: [DONE]\n",
    );

    fn expected() -> Vec<StreamEvent> {
        vec![
            StreamEvent::fragment("Hel"),
            StreamEvent::fragment("lo, "),
            StreamEvent::fragment("wörld 🌍"),
            StreamEvent::Terminal,
        ]
    }

    fn collect(chunks: Vec<Vec<u8>>) -> Vec<StreamEvent> {
        let source = stream::iter(chunks.into_iter().map(Ok::<_, ChatError>));
        pollster::block_on(decode_stream(source).map(|r| r.unwrap()).collect::<Vec<_>>())
    }

    #[test]
    fn decode_line_rules() {
        assert_eq!(decode_line("data: [DONE]"), Some(StreamEvent::Terminal));
        assert_eq!(decode_line("data:   [DONE]  "), Some(StreamEvent::Terminal));
        assert_eq!(decode_line("data: {\"chunk\": \"x\"}"), Some(StreamEvent::fragment("x")));
        assert_eq!(decode_line("data: {\"chunk\": 3}"), None);
        assert_eq!(decode_line("data: {\"chunk\": null}"), None);
        assert_eq!(decode_line("event: message"), None);
        assert_eq!(decode_line("data:{\"chunk\": \"x\"}"), None);
        assert_eq!(decode_line(""), None);
    }

    #[test]
    fn single_chunk() {
        assert_eq!(collect(vec![BODY.as_bytes().to_vec()]), expected());
    }

    #[test]
    fn every_split_point_yields_same_events() {
        let bytes = BODY.as_bytes();
        for at in 0..=bytes.len() {
            let chunks = vec![bytes[..at].to_vec(), bytes[at..].to_vec()];
            assert_eq!(collect(chunks), expected(), "split at {at}");
        }
    }

    #[test]
    fn byte_at_a_time() {
        let chunks = BODY.bytes().map(|b| vec![b]).collect();
        assert_eq!(collect(chunks), expected());
    }

    #[test]
    fn uneven_chunk_sizes() {
        let bytes = BODY.as_bytes();
        for size in [2, 3, 5, 7, 13] {
            let chunks = bytes.chunks(size).map(<[u8]>::to_vec).collect();
            assert_eq!(collect(chunks), expected(), "chunk size {size}");
        }
    }

    #[test]
    fn multibyte_split_is_held_back() {
        let line = "data: {\"chunk\": \"é\"}\n".as_bytes();
        let cut = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut dec = LineDecoder::new();
        assert!(dec.push(&line[..cut]).is_empty());
        assert_eq!(dec.buffered(), cut);
        assert_eq!(dec.push(&line[cut..]), vec![StreamEvent::fragment("é")]);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn end_without_done_has_no_terminal() {
        let chunks = vec![b"data: {\"chunk\": \"A\"}\ndata: {\"chunk\": \"B\"}".to_vec()];
        assert_eq!(
            collect(chunks),
            vec![StreamEvent::fragment("A"), StreamEvent::fragment("B")]
        );
    }

    #[test]
    fn nothing_after_terminal() {
        let chunks = vec![b"data: [DONE]\ndata: {\"chunk\": \"late\"}\n".to_vec()];
        assert_eq!(collect(chunks), vec![StreamEvent::Terminal]);
    }

    #[test]
    fn source_error_ends_stream() {
        let source = stream::iter(vec![
            Ok(b"data: {\"chunk\": \"ok\"}\n".to_vec()),
            Err(ChatError::transport("reset")),
            Ok(b"data: {\"chunk\": \"never\"}\n".to_vec()),
        ]);
        let out = pollster::block_on(decode_stream(source).collect::<Vec<_>>());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), &StreamEvent::fragment("ok"));
        assert!(matches!(out[1], Err(ChatError::Transport(_))));
    }
}
