//! drives one request/response exchange at a time against a transport.

use crate::accumulator::{Accumulator, ExchangeEnd};
use crate::decoder::{StreamEvent, decode_stream};
use crate::error::ChatError;
use crate::session::{SessionState, Turn};
use crate::transport::{ByteStream, SharedTransport, Transport};
use bevy::log::{error, info};
use flume::{Receiver, Sender};
use futures_lite::{StreamExt, future};
use std::sync::Arc;

/// result of a `submit` call that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// blank text; nothing happened.
    Ignored,
    Completed(ExchangeEnd),
}

/// closes the byte source of the running exchange. the exchange then
/// finalizes like a normal end of stream.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: Sender<()>,
}

impl AbortHandle {
    pub(crate) fn channel() -> (Self, Receiver<()>) {
        let (tx, rx) = flume::bounded(1);
        (Self { tx }, rx)
    }

    pub fn abort(&self) {
        let _ = self.tx.try_send(());
    }
}

/// closes the exchange on every exit path, including the submit future
/// being dropped half way.
struct ExchangeGuard<'a> {
    acc: &'a mut Accumulator,
    closed: bool,
}

impl ExchangeGuard<'_> {
    fn fold(&mut self, event: StreamEvent) -> bool {
        self.closed = self.acc.fold(event);
        self.closed
    }

    fn finish(&mut self, end: ExchangeEnd) {
        self.closed = true;
        self.acc.finish(end);
    }

    fn fail(&mut self, err: &ChatError) {
        self.closed = true;
        self.acc.fail(err);
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.acc.finish(ExchangeEnd::Aborted);
        }
    }
}

enum Step {
    Event(Option<Result<StreamEvent, ChatError>>),
    Aborted,
}

pub struct Conversation {
    acc: Accumulator,
    transport: SharedTransport,
    abort: AbortHandle,
    abort_rx: Receiver<()>,
}

impl Conversation {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_shared(Arc::new(transport))
    }

    pub fn with_shared(transport: SharedTransport) -> Self {
        let (abort, abort_rx) = AbortHandle::channel();
        Self { acc: Accumulator::new(), transport, abort, abort_rx }
    }

    /// swap in a preconfigured accumulator (store, streaming mode).
    pub fn with_accumulator(mut self, acc: Accumulator) -> Self {
        self.acc = acc;
        self
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.acc
    }

    pub fn accumulator_mut(&mut self) -> &mut Accumulator {
        &mut self.acc
    }

    pub fn state(&self) -> &SessionState {
        self.acc.state()
    }

    pub fn subscribe(&mut self) -> Receiver<SessionState> {
        self.acc.subscribe()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// whole-transcript delivery, deduplicated on the last turn.
    pub fn apply_transcript(&mut self, delivered: Vec<Turn>) -> bool {
        self.acc.apply_transcript(delivered)
    }

    /// send `text` and fold the streamed reply into the transcript.
    ///
    /// rejects with `ChatError::Busy` while another exchange is open. a
    /// transport failure is returned after the exchange is closed with its
    /// partial content kept.
    pub async fn submit(&mut self, text: &str) -> Result<Submission, ChatError> {
        if !self.acc.begin(text)? {
            return Ok(Submission::Ignored);
        }
        // aborts aimed at an earlier exchange
        while self.abort_rx.try_recv().is_ok() {}

        let abort_rx = &self.abort_rx;
        let mut guard = ExchangeGuard { acc: &mut self.acc, closed: false };

        let result = match self.transport.open(text).await {
            Ok(source) => pump(source, abort_rx, |event| guard.fold(event)).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(ExchangeEnd::Terminal) => Ok(Submission::Completed(ExchangeEnd::Terminal)),
            Ok(end) => {
                guard.finish(end);
                Ok(Submission::Completed(end))
            }
            Err(err) => {
                guard.fail(&err);
                Err(err)
            }
        }
    }
}

/// decode `source` and hand each event to `on_event` until it returns true
/// (terminal), the body ends, the body fails, or `abort` fires.
pub(crate) async fn pump(
    source: ByteStream,
    abort: &Receiver<()>,
    mut on_event: impl FnMut(StreamEvent) -> bool,
) -> Result<ExchangeEnd, ChatError> {
    let mut events = decode_stream(source);
    let mut fragments = 0usize;

    loop {
        let step = future::or(async { Step::Event(events.next().await) }, async {
            let _ = abort.recv_async().await;
            Step::Aborted
        })
        .await;

        match step {
            Step::Event(Some(Ok(event))) => {
                if !event.is_terminal() {
                    fragments += 1;
                }
                if on_event(event) {
                    info!(target: "bevy_chat_stream", "stream completed: fragments={}", fragments);
                    return Ok(ExchangeEnd::Terminal);
                }
            }
            Step::Event(Some(Err(err))) => {
                error!(target: "bevy_chat_stream", "streaming error after {} fragments: {}", fragments, err);
                return Err(err);
            }
            Step::Event(None) => {
                info!(target: "bevy_chat_stream", "stream ended without [DONE]: fragments={}", fragments);
                return Ok(ExchangeEnd::EndOfStream);
            }
            Step::Aborted => {
                info!(target: "bevy_chat_stream", "stream aborted: fragments={}", fragments);
                return Ok(ExchangeEnd::Aborted);
            }
        }
    }
}
