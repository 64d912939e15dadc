//! folds stream events into a session transcript.
//!
//! `Accumulator` is the synchronous core shared by the async driver
//! (`Conversation`) and the bevy systems: `begin` opens an exchange,
//! `fold` applies each event, `finish`/`fail` close it. every transition that
//! changes state publishes a `SessionState` snapshot to all subscribers.

use crate::decoder::StreamEvent;
use crate::error::ChatError;
use crate::session::{SessionState, Turn};
use crate::storage::TranscriptStore;
use bevy::log::{debug, warn};
use flume::{Receiver, Sender};

/// how an exchange ended without a transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeEnd {
    /// `[DONE]` was observed.
    Terminal,
    /// the body ran out without `[DONE]`.
    EndOfStream,
    /// the byte source was closed by the caller.
    Aborted,
}

/// what a single `apply` did to the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Folded {
    /// no exchange was open; nothing changed.
    Ignored,
    /// the running assistant turn grew.
    Updated,
    /// the exchange was closed.
    Closed,
}

/// in-flight exchange bookkeeping.
#[derive(Debug, Default)]
struct Pending {
    buffer: String,
    /// index of this exchange's assistant turn, once created.
    assistant: Option<usize>,
}

pub struct Accumulator {
    state: SessionState,
    pending: Option<Pending>,
    stream: bool,
    /// bumped by every accepted `begin`.
    exchange: u64,
    observers: Vec<Sender<SessionState>>,
    store: Option<Box<dyn TranscriptStore>>,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            state: SessionState::default(),
            pending: None,
            stream: true,
            exchange: 0,
            observers: Vec::new(),
            store: None,
        }
    }

    /// attach a store and hydrate the transcript from it.
    pub fn with_store(mut self, store: impl TranscriptStore + 'static) -> Self {
        match store.load() {
            Ok(turns) => {
                debug!(target: "bevy_chat_stream", "loaded {} turns from store", turns.len());
                self.state.transcript = turns;
            }
            Err(err) => warn!(target: "bevy_chat_stream", "transcript load failed: {err}"),
        }
        self.store = Some(Box::new(store));
        self
    }

    /// when off, per-fragment snapshots are suppressed and only the
    /// finalized transcript is published.
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn set_streaming(&mut self, stream: bool) {
        self.stream = stream;
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
    }

    pub fn is_busy(&self) -> bool {
        self.state.busy
    }

    /// id of the most recently opened exchange (0 before the first).
    pub fn exchange(&self) -> u64 {
        self.exchange
    }

    /// receive a snapshot after every state transition.
    pub fn subscribe(&mut self) -> Receiver<SessionState> {
        let (tx, rx) = flume::unbounded();
        self.observers.push(tx);
        rx
    }

    /// open an exchange for `text`.
    ///
    /// `Ok(false)` for blank text (nothing changes), `Err(Busy)` while another
    /// exchange is open, `Ok(true)` once the user turn is appended.
    pub fn begin(&mut self, text: &str) -> Result<bool, ChatError> {
        if text.trim().is_empty() {
            return Ok(false);
        }
        if self.state.busy {
            warn!(target: "bevy_chat_stream", "rejecting submission while busy (len={})", text.len());
            return Err(ChatError::Busy);
        }
        self.state.busy = true;
        self.exchange += 1;
        self.state.transcript.push(Turn::user(text));
        self.pending = Some(Pending::default());
        self.publish();
        Ok(true)
    }

    /// apply one event. returns true when it closed the exchange.
    pub fn fold(&mut self, event: StreamEvent) -> bool {
        self.apply(event) == Folded::Closed
    }

    /// apply one event and report what changed.
    pub fn apply(&mut self, event: StreamEvent) -> Folded {
        match event {
            StreamEvent::Fragment { text } if self.push_fragment(&text) => Folded::Updated,
            StreamEvent::Terminal if self.finish(ExchangeEnd::Terminal) => Folded::Closed,
            _ => Folded::Ignored,
        }
    }

    fn push_fragment(&mut self, text: &str) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            debug!(target: "bevy_chat_stream", "fragment outside an exchange dropped");
            return false;
        };
        pending.buffer.push_str(text);
        let turn = Turn::assistant(pending.buffer.clone());
        match pending.assistant {
            Some(idx) if idx < self.state.transcript.len() => self.state.transcript[idx] = turn,
            _ => {
                self.state.transcript.push(turn);
                pending.assistant = Some(self.state.transcript.len() - 1);
            }
        }
        if self.stream {
            self.publish();
        }
        true
    }

    /// close the open exchange, keeping whatever content arrived.
    /// the assistant turn exists afterwards even if no fragment did.
    /// returns false when no exchange was open.
    pub fn finish(&mut self, end: ExchangeEnd) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        if pending.assistant.is_none() {
            self.state.transcript.push(Turn::assistant(pending.buffer));
        }
        self.state.busy = false;
        debug!(target: "bevy_chat_stream", "exchange finished ({end:?})");
        self.persist();
        self.publish();
        true
    }

    /// close the open exchange after a transport failure. partial assistant
    /// content stays; no empty assistant turn is invented.
    pub fn fail(&mut self, err: &ChatError) {
        if self.pending.take().is_none() && !self.state.busy {
            return;
        }
        warn!(target: "bevy_chat_stream", "exchange failed: {err}");
        self.state.busy = false;
        self.persist();
        self.publish();
    }

    /// whole-transcript delivery. skipped when the last turn matches the held
    /// one (role and content); otherwise the held transcript is replaced.
    /// returns whether anything changed.
    pub fn apply_transcript(&mut self, delivered: Vec<Turn>) -> bool {
        if self.state.transcript.last() == delivered.last() {
            return false;
        }
        self.state.transcript = delivered;
        if let Some(pending) = self.pending.as_mut() {
            // re-anchor the running buffer on the delivered tail
            match self.state.transcript.last() {
                Some(last) if last.is_assistant() => {
                    pending.buffer = last.content.clone();
                    pending.assistant = Some(self.state.transcript.len() - 1);
                }
                _ => {
                    pending.buffer.clear();
                    pending.assistant = None;
                }
            }
        }
        self.persist();
        self.publish();
        true
    }

    fn persist(&self) {
        if let Some(store) = &self.store
            && let Err(err) = store.save(&self.state.transcript)
        {
            warn!(target: "bevy_chat_stream", "transcript save failed: {err}");
        }
    }

    fn publish(&mut self) {
        let snapshot = &self.state;
        self.observers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;

    fn tails(rx: &Receiver<SessionState>) -> Vec<Option<String>> {
        rx.drain()
            .map(|s| s.assistant_tail().map(str::to_string))
            .collect()
    }

    #[test]
    fn fold_order_publishes_prefixes() {
        let mut acc = Accumulator::new();
        let rx = acc.subscribe();
        assert!(acc.begin("hi").unwrap());
        for f in ["Hel", "lo, ", "world"] {
            assert!(!acc.fold(StreamEvent::fragment(f)));
        }
        assert!(acc.fold(StreamEvent::Terminal));

        assert_eq!(
            tails(&rx),
            vec![
                None,
                Some("Hel".into()),
                Some("Hello, ".into()),
                Some("Hello, world".into()),
                Some("Hello, world".into()),
            ]
        );
        assert_eq!(acc.state().transcript, vec![Turn::user("hi"), Turn::assistant("Hello, world")]);
        assert!(!acc.is_busy());
    }

    #[test]
    fn exactly_one_assistant_turn_per_exchange() {
        for n in 0..5 {
            let mut acc = Accumulator::new();
            acc.begin("q").unwrap();
            for _ in 0..n {
                acc.fold(StreamEvent::fragment("x"));
            }
            acc.finish(ExchangeEnd::EndOfStream);
            let t = &acc.state().transcript;
            assert_eq!(t.len(), 2, "n={n}");
            assert_eq!(t[1], Turn::assistant("x".repeat(n)));
        }
    }

    #[test]
    fn blank_submission_is_noop() {
        let mut acc = Accumulator::new();
        let rx = acc.subscribe();
        assert!(!acc.begin("   ").unwrap());
        assert!(!acc.begin("").unwrap());
        assert_eq!(acc.state(), &SessionState::default());
        assert!(rx.is_empty());
    }

    #[test]
    fn busy_rejects_second_submission() {
        let mut acc = Accumulator::new();
        acc.begin("one").unwrap();
        let rx = acc.subscribe();
        assert!(matches!(acc.begin("two"), Err(ChatError::Busy)));
        assert_eq!(acc.state().transcript, vec![Turn::user("one")]);
        assert!(rx.is_empty());
    }

    #[test]
    fn failure_keeps_partial_content() {
        let mut acc = Accumulator::new();
        acc.begin("q").unwrap();
        acc.fold(StreamEvent::fragment("Par"));
        acc.fold(StreamEvent::fragment("tial"));
        acc.fail(&ChatError::transport("reset"));
        assert_eq!(acc.state().last_turn(), Some(&Turn::assistant("Partial")));
        assert!(!acc.is_busy());
    }

    #[test]
    fn failure_before_any_fragment_adds_no_assistant_turn() {
        let mut acc = Accumulator::new();
        acc.begin("q").unwrap();
        acc.fail(&ChatError::Status(500));
        assert_eq!(acc.state().transcript, vec![Turn::user("q")]);
        assert!(!acc.is_busy());
    }

    #[test]
    fn identical_full_transcript_is_skipped() {
        let mut acc = Accumulator::new();
        let rx = acc.subscribe();
        let full = vec![Turn::user("q"), Turn::assistant("a")];
        assert!(acc.apply_transcript(full.clone()));
        assert!(!acc.apply_transcript(full.clone()));
        assert_eq!(acc.state().transcript, full);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn differing_full_transcript_replaces_wholesale() {
        let mut acc = Accumulator::new();
        acc.apply_transcript(vec![Turn::user("q"), Turn::assistant("a")]);
        let next = vec![Turn::user("q2"), Turn::assistant("a2")];
        assert!(acc.apply_transcript(next.clone()));
        assert_eq!(acc.state().transcript, next);
    }

    #[test]
    fn full_transcript_mid_exchange_reanchors_fragments() {
        let mut acc = Accumulator::new();
        acc.begin("q").unwrap();
        acc.fold(StreamEvent::fragment("A"));
        acc.apply_transcript(vec![Turn::user("q"), Turn::assistant("AB")]);
        acc.fold(StreamEvent::fragment("C"));
        acc.finish(ExchangeEnd::EndOfStream);
        assert_eq!(acc.state().transcript, vec![Turn::user("q"), Turn::assistant("ABC")]);
    }

    #[test]
    fn events_outside_an_exchange_change_nothing() {
        let mut acc = Accumulator::new();
        let rx = acc.subscribe();
        assert_eq!(acc.apply(StreamEvent::fragment("x")), Folded::Ignored);
        assert_eq!(acc.apply(StreamEvent::Terminal), Folded::Ignored);

        acc.begin("q").unwrap();
        assert_eq!(acc.apply(StreamEvent::fragment("a")), Folded::Updated);
        assert_eq!(acc.apply(StreamEvent::Terminal), Folded::Closed);
        let published = rx.len();
        assert_eq!(acc.apply(StreamEvent::fragment("late")), Folded::Ignored);
        assert!(!acc.finish(ExchangeEnd::EndOfStream));
        assert_eq!(rx.len(), published);
        assert_eq!(acc.state().assistant_tail(), Some("a"));
    }

    #[test]
    fn exchange_ids_advance_per_accepted_begin() {
        let mut acc = Accumulator::new();
        assert_eq!(acc.exchange(), 0);
        acc.begin("  ").unwrap();
        assert_eq!(acc.exchange(), 0);
        acc.begin("one").unwrap();
        assert!(acc.begin("two").is_err());
        assert_eq!(acc.exchange(), 1);
        acc.finish(ExchangeEnd::Terminal);
        acc.begin("three").unwrap();
        assert_eq!(acc.exchange(), 2);
    }

    #[test]
    fn non_streaming_publishes_only_final() {
        let mut acc = Accumulator::new().with_streaming(false);
        let rx = acc.subscribe();
        acc.begin("q").unwrap();
        acc.fold(StreamEvent::fragment("a"));
        acc.fold(StreamEvent::fragment("b"));
        acc.fold(StreamEvent::Terminal);
        assert_eq!(tails(&rx), vec![None, Some("ab".into())]);
    }

    #[test]
    fn store_is_loaded_and_saved() {
        let store = MemoryStore::new(vec![Turn::user("old"), Turn::assistant("reply")]);
        let mut acc = Accumulator::new().with_store(store.clone());
        assert_eq!(acc.state().transcript.len(), 2);
        acc.begin("new").unwrap();
        acc.fold(StreamEvent::fragment("ok"));
        acc.finish(ExchangeEnd::Terminal);
        assert_eq!(store.snapshot().last(), Some(&Turn::assistant("ok")));
        assert_eq!(store.snapshot().len(), 4);
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let mut acc = Accumulator::new();
        drop(acc.subscribe());
        let rx = acc.subscribe();
        acc.begin("q").unwrap();
        assert_eq!(acc.observers.len(), 1);
        assert_eq!(rx.len(), 1);
    }
}
