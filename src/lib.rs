//! bevy_chat_stream: streamed chat replies folded into a live transcript.
//!
//! - decodes `data: {"chunk": ..}` / `data: [DONE]` bodies chunk by chunk.
//! - keeps one transcript per session; the in-flight reply is a single
//!   assistant turn that grows with every fragment.
//! - publishes a `SessionState` snapshot after every fold step (flume
//!   subscribers outside bevy, `ChatUpdated` events inside it).
//! - never blocks the main thread: on native requests run on a tiny tokio
//!   runtime, on wasm on bevy's async pool.
//!
//! outside bevy, drive a `Conversation` directly:
//!
//! ```no_run
//! use bevy_chat_stream::{Conversation, Endpoint, HttpTransport};
//!
//! # async fn demo() -> Result<(), bevy_chat_stream::ChatError> {
//! let mut chat = Conversation::new(HttpTransport::new(Endpoint::new("my-project", "api-key")));
//! let updates = chat.subscribe();
//! chat.submit("hello").await?;
//! for state in updates.drain() {
//!     println!("{:?}", state.assistant_tail());
//! }
//! # Ok(())
//! # }
//! ```

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use flume::{Receiver, Sender};
use std::sync::Arc;

pub mod accumulator;
pub mod config;
pub mod conversation;
pub mod decoder;
pub mod error;
pub mod session;
pub mod storage;
pub mod transport;

pub use accumulator::{Accumulator, ExchangeEnd, Folded};
pub use config::Endpoint;
pub use conversation::{AbortHandle, Conversation, Submission};
pub use decoder::{EventStream, LineDecoder, StreamEvent, decode_line, decode_stream};
pub use error::ChatError;
pub use session::{Role, SessionState, Transcript, Turn};
#[cfg(not(target_arch = "wasm32"))]
pub use storage::JsonFileStore;
pub use storage::{MemoryStore, TranscriptStore};
pub use transport::{ByteStream, HttpTransport, ScriptedTransport, SharedTransport, Transport};

/// the transport every session talks through.
#[derive(Resource, Clone)]
pub struct ChatClient {
    pub transport: SharedTransport,
}

impl ChatClient {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self { transport: Arc::new(transport) }
    }

    pub fn http(endpoint: Endpoint) -> Self {
        Self::new(HttpTransport::new(endpoint))
    }
}

/// on native we keep a tiny tokio runtime to drive request futures.
/// we spawn onto this rt from compute tasks so neither the main thread
/// nor bevy's compute pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_chat_stream", "ChatStreamPlugin: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// Chat* events are emitted here (in `Update`)
    Drain,
}

/// attach this to an entity you want to chat on.
#[derive(Component, Clone, Debug)]
pub struct ChatSession {
    /// publish a `ChatUpdated` per fragment (true) or only the final state.
    pub stream: bool,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self { stream: true }
    }
}

/// the session's transcript. inserted on first request if missing; insert
/// your own to attach a store or preload history.
#[derive(Component, Default)]
pub struct ChatLog(pub Accumulator);

impl ChatLog {
    pub fn state(&self) -> &SessionState {
        self.0.state()
    }
}

/// insert this component to submit `text` on the session entity.
#[derive(Component, Clone, Debug)]
pub struct ChatRequest {
    pub text: String,
}

/// marker: abort the running exchange of this entity.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct ChatCancel;

/// present while an exchange is in flight.
#[derive(Component, Clone, Debug)]
pub struct ActiveExchange {
    abort: AbortHandle,
}

/// helper to enqueue a text submission on a session entity.
pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_chat_stream", "send_user_text -> '{}' (len={})", text, text.len());
    commands.entity(target).insert(ChatRequest { text });
}

/// helper to abort whatever the session is streaming. partial content stays.
pub fn cancel_chat(commands: &mut Commands, target: Entity) {
    commands.entity(target).insert(ChatCancel);
}

/// events emitted during/after chat.
#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
}
/// a fold step changed the session; `state` is the full snapshot.
#[derive(Event, Debug, Clone)]
pub struct ChatUpdated {
    pub entity: Entity,
    pub state: SessionState,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    /// the final assistant text, if any arrived.
    pub final_text: Option<String>,
    pub end: ExchangeEnd,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: String,
}

/// cross-thread inbox; producers send, main thread drains.
/// unbounded: every fragment has to reach the fold, none may be dropped.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }
}

/// every message carries the exchange id it was produced for; the drain
/// drops messages from exchanges the log has already moved past.
#[derive(Debug)]
enum StreamMsg {
    Event { entity: Entity, exchange: u64, event: StreamEvent },
    Done { entity: Entity, exchange: u64, end: ExchangeEnd },
    Err { entity: Entity, exchange: u64, error: ChatError },
}

/// send to inbox (ignore disconnected)
fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send(msg);
}

/// reports `Done(Aborted)` if the request task goes away without a verdict,
/// so the session never stays busy.
struct InboxGuard {
    tx: Sender<StreamMsg>,
    entity: Entity,
    exchange: u64,
    armed: bool,
}

impl Drop for InboxGuard {
    fn drop(&mut self) {
        if self.armed {
            push_inbox(
                &self.tx,
                StreamMsg::Done { entity: self.entity, exchange: self.exchange, end: ExchangeEnd::Aborted },
            );
        }
    }
}

/// bevy plugin: wires systems, events, resources.
/// requires a `ChatClient` resource before the first request.
/// on native, also inserts a tiny tokio runtime resource by default.
pub struct ChatStreamPlugin;

impl Plugin for ChatStreamPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_chat_stream", "ChatStreamPlugin: build()");
        app.init_resource::<StreamInbox>()
            .add_event::<ChatStarted>()
            .add_event::<ChatUpdated>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            .configure_sets(Update, ChatSet::Drain)
            .add_systems(Update, drain_stream_inbox.in_set(ChatSet::Drain))
            .add_systems(
                Update,
                (cancel_chat_requests, spawn_chat_requests).chain().before(ChatSet::Drain),
            );

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// opens an exchange per pending `ChatRequest` and spawns its request task.
#[allow(clippy::too_many_arguments)]
fn spawn_chat_requests(
    mut commands: Commands,
    client: Option<Res<ChatClient>>,
    inbox: Res<StreamInbox>,
    mut q: Query<(Entity, &ChatSession, &ChatRequest, Option<&mut ChatLog>)>,
    mut ev_start: EventWriter<ChatStarted>,
    mut ev_update: EventWriter<ChatUpdated>,
    mut ev_err: EventWriter<ChatErrorEvt>,

    // native-only: small runtime to drive network futures
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for (e, session, req, mut log) in q.iter_mut() {
        // one-shot marker removal
        commands.entity(e).remove::<ChatRequest>();

        let Some(client) = client.as_ref() else {
            warn!(target: "bevy_chat_stream", "no ChatClient resource; dropping request for {:?}", e);
            continue;
        };

        let mut fresh = None;
        let acc = match log.as_deref_mut() {
            Some(ChatLog(acc)) => acc,
            None => fresh.insert(Accumulator::new()),
        };
        acc.set_streaming(session.stream);

        match acc.begin(&req.text) {
            Ok(false) => {
                debug!(target: "bevy_chat_stream", "blank submission on {:?} ignored", e);
            }
            Err(err) => {
                ev_err.write(ChatErrorEvt { entity: e, error: err.to_string() });
            }
            Ok(true) => {
                ev_start.write(ChatStarted { entity: e });
                ev_update.write(ChatUpdated { entity: e, state: acc.state().clone() });

                let (abort, abort_rx) = AbortHandle::channel();
                commands.entity(e).insert(ActiveExchange { abort });

                let transport = client.transport.clone();
                let tx = inbox.tx.clone();
                let text = req.text.clone();
                let exchange = acc.exchange();
                info!(target: "bevy_chat_stream",
                    "spawn_chat_requests: entity={:?} stream={} len={}",
                    e, session.stream, text.len()
                );

                // created outside the task so even a never-polled task closes the exchange
                let mut guard = InboxGuard { tx: tx.clone(), entity: e, exchange, armed: true };
                let run = async move {
                    let result = match transport.open(&text).await {
                        Ok(source) => {
                            conversation::pump(source, &abort_rx, |event| {
                                let terminal = event.is_terminal();
                                push_inbox(&tx, StreamMsg::Event { entity: e, exchange, event });
                                terminal
                            })
                            .await
                        }
                        Err(err) => Err(err),
                    };
                    guard.armed = false;
                    match result {
                        Ok(end) => push_inbox(&tx, StreamMsg::Done { entity: e, exchange, end }),
                        Err(error) => {
                            error!(target: "bevy_chat_stream", "chat error: {}", error);
                            push_inbox(&tx, StreamMsg::Err { entity: e, exchange, error });
                        }
                    }
                };

                let pool = AsyncComputeTaskPool::get();
                #[cfg(target_arch = "wasm32")]
                {
                    // wasm path: just await directly (no tokio).
                    pool.spawn(run).detach();
                }
                #[cfg(not(target_arch = "wasm32"))]
                {
                    // native: hand off to tokio so bevy pools stay free.
                    let rt = rt.0.clone();
                    pool.spawn(async move {
                        let _ = rt.spawn(run).await;
                    })
                    .detach();
                }
            }
        }

        if let Some(acc) = fresh {
            commands.entity(e).insert(ChatLog(acc));
        }
    }
}

fn cancel_chat_requests(
    mut commands: Commands,
    q: Query<(Entity, Option<&ActiveExchange>), With<ChatCancel>>,
) {
    for (e, active) in &q {
        commands.entity(e).remove::<ChatCancel>();
        if let Some(active) = active {
            info!(target: "bevy_chat_stream", "cancel_chat: entity={:?}", e);
            active.abort.abort();
        }
    }
}

/// drains the inbox, folds it into each session's log in arrival order, and
/// emits user-facing events.
fn drain_stream_inbox(
    mut commands: Commands,
    inbox: Res<StreamInbox>,
    mut q: Query<&mut ChatLog>,
    mut ev_update: EventWriter<ChatUpdated>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams;
    // the rest stays queued, in order, for the next frame
    const MAX_PER_FRAME: usize = 512;
    for _ in 0..MAX_PER_FRAME {
        let Ok(msg) = inbox.rx.try_recv() else {
            break;
        };
        match msg {
            StreamMsg::Event { entity, exchange, event } => {
                // session despawned mid-stream, or a leftover from an older exchange
                let Ok(mut log) = q.get_mut(entity) else {
                    continue;
                };
                if log.0.exchange() != exchange {
                    continue;
                }
                match log.0.apply(event) {
                    Folded::Ignored => {}
                    Folded::Updated => {
                        if log.0.is_streaming() {
                            ev_update.write(ChatUpdated { entity, state: log.0.state().clone() });
                        }
                    }
                    Folded::Closed => {
                        ev_update.write(ChatUpdated { entity, state: log.0.state().clone() });
                        complete(&mut commands, &mut ev_done, entity, &log.0, ExchangeEnd::Terminal);
                    }
                }
            }
            StreamMsg::Done { entity, exchange, end } => {
                let Ok(mut log) = q.get_mut(entity) else {
                    continue;
                };
                // already closed by its terminal event
                if log.0.exchange() != exchange || !log.0.finish(end) {
                    continue;
                }
                ev_update.write(ChatUpdated { entity, state: log.0.state().clone() });
                complete(&mut commands, &mut ev_done, entity, &log.0, end);
            }
            StreamMsg::Err { entity, exchange, error } => {
                if let Ok(mut log) = q.get_mut(entity) {
                    if log.0.exchange() != exchange {
                        continue;
                    }
                    if log.0.is_busy() {
                        log.0.fail(&error);
                        ev_update.write(ChatUpdated { entity, state: log.0.state().clone() });
                        commands.entity(entity).remove::<ActiveExchange>();
                    }
                }
                ev_err.write(ChatErrorEvt { entity, error: error.to_string() });
            }
        }
    }
}

/// the exchange on `entity` just closed: drop its abort handle and report.
fn complete(
    commands: &mut Commands,
    ev_done: &mut EventWriter<ChatCompletedEvt>,
    entity: Entity,
    acc: &Accumulator,
    end: ExchangeEnd,
) {
    let final_text = acc
        .state()
        .assistant_tail()
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    info!(target: "bevy_chat_stream",
        "chat completed: entity={:?} end={:?} final_len={}",
        entity, end, final_text.as_deref().map_or(0, str::len)
    );
    commands.entity(entity).remove::<ActiveExchange>();
    ev_done.write(ChatCompletedEvt { entity, final_text, end });
}
