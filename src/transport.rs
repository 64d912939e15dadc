//! transport collaborators: anything that turns a message into a chunked body.

use crate::config::Endpoint;
use crate::error::ChatError;
use async_trait::async_trait;
use futures_lite::{Stream, StreamExt, stream};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// raw response body, in chunks of whatever size the network hands over.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChatError>> + Send>>;

/// chunks buffered between the reader and the decoder.
const CHANNEL_DEPTH: usize = 64;

#[async_trait]
pub trait Transport: Send + Sync {
    /// send `message` and hand back the response body.
    async fn open(&self, message: &str) -> Result<ByteStream, ChatError>;
}

/// POSTs `{"message": ..}` with a bearer token to the endpoint's chat url.
///
/// - native: blocking `ureq` request on a reader thread.
/// - wasm: `gloo-net` fetch, body pulled through the `ReadableStream` reader.
///
/// either way chunks reach the caller through a bounded `flume` channel.
/// dropping the returned stream does not interrupt a read already in flight:
/// the reader notices between reads, once the next chunk arrives or the server
/// closes the body. a stalled response keeps its reader (and on native its
/// thread and socket) alive until then.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    endpoint: Endpoint,
}

impl HttpTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, message: &str) -> Result<ByteStream, ChatError> {
        use std::io::Read;

        const READ_BUF: usize = 8 * 1024;

        let url = self.endpoint.chat_url();
        let bearer = self.endpoint.bearer();
        let body = serde_json::json!({ "message": message });
        let (ready_tx, ready_rx) = flume::bounded::<Result<(), ChatError>>(1);
        let (tx, rx) = flume::bounded(CHANNEL_DEPTH);

        bevy::log::info!(target: "bevy_chat_stream", "POST {} (len={})", url, message.len());
        std::thread::Builder::new()
            .name("chat-stream-reader".into())
            .spawn(move || {
                let response = match ureq::post(&url)
                    .header("Content-Type", "application/json")
                    .header("Authorization", &bearer)
                    .send_json(&body)
                {
                    Ok(r) => r,
                    Err(ureq::Error::StatusCode(code)) => {
                        let _ = ready_tx.send(Err(ChatError::Status(code)));
                        return;
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(ChatError::transport(err)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let mut reader = response.into_body().into_reader();
                let mut buf = vec![0u8; READ_BUF];
                loop {
                    if tx.is_disconnected() {
                        bevy::log::debug!(target: "bevy_chat_stream", "reader: stream dropped, closing body");
                        break;
                    }
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // receiver gone: the exchange was aborted
                            if tx.send(Ok(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let _ = tx.send(Err(ChatError::from(e)));
                            break;
                        }
                    }
                }
            })?;

        ready_rx
            .recv_async()
            .await
            .map_err(|_| ChatError::transport("reader thread exited before responding"))??;
        Ok(Box::pin(rx.into_stream()))
    }
}

#[cfg(target_arch = "wasm32")]
#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, message: &str) -> Result<ByteStream, ChatError> {
        let url = self.endpoint.chat_url();
        let bearer = self.endpoint.bearer();
        let body = serde_json::json!({ "message": message });
        let (ready_tx, ready_rx) = flume::bounded::<Result<(), ChatError>>(1);
        let (tx, rx) = flume::bounded(CHANNEL_DEPTH);

        // js futures are !Send: run the fetch on the local executor and only
        // hand channel ends across.
        wasm_bindgen_futures::spawn_local(async move {
            match wasm::fetch_body(&url, &bearer, &body).await {
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
                Ok(reader) => {
                    let _ = ready_tx.send(Ok(()));
                    wasm::pump(reader, tx).await;
                }
            }
        });

        ready_rx
            .recv_async()
            .await
            .map_err(|_| ChatError::transport("fetch task dropped"))??;
        Ok(Box::pin(rx.into_stream()))
    }
}

#[cfg(target_arch = "wasm32")]
mod wasm {
    use crate::error::ChatError;
    use flume::Sender;
    use gloo_net::http::Request;
    use wasm_bindgen::{JsCast, JsValue};
    use wasm_bindgen_futures::JsFuture;
    use web_sys::ReadableStreamDefaultReader;

    pub(super) async fn fetch_body(
        url: &str,
        bearer: &str,
        body: &serde_json::Value,
    ) -> Result<ReadableStreamDefaultReader, ChatError> {
        let resp = Request::post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", bearer)
            .json(body)
            .map_err(ChatError::transport)?
            .send()
            .await
            .map_err(ChatError::transport)?;
        if !resp.ok() {
            return Err(ChatError::Status(resp.status()));
        }
        let stream = resp
            .body()
            .ok_or_else(|| ChatError::transport("response has no body"))?;
        Ok(stream.get_reader().unchecked_into())
    }

    pub(super) async fn pump(
        reader: ReadableStreamDefaultReader,
        tx: Sender<Result<Vec<u8>, ChatError>>,
    ) {
        loop {
            let step = match JsFuture::from(reader.read()).await {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.send_async(Err(ChatError::transport(format!("{e:?}")))).await;
                    return;
                }
            };
            let done = js_sys::Reflect::get(&step, &JsValue::from_str("done"))
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if done {
                return;
            }
            let value = js_sys::Reflect::get(&step, &JsValue::from_str("value"))
                .unwrap_or(JsValue::UNDEFINED);
            let bytes = js_sys::Uint8Array::new(&value).to_vec();
            if tx.send_async(Ok(bytes)).await.is_err() {
                let _ = reader.cancel();
                return;
            }
        }
    }
}

/// replays a canned body. useful offline and in tests.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    chunks: Vec<Vec<u8>>,
    /// error yielded after the chunks.
    fail_after: Option<String>,
    /// error returned by `open` itself.
    refuse: Option<String>,
    /// never end the body after the chunks (until dropped).
    hold_open: bool,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self { chunks, ..Default::default() }
    }

    /// one `data:` line per fragment, optionally followed by `[DONE]`.
    pub fn from_fragments(fragments: &[&str], done: bool) -> Self {
        let mut body = String::new();
        for f in fragments {
            body.push_str("data: ");
            body.push_str(&serde_json::json!({ "chunk": f }).to_string());
            body.push('\n');
        }
        if done {
            body.push_str("data: [DONE]\n");
        }
        Self::new(vec![body.into_bytes()])
    }

    pub fn fail_after(mut self, error: impl Into<String>) -> Self {
        self.fail_after = Some(error.into());
        self
    }

    pub fn refuse(mut self, error: impl Into<String>) -> Self {
        self.refuse = Some(error.into());
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// messages passed to `open` so far.
    pub fn requests(&self) -> Vec<String> {
        self.sent.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, message: &str) -> Result<ByteStream, ChatError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.to_string());
        }
        if let Some(err) = &self.refuse {
            return Err(ChatError::transport(err));
        }
        let mut items: Vec<Result<Vec<u8>, ChatError>> =
            self.chunks.iter().cloned().map(Ok).collect();
        if let Some(err) = &self.fail_after {
            items.push(Err(ChatError::transport(err)));
        }
        let body = stream::iter(items);
        if self.hold_open {
            Ok(Box::pin(body.chain(stream::pending())))
        } else {
            Ok(Box::pin(body))
        }
    }
}

/// shared handle, for resources and drivers.
pub type SharedTransport = Arc<dyn Transport>;
