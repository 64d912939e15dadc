//! headless example: drive a `Conversation` without a bevy app.
//! - prints every snapshot as it is published.
//! - keeps history in a json file between runs.
//!
//! usage: cargo run --example replay -- [history.json] [message...]
//! without `CHAT_PROJECT_ID`, replies come from a scripted body that is cut
//! into awkward chunks (mid-line, mid-character).

use bevy_chat_stream::{
    Accumulator, ChatError, Conversation, Endpoint, HttpTransport, JsonFileStore, ScriptedTransport,
    SharedTransport,
};
use std::sync::Arc;

fn transport() -> SharedTransport {
    match std::env::var("CHAT_PROJECT_ID") {
        Ok(project) if !project.is_empty() => {
            let key = std::env::var("CHAT_API_KEY").unwrap_or_default();
            let mut endpoint = Endpoint::new(project, key);
            if let Ok(base) = std::env::var("CHAT_BASE_URL") {
                endpoint = endpoint.with_base_url(base);
            }
            Arc::new(HttpTransport::new(endpoint))
        }
        _ => {
            let body = concat!(
                "data: {\"chunk\": \"Grüße \"}\n",
                "data: {\"chunk\": \"aus dem \"}\n",
                ": comment lines are ignored\n",
                "data: {broken\n",
                "data: {\"chunk\": \"Stream ✨\"}\n",
                "data: [DONE]\n",
            )
            .as_bytes();
            let chunks = body.chunks(7).map(<[u8]>::to_vec).collect();
            Arc::new(ScriptedTransport::new(chunks))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ChatError> {
    let mut args = std::env::args().skip(1);
    let history = args.next().unwrap_or_else(|| "chat_history.json".to_string());
    let message = {
        let rest: Vec<String> = args.collect();
        if rest.is_empty() { "hello".to_string() } else { rest.join(" ") }
    };

    let acc = Accumulator::new().with_store(JsonFileStore::new(&history));
    let mut chat = Conversation::with_shared(transport()).with_accumulator(acc);
    println!("loaded {} turns from {}", chat.state().transcript.len(), history);

    let updates = chat.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(state) = updates.recv_async().await {
            let tail = state.assistant_tail().unwrap_or("");
            println!("[busy={}] assistant: {:?}", state.busy, tail);
        }
    });

    let outcome = chat.submit(&message).await;
    drop(chat);
    let _ = printer.await;

    println!("outcome: {:?}", outcome?);
    Ok(())
}
