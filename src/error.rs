use thiserror::Error;

/// errors surfaced by the chat client.
///
/// malformed `data:` lines never show up here: the decoder drops them.
#[derive(Debug, Error)]
pub enum ChatError {
    /// the request could not be established or the body could not be read.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream connection failed (http status {0})")]
    Status(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// `submit` was called while an exchange was still in flight.
    #[error("an exchange is already in progress")]
    Busy,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ChatError {
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// true for failures of the network exchange itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status(_) | Self::Io(_))
    }
}
