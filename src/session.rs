//! conversation data model shared by the accumulator, storage and the bevy layer.

use serde::{Deserialize, Serialize};

/// who authored a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// some backends label the reply `model`; both decode to the same role.
    #[serde(alias = "model")]
    Assistant,
}

/// one message of a transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// chronological list of turns.
pub type Transcript = Vec<Turn>;

/// everything the presentation layer gets to see.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub transcript: Transcript,
    pub busy: bool,
}

impl SessionState {
    pub fn last_turn(&self) -> Option<&Turn> {
        self.transcript.last()
    }

    /// content of the trailing assistant turn, if the transcript ends with one.
    pub fn assistant_tail(&self) -> Option<&str> {
        self.transcript
            .last()
            .filter(|t| t.is_assistant())
            .map(|t| t.content.as_str())
    }
}
