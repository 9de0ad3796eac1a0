//! Shared types for the Parley voice agent.
//!
//! This crate holds the data model that crosses crate boundaries: audio
//! chunks, dialogue messages, the session turn state, and the notices sent
//! to connected clients. It has no async or I/O dependencies.

pub mod audio;

pub use audio::{AudioChunk, Direction, PcmError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Speaker role of a dialogue [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn in the dialogue. Immutable once appended to a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Conversation state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// No client connected yet.
    #[default]
    Idle,
    /// Waiting for (or receiving) user speech.
    Listening,
    /// A response is being generated.
    Thinking,
    /// A response is being synthesized and sent.
    Speaking,
    /// Terminal; the transport has been released.
    Closed,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Closed => "closed",
        }
    }

    /// Whether the agent currently owns the floor (a response is in flight).
    pub fn is_responding(self) -> bool {
        matches!(self, Self::Thinking | Self::Speaking)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band notification sent to the client alongside audio.
///
/// Serialized as JSON text frames tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// The session changed state.
    State { state: TurnState },
    /// A transcript line for the chat view.
    Transcript {
        role: Role,
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    /// The agent stopped speaking because the user started; clients should
    /// drop any buffered playback.
    Interruption,
    /// A stage failed; the turn was abandoned.
    Error { stage: String, message: String },
    /// Per-stage timing for one turn.
    Metrics {
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ttfb_ms: Option<u64>,
        processing_ms: u64,
    },
}
