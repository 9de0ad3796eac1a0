use std::fmt;
use thiserror::Error;

/// Pipeline stage that talks to an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Stt,
    Generation,
    Tts,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Generation => "generation",
            Self::Tts => "tts",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-level failures. Recoverable: the current turn is abandoned and the
/// session keeps listening.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("STT error: {0}")]
    Stt(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl VoiceError {
    /// The stage that produced this error, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stt(_) => Some(Stage::Stt),
            Self::Generation(_) => Some(Stage::Generation),
            Self::Tts(_) => Some(Stage::Tts),
            Self::Config(_) => None,
        }
    }
}

/// Failures of the client connection. Recovered by closing the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("malformed frame: {0}")]
    Frame(String),
}

impl TransportError {
    /// Whether the connection is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Frame(_))
    }
}
