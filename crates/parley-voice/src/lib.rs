//! Real-time voice conversation pipeline.
//!
//! Inbound audio flows through voice activity detection into streaming
//! speech-to-text. Final transcripts drive a turn-taking controller that asks
//! a language model for a reply and streams synthesized speech back to the
//! client. Speech from the user while the agent is thinking or speaking
//! interrupts the turn in flight.
//!
//! External services sit behind the [`SpeechToText`], [`ResponseGenerator`]
//! and [`SpeechSynthesizer`] traits; the client connection sits behind
//! [`AudioTransport`].

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod session;
pub mod stt;
pub mod transport;
pub mod tts;
pub mod vad;

pub use config::{LlmConfig, SttConfig, TtsConfig, VadConfig};
pub use context::{Context, ContextError, ContextMark};
pub use controller::{Command, ControllerSettings, SessionController, SessionEvent};
pub use error::{Stage, TransportError, VoiceError};
pub use llm::{OpenAiGenerator, ResponseGenerator, TextStream};
pub use session::{run_session, Collaborators, SessionReport, SessionSettings};
pub use stt::{DeepgramStt, SpeechToText, TranscriptEvent, TranscriptStream};
pub use transport::{AudioSink, AudioSource, AudioTransport, OutboundFrame};
pub use tts::{AudioStream, CartesiaTts, SpeechSynthesizer};
pub use vad::{SegmentEvent, VadSegmenter};
