use crate::error::VoiceError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_DEEPGRAM_URL: &str = "wss://api.deepgram.com/v1/listen";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CARTESIA_URL: &str = "https://api.cartesia.ai/tts/bytes";
pub const DEFAULT_CARTESIA_VERSION: &str = "2024-06-10";
pub const DEFAULT_VOICE_ID: &str = "91b4cf29-5166-44eb-8054-30d40ecc8081";
pub const DEFAULT_MODEL: &str = "gpt-4-turbo-preview";
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

fn default_deepgram_url() -> String {
    DEFAULT_DEEPGRAM_URL.to_string()
}

fn default_stt_model() -> String {
    "nova-2".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_openai_base_url() -> String {
    DEFAULT_OPENAI_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_cartesia_url() -> String {
    DEFAULT_CARTESIA_URL.to_string()
}

fn default_cartesia_version() -> String {
    DEFAULT_CARTESIA_VERSION.to_string()
}

fn default_tts_model() -> String {
    "sonic-english".to_string()
}

fn default_voice_id() -> String {
    DEFAULT_VOICE_ID.to_string()
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f32 {
    0.7
}

fn default_start_secs() -> f32 {
    0.2
}

fn default_stop_secs() -> f32 {
    0.8
}

fn default_min_volume() -> f32 {
    0.6
}

fn require_key(key: &str, what: &str) -> Result<(), VoiceError> {
    if key.trim().is_empty() {
        return Err(VoiceError::Config(format!("{what} API key is not set")));
    }
    Ok(())
}

/// Streaming speech-to-text (Deepgram) settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_deepgram_url")]
    pub url: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: default_deepgram_url(),
            model: default_stt_model(),
            language: default_language(),
        }
    }
}

impl fmt::Debug for SttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SttConfig")
            .field("api_key", &"[REDACTED]")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("language", &self.language)
            .finish()
    }
}

impl SttConfig {
    pub fn validate(&self) -> Result<(), VoiceError> {
        require_key(&self.api_key, "speech-to-text")
    }
}

/// Chat-completion (OpenAI-compatible) settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            model: default_model(),
            temperature: None,
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Result<(), VoiceError> {
        require_key(&self.api_key, "language model")?;
        if self.model.trim().is_empty() {
            return Err(VoiceError::Config("model id must not be empty".to_string()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(VoiceError::Config(
                    "temperature must be between 0.0 and 2.0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Text-to-speech (Cartesia) settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_cartesia_url")]
    pub url: String,
    #[serde(default = "default_cartesia_version")]
    pub api_version: String,
    #[serde(default = "default_tts_model")]
    pub model_id: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    /// Output sample rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: default_cartesia_url(),
            api_version: default_cartesia_version(),
            model_id: default_tts_model(),
            voice_id: default_voice_id(),
            sample_rate: default_sample_rate(),
        }
    }
}

impl fmt::Debug for TtsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtsConfig")
            .field("api_key", &"[REDACTED]")
            .field("url", &self.url)
            .field("api_version", &self.api_version)
            .field("model_id", &self.model_id)
            .field("voice_id", &self.voice_id)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl TtsConfig {
    pub fn validate(&self) -> Result<(), VoiceError> {
        require_key(&self.api_key, "text-to-speech")?;
        if self.voice_id.trim().is_empty() {
            return Err(VoiceError::Config("voice id must not be empty".to_string()));
        }
        validate_sample_rate(self.sample_rate)
    }
}

/// Voice activity detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Smoothed loudness (0..1, linear from -60 to -20 dBFS) above which
    /// audio counts as speech. The default 0.7 is about -32 dBFS.
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Audio time confidence must stay above threshold before speech starts.
    #[serde(default = "default_start_secs")]
    pub start_secs: f32,
    /// Audio time confidence must stay below threshold before speech stops.
    #[serde(default = "default_stop_secs")]
    pub stop_secs: f32,
    /// Per-chunk loudness floor on the same scale; 0.6 is -36 dBFS.
    /// Quieter chunks never count as speech.
    #[serde(default = "default_min_volume")]
    pub min_volume: f32,
    /// Forward every inbound chunk downstream, not only utterance audio.
    #[serde(default = "default_true")]
    pub passthrough: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence: default_confidence(),
            start_secs: default_start_secs(),
            stop_secs: default_stop_secs(),
            min_volume: default_min_volume(),
            passthrough: true,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<(), VoiceError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(VoiceError::Config(
                "vad confidence must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_volume) {
            return Err(VoiceError::Config(
                "vad min_volume must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.start_secs < 0.0 || self.stop_secs < 0.0 {
            return Err(VoiceError::Config(
                "vad dwell times must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn validate_sample_rate(sample_rate: u32) -> Result<(), VoiceError> {
    if !(8_000..=48_000).contains(&sample_rate) {
        return Err(VoiceError::Config(format!(
            "sample rate {sample_rate} Hz is outside 8000..=48000"
        )));
    }
    Ok(())
}
