//! Server configuration loading from file and environment variables.

use parley_voice::config::{validate_sample_rate, DEFAULT_SAMPLE_RATE};
use parley_voice::{
    ControllerSettings, LlmConfig, SessionSettings, SttConfig, TtsConfig, VadConfig, VoiceError,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an interviewer conducting a mock interview, \
first ask the user what role they are interviewing for, then ask them questions relevant to \
that role. Make sure to ask one question at a time. So ask a question, wait for a response, \
then ask the next question, like a typical interview.";

pub const DEFAULT_GREETING: &str = "Hello! I'm your AI interviewer. Shall we begin?";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub vad: VadConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub stt: SttConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Concurrent voice sessions; further connections are refused.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Directory with a static web client to serve at the root.
    #[serde(default)]
    pub client_dir: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Audio framing on the websocket.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Sample rate of client microphone audio.
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,

    /// Duration of each outbound audio frame in milliseconds.
    #[serde(default = "default_output_chunk_ms")]
    pub output_chunk_ms: u64,

    /// Prefix every outbound audio frame with a WAV header.
    #[serde(default = "default_true")]
    pub add_wav_header: bool,

    /// Release outbound audio no faster than real time.
    #[serde(default = "default_true")]
    pub pace_output: bool,
}

/// Turn-taking behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub allow_interruptions: bool,

    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Consecutive stage failures before a session is closed.
    #[serde(default = "default_max_stage_failures")]
    pub max_stage_failures: u32,
}

/// What the agent says and how it behaves.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Spoken when a client connects. Empty disables it.
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8765
}

fn default_max_sessions() -> usize {
    1
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_input_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_output_chunk_ms() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_max_stage_failures() -> u32 {
    3
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            client_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: default_input_sample_rate(),
            output_chunk_ms: default_output_chunk_ms(),
            add_wav_header: true,
            pace_output: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            enable_metrics: true,
            max_stage_failures: default_max_stage_failures(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            greeting: default_greeting(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is missing or out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<VoiceError> for ConfigError {
    fn from(e: VoiceError) -> Self {
        Self::Invalid(e.to_string())
    }
}

impl Config {
    /// Rejects missing credentials and out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "server.max_sessions must be at least 1".to_string(),
            ));
        }
        validate_sample_rate(self.audio.input_sample_rate)?;
        if !(10..=1000).contains(&self.audio.output_chunk_ms) {
            return Err(ConfigError::Invalid(format!(
                "audio.output_chunk_ms {} is outside 10..=1000",
                self.audio.output_chunk_ms
            )));
        }
        if self.pipeline.max_stage_failures == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_stage_failures must be at least 1".to_string(),
            ));
        }
        self.vad.validate()?;
        self.stt.validate()?;
        self.llm.validate()?;
        self.tts.validate()?;
        Ok(())
    }

    /// Pipeline settings for each new session.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            controller: ControllerSettings {
                system_prompt: self.agent.system_prompt.clone(),
                greeting: self.agent.greeting.clone(),
                allow_interruptions: self.pipeline.allow_interruptions,
                max_stage_failures: self.pipeline.max_stage_failures,
            },
            vad: self.vad.clone(),
            output_chunk: Duration::from_millis(self.audio.output_chunk_ms),
            pace_output: self.audio.pace_output,
            enable_metrics: self.pipeline.enable_metrics,
        }
    }
}

/// An environment override whose value could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOverride {
    pub var: String,
    pub value: String,
}

/// What happened while loading, kept until logging is initialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Config path that did not exist; defaults were used.
    pub missing_file: Option<String>,
    pub rejected: Vec<RejectedOverride>,
}

impl LoadReport {
    pub fn log(&self) {
        if let Some(path) = &self.missing_file {
            tracing::info!(path = %path, "config file not found, using defaults");
        }
        for rejected in &self.rejected {
            tracing::warn!(
                var = %rejected.var,
                value = %rejected.value,
                "ignoring unparseable override"
            );
        }
    }
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides from the process environment.
///
/// Nothing is logged here; the returned [`LoadReport`] carries the notable
/// outcomes so the caller can log them once a subscriber is installed.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
/// Validation is left to the caller.
pub fn load_config(path: Option<&str>) -> Result<(Config, LoadReport), ConfigError> {
    let mut report = LoadReport::default();
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.missing_file = Some(p.to_string());
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    report.rejected = apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok((config, report))
}

/// Applies environment overrides using `lookup` to read variables.
///
/// - `DEEPGRAM_API_KEY`, `OPENAI_API_KEY`, `CARTESIA_API_KEY` set the
///   collaborator credentials
/// - `PARLEY_HOST`, `PARLEY_PORT` override `server.host` / `server.port`
/// - `PARLEY_LOG_LEVEL`, `PARLEY_LOG_JSON` override the logging section
/// - `PARLEY_MODEL`, `PARLEY_VOICE_ID`, `PARLEY_SAMPLE_RATE` override the
///   model, voice and output sample rate
/// - `PARLEY_VAD_ENABLED`, `PARLEY_VAD_CONFIDENCE` override the VAD section
/// - `PARLEY_ALLOW_INTERRUPTIONS`, `PARLEY_ENABLE_METRICS` override the
///   pipeline section
/// - `PARLEY_CLIENT_DIR` sets `server.client_dir`
///
/// Values that fail to parse leave the setting unchanged and are returned.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Vec<RejectedOverride>
where
    F: Fn(&str) -> Option<String>,
{
    let mut rejected = Vec::new();
    if let Some(key) = lookup("DEEPGRAM_API_KEY") {
        config.stt.api_key = key;
    }
    if let Some(key) = lookup("OPENAI_API_KEY") {
        config.llm.api_key = key;
    }
    if let Some(key) = lookup("CARTESIA_API_KEY") {
        config.tts.api_key = key;
    }

    override_parsed(&lookup, "PARLEY_HOST", &mut config.server.host, &mut rejected);
    override_parsed(&lookup, "PARLEY_PORT", &mut config.server.port, &mut rejected);
    if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    override_flag(&lookup, "PARLEY_LOG_JSON", &mut config.logging.json, &mut rejected);

    if let Some(model) = lookup("PARLEY_MODEL") {
        config.llm.model = model;
    }
    if let Some(voice) = lookup("PARLEY_VOICE_ID") {
        config.tts.voice_id = voice;
    }
    override_parsed(
        &lookup,
        "PARLEY_SAMPLE_RATE",
        &mut config.tts.sample_rate,
        &mut rejected,
    );

    override_flag(
        &lookup,
        "PARLEY_VAD_ENABLED",
        &mut config.vad.enabled,
        &mut rejected,
    );
    override_parsed(
        &lookup,
        "PARLEY_VAD_CONFIDENCE",
        &mut config.vad.confidence,
        &mut rejected,
    );
    override_flag(
        &lookup,
        "PARLEY_ALLOW_INTERRUPTIONS",
        &mut config.pipeline.allow_interruptions,
        &mut rejected,
    );
    override_flag(
        &lookup,
        "PARLEY_ENABLE_METRICS",
        &mut config.pipeline.enable_metrics,
        &mut rejected,
    );

    if let Some(dir) = lookup("PARLEY_CLIENT_DIR") {
        config.server.client_dir = Some(dir).filter(|d| !d.trim().is_empty());
    }
    rejected
}

fn override_parsed<F, T>(
    lookup: &F,
    name: &str,
    target: &mut T,
    rejected: &mut Vec<RejectedOverride>,
) where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => rejected.push(RejectedOverride {
                var: name.to_string(),
                value: raw,
            }),
        }
    }
}

fn override_flag<F>(
    lookup: &F,
    name: &str,
    target: &mut bool,
    rejected: &mut Vec<RejectedOverride>,
) where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => *target = true,
            "false" | "0" | "no" | "off" => *target = false,
            _ => rejected.push(RejectedOverride {
                var: name.to_string(),
                value: raw,
            }),
        }
    }
}
