//! Speech synthesis: the collaborator seam, a Cartesia client, and the task
//! that turns reply text into fixed-size outbound audio chunks.

use crate::config::TtsConfig;
use crate::error::VoiceError;
use crate::metrics::StageTimer;
use crate::transport::OutputQueue;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Maximum text input size for one synthesis request (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for establishing a synthesis request.
const TTS_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest wait for the next block of synthesized audio.
pub const TTS_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const PCM_QUEUE_CAPACITY: usize = 64;

pub type AudioStream = BoxStream<'static, Result<Vec<i16>, VoiceError>>;

/// Converts text into mono 16-bit PCM.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Sample rate of the audio this synthesizer produces.
    fn sample_rate(&self) -> u32;

    /// Streams PCM blocks of arbitrary size.
    async fn synthesize(&self, text: &str) -> Result<AudioStream, VoiceError>;
}

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    model_id: &'a str,
    transcript: &'a str,
    voice: VoiceSpec<'a>,
    output_format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct VoiceSpec<'a> {
    mode: &'static str,
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct OutputFormat {
    container: &'static str,
    encoding: &'static str,
    sample_rate: u32,
}

/// Decodes a little-endian s16 byte stream whose chunks may split samples.
#[derive(Debug, Default)]
struct PcmDecoder {
    carry: Option<u8>,
}

impl PcmDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity((bytes.len() + 1) / 2);
        let mut rest = bytes;
        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((high, tail)) => {
                    samples.push(i16::from_le_bytes([low, *high]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }
        let mut pairs = rest.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
        self.carry = pairs.remainder().first().copied();
        samples
    }

    fn has_carry(&self) -> bool {
        self.carry.is_some()
    }
}

/// Cartesia `/tts/bytes` client producing raw `pcm_s16le`.
#[derive(Debug, Clone)]
pub struct CartesiaTts {
    client: reqwest::Client,
    config: TtsConfig,
}

impl CartesiaTts {
    pub fn new(config: TtsConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(TTS_TIMEOUT)
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn request_body<'a>(&'a self, text: &'a str) -> TtsRequest<'a> {
        TtsRequest {
            model_id: &self.config.model_id,
            transcript: text,
            voice: VoiceSpec {
                mode: "id",
                id: &self.config.voice_id,
            },
            output_format: OutputFormat {
                container: "raw",
                encoding: "pcm_s16le",
                sample_rate: self.config.sample_rate,
            },
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for CartesiaTts {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }

        let response = tokio::time::timeout(
            TTS_TIMEOUT,
            self.client
                .post(&self.config.url)
                .header("X-API-Key", &self.config.api_key)
                .header("Cartesia-Version", &self.config.api_version)
                .json(&self.request_body(text))
                .send(),
        )
        .await
        .map_err(|_| {
            VoiceError::Tts(format!(
                "request timed out after {} seconds",
                TTS_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| VoiceError::Tts(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!(
                "upstream returned {}: {}",
                status, detail
            )));
        }

        let mut body = response.bytes_stream();
        let (tx, rx) = mpsc::channel(PCM_QUEUE_CAPACITY);
        tokio::spawn(async move {
            let mut decoder = PcmDecoder::default();
            while let Some(bytes) = body.next().await {
                let item = bytes
                    .map(|b| decoder.push(&b))
                    .map_err(|e| VoiceError::Tts(format!("stream failed: {}", e)));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    return;
                }
            }
            if decoder.has_carry() {
                tracing::debug!("dropping trailing odd byte from synthesized audio");
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Splits text at sentence boundaries so synthesis of the first sentence can
/// start before the rest. Terminal punctuation stays with its sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = match c {
            '.' | '!' | '?' | ';' => chars.peek().map_or(true, |n| n.is_whitespace()),
            '\n' => true,
            _ => false,
        };
        if boundary {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Re-cuts PCM blocks of arbitrary size into fixed-length frames.
#[derive(Debug)]
pub struct FrameAccumulator {
    frame_len: usize,
    pending: Vec<i16>,
}

impl FrameAccumulator {
    pub fn new(sample_rate: u32, frame: Duration) -> Self {
        let frame_len = (u128::from(sample_rate) * frame.as_micros() / 1_000_000) as usize;
        Self {
            frame_len: frame_len.max(1),
            pending: Vec::new(),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let full = self.pending.len() / self.frame_len * self.frame_len;
        if full == 0 {
            return Vec::new();
        }
        let frames = self.pending[..full]
            .chunks(self.frame_len)
            .map(<[i16]>::to_vec)
            .collect();
        self.pending.drain(..full);
        frames
    }

    /// The final short frame, if any.
    pub fn finish(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Every chunk reached the transport.
    Completed,
    /// Cancelled, or the output closed, before playback finished.
    Stopped,
}

/// Synthesizes `text` and queues it as `frame`-sized chunks under `epoch`.
///
/// Waits until the writer has delivered the last chunk before reporting
/// completion. Cancellation is observed between chunks and while waiting on
/// the synthesizer, which fails the stage after [`TTS_IDLE_TIMEOUT`] without
/// audio.
pub async fn speak(
    synthesizer: &dyn SpeechSynthesizer,
    text: &str,
    frame: Duration,
    epoch: u64,
    output: &OutputQueue,
    cancel: &CancellationToken,
    timer: &mut StageTimer,
) -> Result<SpeakOutcome, VoiceError> {
    let sample_rate = synthesizer.sample_rate();
    let mut frames = FrameAccumulator::new(sample_rate, frame);

    for sentence in split_sentences(text) {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(SpeakOutcome::Stopped),
            stream = tokio::time::timeout(TTS_IDLE_TIMEOUT, synthesizer.synthesize(&sentence)) => {
                stream.map_err(|_| idle_timeout())??
            }
        };
        loop {
            let block = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(SpeakOutcome::Stopped),
                block = tokio::time::timeout(TTS_IDLE_TIMEOUT, stream.next()) => {
                    block.map_err(|_| idle_timeout())?
                }
            };
            let samples = match block {
                Some(Ok(samples)) => samples,
                Some(Err(e)) => return Err(e),
                None => break,
            };
            if !samples.is_empty() {
                timer.first_byte();
            }
            for chunk in frames.push(&samples) {
                if !enqueue(output, epoch, sample_rate, chunk, cancel).await {
                    return Ok(SpeakOutcome::Stopped);
                }
            }
        }
    }
    if let Some(chunk) = frames.finish() {
        if !enqueue(output, epoch, sample_rate, chunk, cancel).await {
            return Ok(SpeakOutcome::Stopped);
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => Ok(SpeakOutcome::Stopped),
        drained = output.drained() => Ok(match drained {
            Ok(()) => SpeakOutcome::Completed,
            Err(_) => SpeakOutcome::Stopped,
        }),
    }
}

fn idle_timeout() -> VoiceError {
    VoiceError::Tts(format!(
        "no audio for {} seconds",
        TTS_IDLE_TIMEOUT.as_secs()
    ))
}

async fn enqueue(
    output: &OutputQueue,
    epoch: u64,
    sample_rate: u32,
    samples: Vec<i16>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = output.audio(epoch, sample_rate, samples) => sent.is_ok(),
    }
}
