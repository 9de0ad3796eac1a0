//! Speech-to-text: the collaborator seam, a Deepgram streaming client, and
//! the stage that turns VAD-segmented audio into transcript events.

use crate::config::SttConfig;
use crate::controller::SessionEvent;
use crate::error::{Stage, VoiceError};
use crate::metrics::{MetricsReporter, StageTimer};
use crate::vad::SegmentEvent;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use parley_types::AudioChunk;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

/// Audio buffered ahead of a speech start and replayed into the new utterance.
pub const DEFAULT_PRE_ROLL: Duration = Duration::from_millis(300);

/// Buffered chunks per open utterance.
const UTTERANCE_QUEUE_CAPACITY: usize = 256;

const TRANSCRIPT_QUEUE_CAPACITY: usize = 64;

/// Longest wait for the recognizer's websocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest wait for the next recognizer message within one utterance.
pub const STT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Interim hypothesis; may be revised.
    Partial(String),
    /// Stable text for a stretch of audio.
    Final(String),
}

pub type TranscriptStream = BoxStream<'static, Result<TranscriptEvent, VoiceError>>;

/// Streaming speech recognizer.
///
/// The audio receiver closes when the utterance ends; implementations should
/// flush any remaining finals and then end the stream.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        audio: mpsc::Receiver<AudioChunk>,
    ) -> Result<TranscriptStream, VoiceError>;
}

/// Deepgram live transcription over a websocket.
#[derive(Debug, Clone)]
pub struct DeepgramStt {
    config: SttConfig,
    sample_rate: u32,
}

impl DeepgramStt {
    pub fn new(config: SttConfig, sample_rate: u32) -> Self {
        Self {
            config,
            sample_rate,
        }
    }

    fn listen_url(&self) -> Result<reqwest::Url, VoiceError> {
        let sample_rate = self.sample_rate.to_string();
        reqwest::Url::parse_with_params(
            &self.config.url,
            &[
                ("model", self.config.model.as_str()),
                ("language", self.config.language.as_str()),
                ("encoding", "linear16"),
                ("sample_rate", sample_rate.as_str()),
                ("channels", "1"),
                ("interim_results", "true"),
                ("punctuate", "true"),
            ],
        )
        .map_err(|e| VoiceError::Stt(format!("invalid listen url: {}", e)))
    }
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    async fn transcribe(
        &self,
        mut audio: mpsc::Receiver<AudioChunk>,
    ) -> Result<TranscriptStream, VoiceError> {
        let url = self.listen_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Stt(format!("bad request: {}", e)))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|_| VoiceError::Stt("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (socket, _) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    VoiceError::Stt(format!(
                        "connect timed out after {} seconds",
                        CONNECT_TIMEOUT.as_secs()
                    ))
                })?
                .map_err(|e| VoiceError::Stt(format!("connect failed: {}", e)))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        tokio::spawn(async move {
            while let Some(chunk) = audio.recv().await {
                if ws_tx
                    .send(WsMessage::Binary(chunk.to_le_bytes().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = ws_tx
                .send(WsMessage::Text(CLOSE_STREAM.to_string().into()))
                .await;
        });

        let (tx, rx) = mpsc::channel(TRANSCRIPT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let item = match message {
                    Ok(WsMessage::Text(text)) => match parse_deepgram_message(text.as_str()) {
                        Ok(Some(event)) => Ok(event),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Err(VoiceError::Stt(format!("receive failed: {}", e))),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[derive(Debug, Deserialize)]
struct DeepgramMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    is_final: bool,
    channel: Option<DeepgramChannel>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
}

/// Parses one server message. Non-transcript messages and empty hypotheses
/// yield `None`.
fn parse_deepgram_message(text: &str) -> Result<Option<TranscriptEvent>, VoiceError> {
    let message: DeepgramMessage = serde_json::from_str(text)
        .map_err(|e| VoiceError::Stt(format!("unparseable message: {}", e)))?;
    if message.kind != "Results" {
        return Ok(None);
    }
    let transcript = message
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript.trim().to_string())
        .unwrap_or_default();
    if transcript.is_empty() {
        return Ok(None);
    }
    Ok(Some(if message.is_final {
        TranscriptEvent::Final(transcript)
    } else {
        TranscriptEvent::Partial(transcript)
    }))
}

/// Short ring of recent audio, bounded by duration.
#[derive(Debug)]
struct PreRoll {
    limit: Duration,
    total: Duration,
    chunks: VecDeque<AudioChunk>,
}

impl PreRoll {
    fn new(limit: Duration) -> Self {
        Self {
            limit,
            total: Duration::ZERO,
            chunks: VecDeque::new(),
        }
    }

    fn push(&mut self, chunk: AudioChunk) {
        if self.limit.is_zero() {
            return;
        }
        self.total += chunk.duration();
        self.chunks.push_back(chunk);
        while self.total > self.limit {
            match self.chunks.pop_front() {
                Some(old) => self.total = self.total.saturating_sub(old.duration()),
                None => break,
            }
        }
    }

    fn drain(&mut self) -> Vec<AudioChunk> {
        self.total = Duration::ZERO;
        self.chunks.drain(..).collect()
    }
}

struct OpenUtterance {
    id: u64,
    audio: mpsc::Sender<AudioChunk>,
    ended: oneshot::Sender<Instant>,
}

/// Feeds segmented audio to the recognizer and reports transcripts.
///
/// Each utterance gets its own recognition stream. Streams may overlap, but
/// their finals are delivered strictly in utterance order.
pub struct SttStage {
    stt: Arc<dyn SpeechToText>,
    events: mpsc::Sender<SessionEvent>,
    metrics: MetricsReporter,
    pre_roll: Duration,
}

impl SttStage {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        events: mpsc::Sender<SessionEvent>,
        metrics: MetricsReporter,
    ) -> Self {
        Self {
            stt,
            events,
            metrics,
            pre_roll: DEFAULT_PRE_ROLL,
        }
    }

    pub fn with_pre_roll(mut self, pre_roll: Duration) -> Self {
        self.pre_roll = pre_roll;
        self
    }

    /// Consumes segmenter output until the input closes or `cancel` fires.
    pub async fn run(self, mut input: mpsc::Receiver<SegmentEvent>, cancel: CancellationToken) {
        let mut pre_roll = PreRoll::new(self.pre_roll);
        let mut open: Option<OpenUtterance> = None;
        let mut previous: Option<oneshot::Receiver<()>> = None;
        let mut next_id = 0u64;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = input.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SegmentEvent::SpeechStart { .. } => {
                    next_id += 1;
                    let (audio_tx, audio_rx) = mpsc::channel(UTTERANCE_QUEUE_CAPACITY);
                    let (ended_tx, ended_rx) = oneshot::channel();
                    let (done_tx, done_rx) = oneshot::channel();
                    tokio::spawn(transcribe_utterance(
                        next_id,
                        self.stt.clone(),
                        audio_rx,
                        UtteranceLinks {
                            events: self.events.clone(),
                            metrics: self.metrics.clone(),
                            ended: ended_rx,
                            previous: previous.take(),
                            done: done_tx,
                            cancel: cancel.child_token(),
                        },
                    ));
                    previous = Some(done_rx);
                    for chunk in pre_roll.drain() {
                        let _ = audio_tx.send(chunk).await;
                    }
                    open = Some(OpenUtterance {
                        id: next_id,
                        audio: audio_tx,
                        ended: ended_tx,
                    });
                }
                SegmentEvent::Audio(chunk) => match &open {
                    // A failed stream drops its receiver; the rest of that
                    // utterance is discarded.
                    Some(utterance) => {
                        let _ = utterance.audio.send(chunk).await;
                    }
                    None => pre_roll.push(chunk),
                },
                SegmentEvent::SpeechEnd { .. } => {
                    if let Some(utterance) = open.take() {
                        tracing::trace!(utterance = utterance.id, "utterance closed");
                        let _ = utterance.ended.send(Instant::now());
                    }
                }
            }
        }
    }

    /// Single long-lived recognition stream for sessions without VAD. Every
    /// final the recognizer reports becomes an utterance.
    pub async fn run_continuous(
        self,
        mut input: mpsc::Receiver<SegmentEvent>,
        cancel: CancellationToken,
    ) {
        let mut stream: Option<(mpsc::Sender<AudioChunk>, tokio::task::JoinHandle<()>)> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = input.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let SegmentEvent::Audio(chunk) = event else {
                continue;
            };

            if stream.as_ref().is_some_and(|(_, task)| task.is_finished()) {
                stream = None;
            }
            if stream.is_none() {
                let (audio_tx, audio_rx) = mpsc::channel(UTTERANCE_QUEUE_CAPACITY);
                let task = tokio::spawn(stream_finals(
                    self.stt.clone(),
                    audio_rx,
                    self.events.clone(),
                    cancel.child_token(),
                ));
                stream = Some((audio_tx, task));
            }
            if let Some((audio, _)) = &stream {
                let _ = audio.send(chunk).await;
            }
        }

        if let Some((audio, task)) = stream {
            drop(audio);
            let _ = task.await;
        }
    }
}

struct UtteranceLinks {
    events: mpsc::Sender<SessionEvent>,
    metrics: MetricsReporter,
    ended: oneshot::Receiver<Instant>,
    previous: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
    cancel: CancellationToken,
}

async fn transcribe_utterance(
    id: u64,
    stt: Arc<dyn SpeechToText>,
    audio: mpsc::Receiver<AudioChunk>,
    links: UtteranceLinks,
) {
    let UtteranceLinks {
        events,
        metrics,
        mut ended,
        previous,
        done,
        cancel,
    } = links;

    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = collect_transcript(stt.as_ref(), audio, &events) => result,
    };
    let ended_at = ended.try_recv().unwrap_or_else(|_| Instant::now());

    // Finals leave in utterance order.
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    match result {
        Ok(text) if text.is_empty() => {
            tracing::debug!(utterance = id, "utterance produced no transcript");
            let _ = events.send(SessionEvent::UtteranceDiscarded).await;
        }
        Ok(text) => {
            metrics.report(StageTimer::start_at(Stage::Stt, ended_at).finish());
            let _ = events.send(SessionEvent::FinalTranscript(text)).await;
        }
        Err(e) => {
            let _ = events.send(SessionEvent::SttFailed(e)).await;
        }
    }
    let _ = done.send(());
}

/// Runs one recognition stream to the end and joins its finals.
///
/// Fails if the recognizer stays silent for [`STT_IDLE_TIMEOUT`].
async fn collect_transcript(
    stt: &dyn SpeechToText,
    audio: mpsc::Receiver<AudioChunk>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<String, VoiceError> {
    let mut stream = tokio::time::timeout(STT_IDLE_TIMEOUT, stt.transcribe(audio))
        .await
        .map_err(|_| idle_timeout())??;
    let mut finals: Vec<String> = Vec::new();
    while let Some(item) = tokio::time::timeout(STT_IDLE_TIMEOUT, stream.next())
        .await
        .map_err(|_| idle_timeout())?
    {
        match item? {
            TranscriptEvent::Partial(text) => {
                let mut preview = finals.join(" ");
                if !preview.is_empty() {
                    preview.push(' ');
                }
                preview.push_str(text.trim());
                let _ = events.send(SessionEvent::PartialTranscript(preview)).await;
            }
            TranscriptEvent::Final(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    finals.push(text.to_string());
                }
            }
        }
    }
    Ok(finals.join(" "))
}

fn idle_timeout() -> VoiceError {
    VoiceError::Stt(format!(
        "no transcript for {} seconds",
        STT_IDLE_TIMEOUT.as_secs()
    ))
}

async fn stream_finals(
    stt: Arc<dyn SpeechToText>,
    audio: mpsc::Receiver<AudioChunk>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut stream = match stt.transcribe(audio).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(SessionEvent::SttFailed(e)).await;
            return;
        }
    };
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };
        let event = match item {
            Some(Ok(TranscriptEvent::Partial(text))) => SessionEvent::PartialTranscript(text),
            Some(Ok(TranscriptEvent::Final(text))) if text.trim().is_empty() => continue,
            Some(Ok(TranscriptEvent::Final(text))) => SessionEvent::FinalTranscript(text),
            Some(Err(e)) => {
                let _ = events.send(SessionEvent::SttFailed(e)).await;
                return;
            }
            None => return,
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OutputQueue;
    use parley_types::Direction;
    use std::sync::Mutex;

    fn chunk(seq: u64) -> AudioChunk {
        AudioChunk::new(seq, Direction::Inbound, 16_000, vec![seq as i16; 320])
    }

    fn reporter() -> MetricsReporter {
        let (output, _rx) = OutputQueue::new(1);
        MetricsReporter::new(false, output)
    }

    /// Returns one canned transcript per call and records the audio it saw.
    struct ScriptedStt {
        replies: Mutex<VecDeque<Result<Vec<TranscriptEvent>, VoiceError>>>,
        heard: Arc<Mutex<Vec<Vec<u64>>>>,
        delays: Mutex<VecDeque<Duration>>,
    }

    impl ScriptedStt {
        fn new(replies: Vec<Result<Vec<TranscriptEvent>, VoiceError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                heard: Arc::new(Mutex::new(Vec::new())),
                delays: Mutex::new(VecDeque::new()),
            }
        }
    }

    #[async_trait]
    impl SpeechToText for ScriptedStt {
        async fn transcribe(
            &self,
            mut audio: mpsc::Receiver<AudioChunk>,
        ) -> Result<TranscriptStream, VoiceError> {
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()));
            let delay = self.delays.lock().unwrap().pop_front().unwrap_or_default();
            let events = reply?;
            let heard = self.heard.clone();
            let index = {
                let mut heard = heard.lock().unwrap();
                heard.push(Vec::new());
                heard.len() - 1
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(chunk) = audio.recv().await {
                    heard.lock().unwrap()[index].push(chunk.seq);
                }
                tokio::time::sleep(delay).await;
                for event in events {
                    let _ = tx.send(Ok(event)).await;
                }
            });
            Ok(ReceiverStream::new(rx).boxed())
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    fn finals(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::FinalTranscript(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn parses_deepgram_results() {
        let interim = r#"{"type":"Results","is_final":false,"channel":{"alternatives":[{"transcript":"I want","confidence":0.9}]}}"#;
        assert_eq!(
            parse_deepgram_message(interim).unwrap(),
            Some(TranscriptEvent::Partial("I want".to_string()))
        );

        let fin = r#"{"type":"Results","is_final":true,"speech_final":true,"channel":{"alternatives":[{"transcript":"I want to be a backend engineer"}]}}"#;
        assert_eq!(
            parse_deepgram_message(fin).unwrap(),
            Some(TranscriptEvent::Final(
                "I want to be a backend engineer".to_string()
            ))
        );
    }

    #[test]
    fn ignores_metadata_and_empty_hypotheses() {
        assert_eq!(
            parse_deepgram_message(r#"{"type":"Metadata","request_id":"x"}"#).unwrap(),
            None
        );
        let empty = r#"{"type":"Results","is_final":true,"channel":{"alternatives":[{"transcript":""}]}}"#;
        assert_eq!(parse_deepgram_message(empty).unwrap(), None);
        assert!(parse_deepgram_message("not json").is_err());
    }

    #[test]
    fn listen_url_carries_audio_format() {
        let stt = DeepgramStt::new(SttConfig::default(), 16_000);
        let url = stt.listen_url().unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("encoding=linear16"));
        assert!(query.contains("sample_rate=16000"));
        assert!(query.contains("interim_results=true"));
        assert!(query.contains("model=nova-2"));
    }

    #[test]
    fn pre_roll_is_bounded_by_duration() {
        let mut ring = PreRoll::new(Duration::from_millis(100));
        for seq in 0..10 {
            ring.push(chunk(seq));
        }
        let kept: Vec<u64> = ring.drain().iter().map(|c| c.seq).collect();
        assert_eq!(kept, vec![5, 6, 7, 8, 9]);
        assert!(ring.drain().is_empty());
    }

    #[tokio::test]
    async fn utterance_finals_are_joined_and_pre_roll_replayed() {
        let stt = Arc::new(ScriptedStt::new(vec![Ok(vec![
            TranscriptEvent::Partial("I want".to_string()),
            TranscriptEvent::Final("I want to be".to_string()),
            TranscriptEvent::Final("a backend engineer".to_string()),
        ])]));
        let heard = stt.heard.clone();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);
        let stage =
            SttStage::new(stt, events_tx, reporter()).with_pre_roll(Duration::from_millis(40));
        let task = tokio::spawn(stage.run(input_rx, CancellationToken::new()));

        for seq in 0..5 {
            input_tx.send(SegmentEvent::Audio(chunk(seq))).await.unwrap();
        }
        input_tx
            .send(SegmentEvent::SpeechStart { at: Duration::ZERO })
            .await
            .unwrap();
        for seq in 5..8 {
            input_tx.send(SegmentEvent::Audio(chunk(seq))).await.unwrap();
        }
        input_tx
            .send(SegmentEvent::SpeechEnd { at: Duration::ZERO })
            .await
            .unwrap();
        drop(input_tx);
        task.await.unwrap();

        let events = drain(&mut events_rx).await;
        assert_eq!(
            events[0],
            SessionEvent::PartialTranscript("I want".to_string())
        );
        assert_eq!(finals(&events), vec!["I want to be a backend engineer"]);
        assert_eq!(heard.lock().unwrap()[0], vec![3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn finals_keep_utterance_order() {
        let stt = Arc::new(ScriptedStt::new(vec![
            Ok(vec![TranscriptEvent::Final("first".to_string())]),
            Ok(vec![TranscriptEvent::Final("second".to_string())]),
        ]));
        // The first recognizer answers well after the second.
        stt.delays
            .lock()
            .unwrap()
            .extend([Duration::from_millis(200), Duration::ZERO]);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);
        let stage = SttStage::new(stt, events_tx, reporter()).with_pre_roll(Duration::ZERO);
        let task = tokio::spawn(stage.run(input_rx, CancellationToken::new()));

        for seq in 0..2 {
            input_tx
                .send(SegmentEvent::SpeechStart { at: Duration::ZERO })
                .await
                .unwrap();
            input_tx.send(SegmentEvent::Audio(chunk(seq))).await.unwrap();
            input_tx
                .send(SegmentEvent::SpeechEnd { at: Duration::ZERO })
                .await
                .unwrap();
        }
        drop(input_tx);
        task.await.unwrap();

        let events = drain(&mut events_rx).await;
        assert_eq!(finals(&events), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failed_utterance_reports_and_empty_one_is_discarded() {
        let stt = Arc::new(ScriptedStt::new(vec![
            Err(VoiceError::Stt("connection refused".to_string())),
            Ok(vec![TranscriptEvent::Final("   ".to_string())]),
        ]));
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);
        let stage = SttStage::new(stt, events_tx, reporter());
        let task = tokio::spawn(stage.run(input_rx, CancellationToken::new()));

        for seq in 0..2 {
            input_tx
                .send(SegmentEvent::SpeechStart { at: Duration::ZERO })
                .await
                .unwrap();
            input_tx.send(SegmentEvent::Audio(chunk(seq))).await.unwrap();
            input_tx
                .send(SegmentEvent::SpeechEnd { at: Duration::ZERO })
                .await
                .unwrap();
        }
        drop(input_tx);
        task.await.unwrap();

        let events = drain(&mut events_rx).await;
        assert_eq!(
            events,
            vec![
                SessionEvent::SttFailed(VoiceError::Stt("connection refused".to_string())),
                SessionEvent::UtteranceDiscarded,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_recognizer_fails_the_utterance() {
        let stt = Arc::new(ScriptedStt::new(vec![Ok(vec![TranscriptEvent::Final(
            "too late".to_string(),
        )])]));
        stt.delays.lock().unwrap().push_back(Duration::from_secs(600));
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);
        let stage = SttStage::new(stt, events_tx, reporter()).with_pre_roll(Duration::ZERO);
        let task = tokio::spawn(stage.run(input_rx, CancellationToken::new()));

        input_tx
            .send(SegmentEvent::SpeechStart { at: Duration::ZERO })
            .await
            .unwrap();
        input_tx.send(SegmentEvent::Audio(chunk(0))).await.unwrap();
        input_tx
            .send(SegmentEvent::SpeechEnd { at: Duration::ZERO })
            .await
            .unwrap();
        drop(input_tx);
        task.await.unwrap();

        let events = drain(&mut events_rx).await;
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::SttFailed(VoiceError::Stt(_))]
        ));
    }

    #[tokio::test]
    async fn continuous_mode_reports_each_final() {
        let stt = Arc::new(ScriptedStt::new(vec![Ok(vec![
            TranscriptEvent::Final("hello".to_string()),
            TranscriptEvent::Partial("how".to_string()),
            TranscriptEvent::Final("how are you".to_string()),
        ])]));
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);
        let stage = SttStage::new(stt, events_tx, reporter());
        let task = tokio::spawn(stage.run_continuous(input_rx, CancellationToken::new()));

        for seq in 0..3 {
            input_tx.send(SegmentEvent::Audio(chunk(seq))).await.unwrap();
        }
        drop(input_tx);
        task.await.unwrap();

        let events = drain(&mut events_rx).await;
        assert_eq!(finals(&events), vec!["hello", "how are you"]);
    }
}
