//! Session runner: wires one transport to the pipeline stages.
//!
//! Task layout per session:
//!
//! ```text
//! reader ──► segmenter ──► stt stage ──┐
//!    │           │                     ├──► controller loop ──► generation / speech tasks
//!    └───────────┴──── events ─────────┘            │                      │
//!                                                   └──── output queue ◄───┘
//!                                                              │
//!                                                           writer ──► sink
//! ```
//!
//! The controller loop is the only place that mutates turn state. Every turn
//! runs under its own child [`CancellationToken`] of the session token.

use crate::config::VadConfig;
use crate::controller::{Command, ControllerSettings, SessionController, SessionEvent};
use crate::error::Stage;
use crate::llm::{generate_reply, ResponseGenerator};
use crate::metrics::{MetricsReporter, StageTimer};
use crate::stt::{SpeechToText, SttStage};
use crate::transport::{run_writer, AudioSource, AudioTransport, ClosingSink, OutputQueue};
use crate::tts::{speak, SpeakOutcome, SpeechSynthesizer};
use crate::vad::{SegmentEvent, VadSegmenter};
use parley_types::{AudioChunk, Message, TurnState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

const EVENT_QUEUE_CAPACITY: usize = 256;
const INBOUND_QUEUE_CAPACITY: usize = 256;
const SEGMENT_QUEUE_CAPACITY: usize = 256;
const OUTPUT_QUEUE_CAPACITY: usize = 64;

/// How long the writer may keep draining after the session ends.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-session pipeline settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub controller: ControllerSettings,
    pub vad: VadConfig,
    /// Length of each outbound audio chunk.
    pub output_chunk: Duration,
    /// Release outbound audio no faster than real time.
    pub pace_output: bool,
    /// Send per-stage timing notices to the client.
    pub enable_metrics: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            controller: ControllerSettings::default(),
            vad: VadConfig::default(),
            output_chunk: Duration::from_millis(20),
            pace_output: true,
            enable_metrics: false,
        }
    }
}

/// External services used by a session.
#[derive(Clone)]
pub struct Collaborators {
    pub stt: Arc<dyn SpeechToText>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub final_state: TurnState,
    pub completed_turns: u64,
    pub context: Vec<Message>,
}

/// The turn whose tasks are currently running.
struct RunningTurn {
    id: u64,
    token: CancellationToken,
}

/// Runs one session to completion. Returns once the client has gone or the
/// session was closed, with the transport closed.
pub async fn run_session<T: AudioTransport>(
    settings: SessionSettings,
    collaborators: Collaborators,
    transport: T,
) -> SessionReport {
    let id = Uuid::new_v4();
    let span = tracing::info_span!("session", session_id = %id);
    run(id, settings, collaborators, transport)
        .instrument(span)
        .await
}

async fn run<T: AudioTransport>(
    id: Uuid,
    settings: SessionSettings,
    collaborators: Collaborators,
    transport: T,
) -> SessionReport {
    tracing::info!("session started");
    let (source, sink) = transport.split();
    let session = CancellationToken::new();

    let (output, output_rx) = OutputQueue::new(OUTPUT_QUEUE_CAPACITY);
    let metrics = MetricsReporter::new(settings.enable_metrics, output.clone());

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let (segment_tx, segment_rx) = mpsc::channel(SEGMENT_QUEUE_CAPACITY);

    let mut writer = {
        let events = events_tx.clone();
        let pace = settings.pace_output;
        tokio::spawn(
            async move {
                if let Some(e) = run_writer(output_rx, ClosingSink::new(sink), pace).await {
                    let _ = events.send(SessionEvent::TransportFailed(e)).await;
                }
            }
            .in_current_span(),
        )
    };
    tokio::spawn(
        read_inbound(source, inbound_tx, events_tx.clone(), session.child_token())
            .in_current_span(),
    );
    let vad = settings
        .vad
        .enabled
        .then(|| VadSegmenter::new(settings.vad.clone()));
    tokio::spawn(segment(vad, inbound_rx, segment_tx, events_tx.clone()).in_current_span());
    {
        let stage = SttStage::new(
            collaborators.stt.clone(),
            events_tx.clone(),
            metrics.clone(),
        );
        let token = session.child_token();
        if settings.vad.enabled {
            tokio::spawn(stage.run(segment_rx, token).in_current_span());
        } else {
            tracing::info!("voice activity detection disabled; interruptions unavailable");
            tokio::spawn(stage.run_continuous(segment_rx, token).in_current_span());
        }
    }

    let mut controller = SessionController::new(settings.controller.clone());
    let mut running: Option<RunningTurn> = None;
    let mut next = Some(SessionEvent::Connected);

    'session: while let Some(event) = next.take() {
        for command in controller.handle(event) {
            match command {
                Command::Generate { turn, context } => {
                    let token = turn_token(&mut running, turn, &session);
                    tokio::spawn(
                        generate_task(
                            turn,
                            collaborators.generator.clone(),
                            context,
                            token,
                            events_tx.clone(),
                            metrics.clone(),
                        )
                        .in_current_span(),
                    );
                }
                Command::Speak { turn, text } => {
                    let token = turn_token(&mut running, turn, &session);
                    let params = SpeakParams {
                        frame: settings.output_chunk,
                        epoch: output.epoch(),
                        output: output.clone(),
                        metrics: metrics.clone(),
                    };
                    tokio::spawn(
                        speak_task(
                            turn,
                            text,
                            collaborators.synthesizer.clone(),
                            params,
                            token,
                            events_tx.clone(),
                        )
                        .in_current_span(),
                    );
                }
                Command::Cancel { turn } => {
                    if running.as_ref().is_some_and(|r| r.id == turn) {
                        if let Some(current) = running.take() {
                            current.token.cancel();
                        }
                    }
                }
                Command::FlushOutput => {
                    output.flush();
                }
                Command::Notify(notice) => output.notice(notice),
                Command::Close => break 'session,
            }
        }
        next = events_rx.recv().await;
    }

    session.cancel();
    drop(events_rx);
    drop(metrics);
    drop(output);
    if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        tracing::warn!("writer did not drain in time; dropping connection");
        writer.abort();
    }

    let report = SessionReport {
        id,
        final_state: controller.state(),
        completed_turns: controller.completed_turns(),
        context: controller.context().snapshot(),
    };
    tracing::info!(turns = report.completed_turns, "session ended");
    report
}

/// Returns the cancellation token for `turn`, replacing any other turn's.
fn turn_token(
    running: &mut Option<RunningTurn>,
    turn: u64,
    session: &CancellationToken,
) -> CancellationToken {
    match running {
        Some(current) if current.id == turn => current.token.clone(),
        _ => {
            let token = session.child_token();
            if let Some(previous) = running.replace(RunningTurn {
                id: turn,
                token: token.clone(),
            }) {
                previous.token.cancel();
            }
            token
        }
    }
}

async fn read_inbound<S: AudioSource>(
    mut source: S,
    inbound: mpsc::Sender<AudioChunk>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = source.receive() => item,
        };
        match item {
            Some(Ok(chunk)) => {
                if inbound.send(chunk).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) if e.is_recoverable() => {
                tracing::warn!("dropping inbound frame: {}", e);
            }
            Some(Err(e)) => {
                let _ = events.send(SessionEvent::TransportFailed(e)).await;
                return;
            }
            None => {
                let _ = events.send(SessionEvent::Disconnected).await;
                return;
            }
        }
    }
}

/// Runs the segmenter over inbound audio. Boundaries go both to the
/// controller (for interruption) and downstream to the STT stage.
async fn segment(
    mut vad: Option<VadSegmenter>,
    mut inbound: mpsc::Receiver<AudioChunk>,
    segments: mpsc::Sender<SegmentEvent>,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some(chunk) = inbound.recv().await {
        let out = match vad.as_mut() {
            Some(vad) => vad.process(chunk),
            None => vec![SegmentEvent::Audio(chunk)],
        };
        if !forward(out, &segments, &events).await {
            return;
        }
    }
    if let Some(vad) = vad.as_mut() {
        forward(vad.finish(), &segments, &events).await;
    }
}

async fn forward(
    out: Vec<SegmentEvent>,
    segments: &mpsc::Sender<SegmentEvent>,
    events: &mpsc::Sender<SessionEvent>,
) -> bool {
    for event in out {
        let notify = match &event {
            SegmentEvent::SpeechStart { at } => {
                tracing::debug!(at_ms = at.as_millis() as u64, "speech started");
                Some(SessionEvent::SpeechStarted)
            }
            SegmentEvent::SpeechEnd { at } => {
                tracing::debug!(at_ms = at.as_millis() as u64, "speech stopped");
                Some(SessionEvent::SpeechStopped)
            }
            SegmentEvent::Audio(_) => None,
        };
        if let Some(notify) = notify {
            if events.send(notify).await.is_err() {
                return false;
            }
        }
        if segments.send(event).await.is_err() {
            return false;
        }
    }
    true
}

async fn generate_task(
    turn: u64,
    generator: Arc<dyn ResponseGenerator>,
    context: Vec<Message>,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    metrics: MetricsReporter,
) {
    let mut timer = StageTimer::start(Stage::Generation);
    let result = match generate_reply(generator.as_ref(), context, &cancel, &mut timer).await {
        Ok(Some(text)) => Ok(text),
        Ok(None) => {
            tracing::debug!(turn, "generation cancelled");
            return;
        }
        Err(e) => Err(e),
    };
    if result.is_ok() {
        metrics.report(timer.finish());
    }
    let _ = events
        .send(SessionEvent::GenerationFinished { turn, result })
        .await;
}

struct SpeakParams {
    frame: Duration,
    /// Output epoch when the turn was asked to speak.
    epoch: u64,
    output: OutputQueue,
    metrics: MetricsReporter,
}

async fn speak_task(
    turn: u64,
    text: String,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    params: SpeakParams,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
) {
    let SpeakParams {
        frame,
        epoch,
        output,
        metrics,
    } = params;
    let mut timer = StageTimer::start(Stage::Tts);
    let result = speak(
        synthesizer.as_ref(),
        &text,
        frame,
        epoch,
        &output,
        &cancel,
        &mut timer,
    )
    .await;
    let result = match result {
        Ok(SpeakOutcome::Completed) => {
            metrics.report(timer.finish());
            Ok(())
        }
        Ok(SpeakOutcome::Stopped) => {
            tracing::debug!(turn, "speech stopped before completion");
            return;
        }
        Err(e) => Err(e),
    };
    let _ = events
        .send(SessionEvent::SpeechFinished { turn, result })
        .await;
}
