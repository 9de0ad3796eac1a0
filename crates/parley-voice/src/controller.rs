//! Turn-taking state machine.
//!
//! [`SessionController`] owns the dialogue [`Context`] and the [`TurnState`].
//! It performs no I/O: every input arrives as a [`SessionEvent`] and every
//! effect leaves as a [`Command`] for the session runner to execute. Results
//! from collaborators carry the turn id they were started for, and results
//! for any turn other than the active one are ignored.

use crate::context::{Context, ContextMark};
use crate::error::{Stage, TransportError, VoiceError};
use parley_types::{Message, Notice, Role, TurnState};

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub system_prompt: String,
    /// Spoken on connect. Empty disables the greeting.
    pub greeting: String,
    pub allow_interruptions: bool,
    /// Stage failures without a completed turn in between after which the
    /// session is closed.
    pub max_stage_failures: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            greeting: String::new(),
            allow_interruptions: true,
            max_stage_failures: 3,
        }
    }
}

/// Inputs to the controller, in the order the runner observed them.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    SpeechStarted,
    SpeechStopped,
    PartialTranscript(String),
    FinalTranscript(String),
    /// An utterance ended without producing any words.
    UtteranceDiscarded,
    SttFailed(VoiceError),
    GenerationFinished {
        turn: u64,
        result: Result<String, VoiceError>,
    },
    SpeechFinished {
        turn: u64,
        result: Result<(), VoiceError>,
    },
    Disconnected,
    TransportFailed(TransportError),
}

/// Effects requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start generating a reply from this context snapshot.
    Generate { turn: u64, context: Vec<Message> },
    /// Synthesize and play this text.
    Speak { turn: u64, text: String },
    /// Stop all in-flight work for this turn.
    Cancel { turn: u64 },
    /// Discard queued outbound audio.
    FlushOutput,
    Notify(Notice),
    /// End the session and close the transport.
    Close,
}

#[derive(Debug)]
struct ActiveTurn {
    id: u64,
    mark: ContextMark,
    /// The user message that opened the turn; `None` for the greeting.
    user_text: Option<String>,
}

#[derive(Debug)]
pub struct SessionController {
    settings: ControllerSettings,
    state: TurnState,
    context: Context,
    turns: u64,
    active: Option<ActiveTurn>,
    /// Final transcripts not yet attached to a turn.
    pending: Vec<String>,
    failures: u32,
    completed: u64,
}

impl SessionController {
    pub fn new(settings: ControllerSettings) -> Self {
        let context = Context::new(settings.system_prompt.clone());
        Self {
            settings,
            state: TurnState::Idle,
            context,
            turns: 0,
            active: None,
            pending: Vec::new(),
            failures: 0,
            completed: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Id of the turn currently in flight, if any.
    pub fn active_turn(&self) -> Option<u64> {
        self.active.as_ref().map(|t| t.id)
    }

    /// Number of turns that ran to completion.
    pub fn completed_turns(&self) -> u64 {
        self.completed
    }

    pub fn is_closed(&self) -> bool {
        self.state == TurnState::Closed
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Command> {
        if self.is_closed() {
            tracing::trace!(?event, "session closed; ignoring event");
            return Vec::new();
        }

        let mut out = Vec::new();
        match event {
            SessionEvent::Connected => self.on_connected(&mut out),
            SessionEvent::SpeechStarted => {
                if self.state.is_responding() && self.settings.allow_interruptions {
                    self.interrupt(&mut out);
                }
            }
            SessionEvent::SpeechStopped => {}
            SessionEvent::PartialTranscript(text) => {
                out.push(Command::Notify(Notice::Transcript {
                    role: Role::User,
                    text,
                    is_final: false,
                }));
            }
            SessionEvent::FinalTranscript(text) => self.on_final(text, &mut out),
            SessionEvent::UtteranceDiscarded => self.resume_held(&mut out),
            SessionEvent::SttFailed(err) => {
                self.on_failure(Stage::Stt, &err, &mut out);
                self.resume_held(&mut out);
            }
            SessionEvent::GenerationFinished { turn, result } => {
                self.on_generation(turn, result, &mut out)
            }
            SessionEvent::SpeechFinished { turn, result } => {
                self.on_speech_finished(turn, result, &mut out)
            }
            SessionEvent::Disconnected => {
                tracing::info!("client disconnected");
                self.close(&mut out);
            }
            SessionEvent::TransportFailed(err) => {
                tracing::warn!("transport failed: {}", err);
                self.close(&mut out);
            }
        }
        out
    }

    fn on_connected(&mut self, out: &mut Vec<Command>) {
        if self.state != TurnState::Idle {
            tracing::warn!(state = %self.state, "duplicate connect ignored");
            return;
        }
        self.transition(TurnState::Listening, out);

        let greeting = self.settings.greeting.trim().to_string();
        if greeting.is_empty() {
            return;
        }
        let mark = self.context.mark();
        if let Err(e) = self.context.append(Role::Assistant, greeting.clone()) {
            tracing::warn!("greeting not recorded: {}", e);
            return;
        }
        let turn = self.next_turn();
        self.active = Some(ActiveTurn {
            id: turn,
            mark,
            user_text: None,
        });
        out.push(Command::Notify(Notice::Transcript {
            role: Role::Assistant,
            text: greeting.clone(),
            is_final: true,
        }));
        self.transition(TurnState::Speaking, out);
        out.push(Command::Speak {
            turn,
            text: greeting,
        });
    }

    fn on_final(&mut self, text: String, out: &mut Vec<Command>) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        out.push(Command::Notify(Notice::Transcript {
            role: Role::User,
            text: text.clone(),
            is_final: true,
        }));
        self.pending.push(text);
        if self.state == TurnState::Listening {
            self.start_turn(out);
        } else {
            tracing::debug!(state = %self.state, "holding transcript until listening");
        }
    }

    fn start_turn(&mut self, out: &mut Vec<Command>) {
        if self.pending.is_empty() {
            return;
        }
        let text = self.pending.join(" ");
        let mark = self.context.mark();
        if let Err(e) = self.context.append(Role::User, text.clone()) {
            tracing::error!("dropping user message: {}", e);
            self.pending.clear();
            return;
        }
        self.pending.clear();

        let turn = self.next_turn();
        tracing::debug!(turn, "turn started");
        self.active = Some(ActiveTurn {
            id: turn,
            mark,
            user_text: Some(text),
        });
        self.transition(TurnState::Thinking, out);
        out.push(Command::Generate {
            turn,
            context: self.context.snapshot(),
        });
    }

    fn on_generation(
        &mut self,
        turn: u64,
        result: Result<String, VoiceError>,
        out: &mut Vec<Command>,
    ) {
        if !self.is_current(turn, TurnState::Thinking) {
            tracing::debug!(turn, "stale generation result ignored");
            return;
        }
        match result {
            Ok(text) => {
                if let Err(e) = self.context.append(Role::Assistant, text.clone()) {
                    tracing::error!("dropping reply: {}", e);
                    self.abandon_turn(out);
                    return;
                }
                out.push(Command::Notify(Notice::Transcript {
                    role: Role::Assistant,
                    text: text.clone(),
                    is_final: true,
                }));
                self.transition(TurnState::Speaking, out);
                out.push(Command::Speak { turn, text });
            }
            Err(err) => {
                if let Some(turn) = self.active.take() {
                    self.context.discard_since(turn.mark);
                }
                self.on_failure(Stage::Generation, &err, out);
                self.resume_listening(out);
            }
        }
    }

    fn on_speech_finished(
        &mut self,
        turn: u64,
        result: Result<(), VoiceError>,
        out: &mut Vec<Command>,
    ) {
        if !self.is_current(turn, TurnState::Speaking) {
            tracing::debug!(turn, "stale speech result ignored");
            return;
        }
        let finished = self.active.take();
        match result {
            Ok(()) => {
                if finished.is_some_and(|t| t.user_text.is_some()) {
                    self.completed += 1;
                    self.failures = 0;
                }
            }
            Err(err) => self.on_failure(Stage::Tts, &err, out),
        }
        self.resume_listening(out);
    }

    /// Back to listening after a turn ends, starting the next turn at once
    /// if transcripts arrived meanwhile.
    fn resume_listening(&mut self, out: &mut Vec<Command>) {
        if self.is_closed() {
            return;
        }
        self.transition(TurnState::Listening, out);
        self.start_turn(out);
    }

    /// Restarts words held back by an interruption once it is clear no
    /// transcript will follow them.
    fn resume_held(&mut self, out: &mut Vec<Command>) {
        if self.state == TurnState::Listening && self.active.is_none() {
            self.start_turn(out);
        }
    }

    /// Barge-in: stop the turn in flight and return to listening.
    fn interrupt(&mut self, out: &mut Vec<Command>) {
        let Some(turn) = self.active.take() else {
            return;
        };
        tracing::info!(turn = turn.id, state = %self.state, "interrupted");
        out.push(Command::Cancel { turn: turn.id });
        out.push(Command::FlushOutput);
        out.push(Command::Notify(Notice::Interruption));

        // A reply that was never produced leaves no trace; the user's words
        // are kept and joined with whatever they say next.
        if self.state == TurnState::Thinking {
            self.context.discard_since(turn.mark);
            if let Some(text) = turn.user_text {
                self.pending.insert(0, text);
            }
        }
        self.transition(TurnState::Listening, out);
    }

    /// Drops the active turn's messages from the context.
    fn abandon_turn(&mut self, out: &mut Vec<Command>) {
        if let Some(turn) = self.active.take() {
            self.context.discard_since(turn.mark);
        }
        self.transition(TurnState::Listening, out);
    }

    fn on_failure(&mut self, stage: Stage, err: &VoiceError, out: &mut Vec<Command>) {
        self.failures += 1;
        tracing::warn!(%stage, failures = self.failures, "stage failed: {}", err);
        out.push(Command::Notify(Notice::Error {
            stage: stage.as_str().to_string(),
            message: err.to_string(),
        }));
        if self.failures >= self.settings.max_stage_failures {
            tracing::error!(failures = self.failures, "too many consecutive failures; closing");
            self.close(out);
        }
    }

    fn close(&mut self, out: &mut Vec<Command>) {
        if let Some(turn) = self.active.take() {
            out.push(Command::Cancel { turn: turn.id });
        }
        self.state = TurnState::Closed;
        out.push(Command::Close);
    }

    fn transition(&mut self, next: TurnState, out: &mut Vec<Command>) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        out.push(Command::Notify(Notice::State { state: next }));
    }

    fn is_current(&self, turn: u64, state: TurnState) -> bool {
        self.state == state && self.active.as_ref().is_some_and(|t| t.id == turn)
    }

    fn next_turn(&mut self) -> u64 {
        self.turns += 1;
        self.turns
    }
}
