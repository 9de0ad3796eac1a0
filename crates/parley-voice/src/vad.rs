//! Energy-based voice activity segmentation.
//!
//! The segmenter is a synchronous state machine over inbound chunks. It keeps
//! an exponentially smoothed volume estimate and applies start/stop dwell
//! times measured in audio time, so the same input always produces the same
//! boundaries regardless of how fast chunks arrive.

use crate::config::VadConfig;
use parley_types::AudioChunk;
use std::time::Duration;

/// Volume at or below this level maps to 0.0.
const VOLUME_FLOOR_DB: f32 = -60.0;

/// Volume at or above this level maps to 1.0. Conversational speech into a
/// headset or laptop microphone sits around -35..-20 dBFS.
const VOLUME_CEILING_DB: f32 = -20.0;

/// Weight of the newest chunk in the smoothed confidence.
const SMOOTHING: f32 = 0.5;

/// Output of the segmenter, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Speech began. `at` is the audio position where detection completed.
    SpeechStart { at: Duration },
    /// Speech ended.
    SpeechEnd { at: Duration },
    /// An inbound chunk forwarded downstream unmodified.
    Audio(AudioChunk),
}

impl SegmentEvent {
    pub fn is_boundary(&self) -> bool {
        !matches!(self, Self::Audio(_))
    }
}

#[derive(Debug)]
enum State {
    Quiet,
    Starting {
        elapsed: f32,
        held: Vec<AudioChunk>,
    },
    Speaking,
    Stopping {
        elapsed: f32,
    },
}

/// Maps a normalized RMS amplitude onto a 0..1 loudness scale, linear in
/// dBFS between the floor and the ceiling.
///
/// With this scale -30 dBFS reads 0.75, -40 dBFS reads 0.5 and -50 dBFS
/// reads 0.25.
pub fn volume(rms: f32) -> f32 {
    if rms <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * rms.log10();
    ((db - VOLUME_FLOOR_DB) / (VOLUME_CEILING_DB - VOLUME_FLOOR_DB)).clamp(0.0, 1.0)
}

#[derive(Debug)]
pub struct VadSegmenter {
    config: VadConfig,
    state: State,
    smoothed: f32,
    position: Duration,
}

impl VadSegmenter {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: State::Quiet,
            smoothed: 0.0,
            position: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Whether an utterance is open (between start and end events).
    pub fn is_speaking(&self) -> bool {
        matches!(self.state, State::Speaking | State::Stopping { .. })
    }

    /// Current smoothed confidence.
    pub fn confidence(&self) -> f32 {
        self.smoothed
    }

    /// Audio time consumed so far.
    pub fn position(&self) -> Duration {
        self.position
    }

    /// Feeds one chunk and returns the resulting events.
    ///
    /// With pass-through enabled every chunk is returned exactly once, in
    /// input order, followed by any boundary it caused. Without pass-through
    /// only utterance audio is returned, after its `SpeechStart`.
    pub fn process(&mut self, chunk: AudioChunk) -> Vec<SegmentEvent> {
        let dur = chunk.duration();
        self.position += dur;
        let dur = dur.as_secs_f32();

        let instant = volume(chunk.rms());
        self.smoothed += SMOOTHING * (instant - self.smoothed);
        let is_speech =
            self.smoothed >= self.config.confidence && instant >= self.config.min_volume;

        let passthrough = self.config.passthrough;
        let at = self.position;
        let mut events = Vec::with_capacity(2);
        let state = std::mem::replace(&mut self.state, State::Quiet);

        self.state = match state {
            State::Quiet if is_speech => {
                let mut held = Vec::new();
                if passthrough {
                    events.push(SegmentEvent::Audio(chunk));
                } else {
                    held.push(chunk);
                }
                self.begin_or_wait(dur, held, at, &mut events)
            }
            State::Quiet => {
                if passthrough {
                    events.push(SegmentEvent::Audio(chunk));
                }
                State::Quiet
            }
            State::Starting { elapsed, mut held } if is_speech => {
                if passthrough {
                    events.push(SegmentEvent::Audio(chunk));
                } else {
                    held.push(chunk);
                }
                self.begin_or_wait(elapsed + dur, held, at, &mut events)
            }
            State::Starting { .. } => {
                if passthrough {
                    events.push(SegmentEvent::Audio(chunk));
                }
                State::Quiet
            }
            State::Speaking if is_speech => {
                events.push(SegmentEvent::Audio(chunk));
                State::Speaking
            }
            State::Speaking => {
                events.push(SegmentEvent::Audio(chunk));
                self.end_or_wait(dur, at, &mut events)
            }
            State::Stopping { .. } if is_speech => {
                events.push(SegmentEvent::Audio(chunk));
                State::Speaking
            }
            State::Stopping { elapsed } => {
                events.push(SegmentEvent::Audio(chunk));
                self.end_or_wait(elapsed + dur, at, &mut events)
            }
        };

        events
    }

    /// Closes an open utterance at end of stream so boundaries stay paired.
    pub fn finish(&mut self) -> Vec<SegmentEvent> {
        let was_speaking = self.is_speaking();
        self.state = State::Quiet;
        self.smoothed = 0.0;
        if was_speaking {
            vec![SegmentEvent::SpeechEnd { at: self.position }]
        } else {
            Vec::new()
        }
    }

    fn begin_or_wait(
        &self,
        elapsed: f32,
        held: Vec<AudioChunk>,
        at: Duration,
        events: &mut Vec<SegmentEvent>,
    ) -> State {
        if elapsed < self.config.start_secs {
            return State::Starting { elapsed, held };
        }
        events.push(SegmentEvent::SpeechStart { at });
        events.extend(held.into_iter().map(SegmentEvent::Audio));
        State::Speaking
    }

    fn end_or_wait(&self, elapsed: f32, at: Duration, events: &mut Vec<SegmentEvent>) -> State {
        if elapsed < self.config.stop_secs {
            return State::Stopping { elapsed };
        }
        events.push(SegmentEvent::SpeechEnd { at });
        State::Quiet
    }
}
