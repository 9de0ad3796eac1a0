//! Transport seam and the outbound audio path.
//!
//! A transport is split into an [`AudioSource`] (inbound chunks) and an
//! [`AudioSink`] (outbound frames). The session never touches the sink
//! directly: stages push onto an [`OutputQueue`], and a single writer task
//! drains it into a [`ClosingSink`], which guarantees the connection is
//! closed exactly once on every exit path.

use crate::error::TransportError;
use async_trait::async_trait;
use parley_types::{AudioChunk, Direction, Notice};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// How far ahead of real time paced output may run.
const PACING_LEAD: Duration = Duration::from_millis(100);

/// A frame handed to the transport for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Audio(AudioChunk),
    Notice(Notice),
}

/// Inbound half of a transport.
#[async_trait]
pub trait AudioSource: Send + 'static {
    /// Next inbound chunk, or `None` once the peer has disconnected.
    async fn receive(&mut self) -> Option<Result<AudioChunk, TransportError>>;
}

/// Outbound half of a transport.
#[async_trait]
pub trait AudioSink: Send + 'static {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// One live client connection.
pub trait AudioTransport: Send + 'static {
    type Source: AudioSource;
    type Sink: AudioSink;

    fn split(self) -> (Self::Source, Self::Sink);
}

/// Wraps a sink so that `close` is attempted exactly once and its errors are
/// logged rather than propagated.
pub struct ClosingSink<S: AudioSink> {
    inner: S,
    closed: bool,
}

impl<S: AudioSink> ClosingSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.inner.send(frame).await
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.close().await {
            tracing::debug!("ignoring error while closing transport: {}", e);
        }
    }
}

/// Generation counter for outbound audio. Audio queued under an older epoch
/// is discarded by the writer.
#[derive(Debug, Clone, Default)]
pub struct OutputGate(Arc<AtomicU64>);

impl OutputGate {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Invalidates everything queued so far and returns the new epoch.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Items travelling from stages to the writer task, in queue order.
#[derive(Debug)]
pub enum Outgoing {
    Audio {
        epoch: u64,
        sample_rate: u32,
        samples: Vec<i16>,
    },
    /// Resolved once every item queued before it has been handled.
    Marker(oneshot::Sender<()>),
}

/// Cloneable handle to the outbound path.
///
/// Audio travels on a bounded queue so synthesis is throttled by playback.
/// Notices travel on a separate unbounded queue that the writer drains
/// first, so control traffic never waits behind audio.
#[derive(Debug, Clone)]
pub struct OutputQueue {
    audio: mpsc::Sender<Outgoing>,
    control: mpsc::UnboundedSender<Notice>,
    gate: OutputGate,
}

/// Receiving half of an [`OutputQueue`], consumed by [`run_writer`].
#[derive(Debug)]
pub struct OutputReceiver {
    audio: mpsc::Receiver<Outgoing>,
    control: mpsc::UnboundedReceiver<Notice>,
    gate: OutputGate,
}

impl OutputQueue {
    pub fn new(audio_capacity: usize) -> (Self, OutputReceiver) {
        let gate = OutputGate::default();
        let (audio_tx, audio_rx) = mpsc::channel(audio_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Self {
                audio: audio_tx,
                control: control_tx,
                gate: gate.clone(),
            },
            OutputReceiver {
                audio: audio_rx,
                control: control_rx,
                gate,
            },
        )
    }

    pub fn epoch(&self) -> u64 {
        self.gate.current()
    }

    /// Drops all audio queued so far.
    pub fn flush(&self) -> u64 {
        self.gate.advance()
    }

    pub async fn audio(
        &self,
        epoch: u64,
        sample_rate: u32,
        samples: Vec<i16>,
    ) -> Result<(), TransportError> {
        self.audio
            .send(Outgoing::Audio {
                epoch,
                sample_rate,
                samples,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Best effort; notices are dropped once the writer is gone.
    pub fn notice(&self, notice: Notice) {
        if self.control.send(notice).is_err() {
            tracing::debug!("output closed; dropping notice");
        }
    }

    /// Waits until the writer has handled all audio queued before this call.
    pub async fn drained(&self) -> Result<(), TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.audio
            .send(Outgoing::Marker(done_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        done_rx.await.map_err(|_| TransportError::Closed)
    }
}

/// Releases audio no faster than real time plus [`PACING_LEAD`].
#[derive(Debug, Default)]
struct Pacer {
    next_due: Option<Instant>,
}

impl Pacer {
    async fn wait(&mut self, duration: Duration) {
        let now = Instant::now();
        let due = self.next_due.filter(|d| *d > now).unwrap_or(now);
        if due > now + PACING_LEAD {
            tokio::time::sleep_until(due - PACING_LEAD).await;
        }
        self.next_due = Some(due + duration);
    }

    fn reset(&mut self) {
        self.next_due = None;
    }
}

/// Drains the output queue into the sink until every queue handle is dropped
/// or the sink fails, then closes the sink.
///
/// Returns the error that stopped delivery, if any.
pub async fn run_writer<S: AudioSink>(
    output: OutputReceiver,
    mut sink: ClosingSink<S>,
    pace: bool,
) -> Option<TransportError> {
    let OutputReceiver {
        audio: mut audio_rx,
        control: mut control_rx,
        gate,
    } = output;
    let mut seq = 0u64;
    let mut pacer = Pacer::default();
    let mut last_epoch = gate.current();
    let mut control_open = true;
    let mut failure = None;

    loop {
        let frame = tokio::select! {
            biased;
            notice = control_rx.recv(), if control_open => match notice {
                Some(notice) => OutboundFrame::Notice(notice),
                None => {
                    control_open = false;
                    continue;
                }
            },
            item = audio_rx.recv() => match item {
                Some(Outgoing::Audio { epoch, sample_rate, samples }) => {
                    if epoch != gate.current() {
                        continue;
                    }
                    if epoch != last_epoch {
                        pacer.reset();
                        last_epoch = epoch;
                    }
                    let chunk = AudioChunk::new(seq, Direction::Outbound, sample_rate, samples);
                    if pace {
                        pacer.wait(chunk.duration()).await;
                        if epoch != gate.current() {
                            continue;
                        }
                    }
                    seq += 1;
                    OutboundFrame::Audio(chunk)
                }
                Some(Outgoing::Marker(done)) => {
                    let _ = done.send(());
                    continue;
                }
                None => break,
            },
        };

        if let Err(e) = sink.send(frame).await {
            tracing::warn!("outbound send failed: {}", e);
            failure = Some(e);
            break;
        }
    }

    if failure.is_none() {
        while let Ok(notice) = control_rx.try_recv() {
            if sink.send(OutboundFrame::Notice(notice)).await.is_err() {
                break;
            }
        }
    }
    sink.close().await;
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<OutboundFrame>>>,
        closes: Arc<AtomicU64>,
        fail_close: bool,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(TransportError::Send("already gone".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn closing_sink_closes_once_and_swallows_errors() {
        let inner = RecordingSink {
            fail_close: true,
            ..RecordingSink::default()
        };
        let closes = inner.closes.clone();
        let mut sink = ClosingSink::new(inner);
        sink.close().await;
        sink.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(sink.is_closed());
        assert_eq!(
            sink.send(OutboundFrame::Notice(Notice::Interruption)).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn writer_drops_stale_epochs_and_numbers_sent_chunks() {
        let inner = RecordingSink::default();
        let frames = inner.frames.clone();
        let closes = inner.closes.clone();
        let (queue, rx) = OutputQueue::new(16);

        queue.audio(0, 16_000, vec![1; 4]).await.unwrap();
        queue.audio(0, 16_000, vec![2; 4]).await.unwrap();
        let epoch = queue.flush();
        queue.audio(0, 16_000, vec![3; 4]).await.unwrap();
        queue.audio(epoch, 16_000, vec![4; 4]).await.unwrap();
        queue.notice(Notice::Interruption);
        drop(queue);

        // The writer only starts after the flush, so epoch 0 audio is stale.
        let failure = run_writer(rx, ClosingSink::new(inner), false).await;
        assert!(failure.is_none());

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        // Control traffic is delivered ahead of queued audio.
        assert_eq!(frames[0], OutboundFrame::Notice(Notice::Interruption));
        match &frames[1] {
            OutboundFrame::Audio(chunk) => {
                assert_eq!(chunk.seq, 0);
                assert_eq!(chunk.samples, vec![4; 4]);
                assert_eq!(chunk.direction, Direction::Outbound);
            }
            other => panic!("expected audio, got {:?}", other),
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drained_resolves_after_prior_items() {
        let inner = RecordingSink::default();
        let frames = inner.frames.clone();
        let (queue, rx) = OutputQueue::new(16);
        let writer = tokio::spawn(run_writer(rx, ClosingSink::new(inner), false));

        queue.audio(0, 16_000, vec![0; 8]).await.unwrap();
        queue.drained().await.unwrap();
        assert_eq!(frames.lock().unwrap().len(), 1);

        drop(queue);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn paced_output_tracks_real_time() {
        let inner = RecordingSink::default();
        let (queue, rx) = OutputQueue::new(64);

        // 50 chunks of 20ms = 1s of audio.
        for _ in 0..50 {
            queue.audio(0, 16_000, vec![0; 320]).await.unwrap();
        }
        drop(queue);

        let started = Instant::now();
        run_writer(rx, ClosingSink::new(inner), true).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(850), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1000), "elapsed {:?}", elapsed);
    }
}
