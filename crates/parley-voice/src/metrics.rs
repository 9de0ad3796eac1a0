//! Per-stage latency measurement.

use crate::error::Stage;
use crate::transport::OutputQueue;
use parley_types::Notice;
use std::time::Duration;
use tokio::time::Instant;

/// Timing for one stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMetrics {
    pub stage: Stage,
    /// Time until the first result byte, where the stage streams.
    pub ttfb: Option<Duration>,
    pub processing: Duration,
}

impl StageMetrics {
    pub fn to_notice(&self) -> Notice {
        Notice::Metrics {
            stage: self.stage.as_str().to_string(),
            ttfb_ms: self.ttfb.map(|d| d.as_millis() as u64),
            processing_ms: self.processing.as_millis() as u64,
        }
    }
}

#[derive(Debug)]
pub struct StageTimer {
    stage: Stage,
    started: Instant,
    first_byte: Option<Duration>,
}

impl StageTimer {
    pub fn start(stage: Stage) -> Self {
        Self::start_at(stage, Instant::now())
    }

    /// Starts a timer whose clock began earlier, e.g. at end of speech.
    pub fn start_at(stage: Stage, started: Instant) -> Self {
        Self {
            stage,
            started,
            first_byte: None,
        }
    }

    /// Records time to first byte. Later calls are ignored.
    pub fn first_byte(&mut self) {
        if self.first_byte.is_none() {
            self.first_byte = Some(self.started.elapsed());
        }
    }

    pub fn finish(self) -> StageMetrics {
        StageMetrics {
            stage: self.stage,
            ttfb: self.first_byte,
            processing: self.started.elapsed(),
        }
    }
}

/// Logs stage metrics and, when enabled, forwards them to the client.
#[derive(Debug, Clone)]
pub struct MetricsReporter {
    enabled: bool,
    output: OutputQueue,
}

impl MetricsReporter {
    pub fn new(enabled: bool, output: OutputQueue) -> Self {
        Self { enabled, output }
    }

    pub fn report(&self, metrics: StageMetrics) {
        tracing::debug!(
            stage = %metrics.stage,
            ttfb_ms = metrics.ttfb.map(|d| d.as_millis() as u64),
            processing_ms = metrics.processing.as_millis() as u64,
            "stage metrics"
        );
        if self.enabled {
            self.output.notice(metrics.to_notice());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_records_first_byte_once() {
        let mut timer = StageTimer::start(Stage::Generation);
        tokio::time::advance(Duration::from_millis(120)).await;
        timer.first_byte();
        tokio::time::advance(Duration::from_millis(80)).await;
        timer.first_byte();
        let metrics = timer.finish();
        assert_eq!(metrics.ttfb, Some(Duration::from_millis(120)));
        assert_eq!(metrics.processing, Duration::from_millis(200));
        assert_eq!(
            metrics.to_notice(),
            Notice::Metrics {
                stage: "generation".to_string(),
                ttfb_ms: Some(120),
                processing_ms: 200,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timer_without_first_byte() {
        let timer = StageTimer::start(Stage::Stt);
        tokio::time::advance(Duration::from_millis(40)).await;
        let metrics = timer.finish();
        assert_eq!(metrics.ttfb, None);
        assert_eq!(metrics.processing, Duration::from_millis(40));
    }
}
