use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::transport::StatSample;

mod history;
pub mod logging;
mod window;

pub use history::{DEFAULT_HISTORY_CAPACITY, PerformanceDataPoint, PerformanceHistory};
pub use window::RollingWindow;

pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub period: Duration,
    pub history_capacity: usize,
    /// Frame-count deltas averaged into the instantaneous FPS.
    pub delta_window: usize,
    /// Non-zero instantaneous readings averaged into the displayed FPS.
    pub fps_window: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            delta_window: 3,
            fps_window: 5,
        }
    }
}

/// Which series the chart renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Metric {
    #[default]
    Fps,
    Bitrate,
    Latency,
}

impl Metric {
    pub fn label(self) -> &'static str {
        match self {
            Metric::Fps => "FPS",
            Metric::Bitrate => "Bitrate (Kbps)",
            Metric::Latency => "Latency (ms)",
        }
    }

    pub fn value(self, point: &PerformanceDataPoint) -> f64 {
        match self {
            Metric::Fps => point.fps,
            Metric::Bitrate => point.bitrate_kbps,
            Metric::Latency => point.latency_ms,
        }
    }
}

/// Whole-value view published to readers after every accepted sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub latency_ms: f64,
    pub summary: String,
    pub history: Vec<PerformanceDataPoint>,
    pub metric: Metric,
    pub samples: u64,
}

impl TelemetrySnapshot {
    /// `(timestamp, value)` pairs for the selected metric.
    pub fn chart_series(&self) -> Vec<(f64, f64)> {
        self.history
            .iter()
            .map(|point| (point.timestamp, self.metric.value(point)))
            .collect()
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            fps: 0.0,
            bitrate_kbps: 0.0,
            latency_ms: 0.0,
            summary: summary_line(0.0, 0.0, 0.0),
            history: Vec::new(),
            metric: Metric::default(),
            samples: 0,
        }
    }
}

pub fn format_bitrate(kbps: f64) -> String {
    if kbps < 1000.0 {
        format!("{kbps:.0} Kbps")
    } else {
        format!("{:.1} Mbps", kbps / 1000.0)
    }
}

pub fn summary_line(fps: f64, bitrate_kbps: f64, latency_ms: f64) -> String {
    format!(
        "FPS: {fps:.0} | {} | Latency: {latency_ms:.0} ms",
        format_bitrate(bitrate_kbps)
    )
}

/// Turns raw, monotonic transport counters into smoothed link-quality
/// numbers and a bounded history.
///
/// The aggregator is plain state; the session actor owns it, drives the
/// ticker and feeds completed stats queries in through [`ingest`].
///
/// [`ingest`]: TelemetryAggregator::ingest
#[derive(Debug)]
pub struct TelemetryAggregator {
    config: TelemetryConfig,
    deltas: RollingWindow,
    readings: RollingWindow,
    history: PerformanceHistory,
    previous: Option<StatSample>,
    last_sampled_at: Option<Instant>,
    origin: Option<Instant>,
    fps: f64,
    instantaneous_fps: f64,
    bitrate_kbps: f64,
    latency_ms: f64,
    metric: Metric,
    samples: u64,
}

impl TelemetryAggregator {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            deltas: RollingWindow::new(config.delta_window),
            readings: RollingWindow::new(config.fps_window),
            history: PerformanceHistory::new(config.history_capacity),
            config,
            previous: None,
            last_sampled_at: None,
            origin: None,
            fps: 0.0,
            instantaneous_fps: 0.0,
            bitrate_kbps: 0.0,
            latency_ms: 0.0,
            metric: Metric::default(),
            samples: 0,
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Forgets the previous sample and the smoothing windows so the next
    /// sample is treated as the first. History and the timeline are kept.
    pub fn restart(&mut self) {
        self.previous = None;
        self.deltas.clear();
        self.readings.clear();
    }

    /// Folds one stats sample in. Returns `false` when the sample is not
    /// newer than the last accepted one and was dropped.
    pub fn ingest(&mut self, sample: StatSample) -> bool {
        if self
            .last_sampled_at
            .is_some_and(|last| sample.sampled_at <= last)
        {
            return false;
        }
        let origin = *self.origin.get_or_insert(sample.sampled_at);

        match self.previous {
            Some(previous) => {
                let frames = sample.frames_decoded.saturating_sub(previous.frames_decoded);
                self.deltas.push(frames as f64);

                let elapsed = sample
                    .sampled_at
                    .duration_since(previous.sampled_at)
                    .as_secs_f64();
                let bytes = sample.bytes_received.saturating_sub(previous.bytes_received);
                self.bitrate_kbps = if elapsed > 0.0 {
                    bytes as f64 * 8.0 / elapsed / 1000.0
                } else {
                    0.0
                };
            }
            None => self.bitrate_kbps = 0.0,
        }

        self.instantaneous_fps = self.deltas.average();
        if self.instantaneous_fps > 0.0 {
            self.readings.push(self.instantaneous_fps);
        }
        self.fps = if self.readings.is_empty() {
            self.instantaneous_fps
        } else {
            self.readings.average()
        };

        self.latency_ms = match (sample.round_trip_time_seconds, sample.jitter_seconds) {
            (Some(rtt), _) => rtt * 1000.0,
            (None, Some(jitter)) => jitter * 1000.0,
            (None, None) => 0.0,
        };

        self.history.push(PerformanceDataPoint {
            timestamp: sample.sampled_at.duration_since(origin).as_secs_f64(),
            fps: self.fps,
            bitrate_kbps: self.bitrate_kbps,
            latency_ms: self.latency_ms,
        });

        self.previous = Some(sample);
        self.last_sampled_at = Some(sample.sampled_at);
        self.samples += 1;
        true
    }

    pub fn select_metric(&mut self, metric: Metric) {
        self.metric = metric;
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn instantaneous_fps(&self) -> f64 {
        self.instantaneous_fps
    }

    pub fn bitrate_kbps(&self) -> f64 {
        self.bitrate_kbps
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    pub fn history(&self) -> &PerformanceHistory {
        &self.history
    }

    pub fn summary(&self) -> String {
        summary_line(self.fps, self.bitrate_kbps, self.latency_ms)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            fps: self.fps,
            bitrate_kbps: self.bitrate_kbps,
            latency_ms: self.latency_ms,
            summary: self.summary(),
            history: self.history.to_vec(),
            metric: self.metric,
            samples: self.samples,
        }
    }
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new(TelemetryConfig::default())
    }
}
