//! Overlay frame rate and detection latency

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::detection::DetectionSet;

/// Latency samples kept for the summary; older ones are discarded
const MAX_TIMINGS: usize = 10_000;

/// Rolling one-second frame counter
#[derive(Debug, Clone)]
pub struct FpsMeter {
    frame_times: VecDeque<Instant>,
    window: Duration,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            frame_times: VecDeque::with_capacity(64),
            window: Duration::from_secs(1),
        }
    }

    pub fn record_frame(&mut self) {
        self.record_frame_at(Instant::now());
    }

    fn record_frame_at(&mut self, now: Instant) {
        self.frame_times.push_back(now);
        while let Some(&oldest) = self.frame_times.front() {
            if now.duration_since(oldest) > self.window {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames in the last window
    pub fn current_fps(&self) -> u32 {
        self.frame_times.len() as u32
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Timestamps (ms since epoch) of one detected frame, capture to display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameTiming {
    pub capture_ts: i64,
    pub recv_ts: i64,
    pub inference_ts: i64,
    pub overlay_ts: i64,
}

impl FrameTiming {
    /// Only sets that carry all detector timestamps can be timed
    pub fn from_set(set: &DetectionSet, overlay_ts: i64) -> Option<Self> {
        Some(Self {
            capture_ts: set.capture_ts?,
            recv_ts: set.recv_ts?,
            inference_ts: set.inference_ts?,
            overlay_ts,
        })
    }
}

/// Aggregated latency report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub count_frames: usize,
    pub median_e2e_ms: Option<f64>,
    pub p95_e2e_ms: Option<i64>,
    pub server_latency_median_ms: Option<f64>,
    pub network_latency_median_ms: Option<f64>,
    pub processed_fps: f64,
}

/// Collects [`FrameTiming`]s for the whole session
pub struct LatencyTracker {
    start_ts: i64,
    timings: Mutex<VecDeque<FrameTiming>>,
}

impl LatencyTracker {
    /// `start_ts` anchors the processed-FPS window
    pub fn new(start_ts: i64) -> Self {
        Self {
            start_ts,
            timings: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, timing: FrameTiming) {
        let mut timings = self.timings.lock();
        if timings.len() == MAX_TIMINGS {
            timings.pop_front();
        }
        timings.push_back(timing);
    }

    pub fn len(&self) -> usize {
        self.timings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.lock().is_empty()
    }

    pub fn summary(&self) -> MetricsSummary {
        let timings = self.timings.lock();
        if timings.is_empty() {
            return MetricsSummary {
                count_frames: 0,
                median_e2e_ms: None,
                p95_e2e_ms: None,
                server_latency_median_ms: None,
                network_latency_median_ms: None,
                processed_fps: 0.0,
            };
        }

        // Negative spans come from skewed clocks and are left out
        let spans = |f: fn(&FrameTiming) -> i64| -> Vec<i64> {
            timings.iter().map(f).filter(|d| *d >= 0).collect()
        };
        let e2e = spans(|t| t.overlay_ts - t.capture_ts);
        let server = spans(|t| t.inference_ts - t.recv_ts);
        let network = spans(|t| t.recv_ts - t.capture_ts);

        let last_overlay = timings.iter().map(|t| t.overlay_ts).max().unwrap_or(self.start_ts);
        let duration_s = ((last_overlay - self.start_ts) as f64 / 1000.0).max(1e-3);

        MetricsSummary {
            count_frames: timings.len(),
            median_e2e_ms: median(e2e.clone()),
            p95_e2e_ms: p95(e2e),
            server_latency_median_ms: median(server),
            network_latency_median_ms: median(network),
            processed_fps: timings.len() as f64 / duration_s,
        }
    }
}

fn median(mut values: Vec<i64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) as f64 / 2.0)
    } else {
        Some(values[mid] as f64)
    }
}

/// Nearest-rank below: index `floor(0.95 * (n - 1))`
fn p95(mut values: Vec<i64>) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let idx = (0.95 * (values.len() - 1) as f64) as usize;
    Some(values[idx])
}
