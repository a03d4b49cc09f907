//! Periodic frame capture with single-flight detection submission
//!
//! ```text
//! tick (200 ms) ─┬─ in flight?            → skip, no queueing
//!                ├─ peer not connected?   → skip
//!                ├─ no frame yet?         → skip
//!                └─ sample → resize → JPEG → submit (in flight until done)
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::{CaptureFrame, DetectionBackend};
use super::store::DetectionStore;
use crate::config::CaptureConfig;
use crate::utils::{unix_millis, LogThrottler};
use crate::video::{encode_detection_jpeg, PreferredSource};
use crate::webrtc::ConnectionState;

/// Millisecond wall clock used to stamp frames
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        unix_millis()
    }
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Submitted { frame_id: String },
    /// Previous submission still running
    Busy,
    NotConnected,
    /// No source has produced a frame yet
    NoFrame,
    EncodeFailed,
}

/// Counters for the lifetime of one loop
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped_busy: AtomicU64,
    pub skipped_not_connected: AtomicU64,
    pub skipped_no_frame: AtomicU64,
}

impl CaptureStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Clears the in-flight flag however the submission ends
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Samples the preferred video source on a fixed period and submits
/// downsampled JPEG stills for detection, one at a time
pub struct FrameCaptureLoop {
    source: PreferredSource,
    backend: Arc<dyn DetectionBackend>,
    store: DetectionStore,
    connection: watch::Receiver<ConnectionState>,
    config: CaptureConfig,
    clock: Arc<dyn Clock>,
    in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
    last_frame_id: AtomicI64,
    stats: Arc<CaptureStats>,
    throttler: Arc<LogThrottler>,
}

impl FrameCaptureLoop {
    pub fn new(
        source: PreferredSource,
        backend: Arc<dyn DetectionBackend>,
        store: DetectionStore,
        connection: watch::Receiver<ConnectionState>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            source,
            backend,
            store,
            connection,
            config,
            clock: Arc::new(SystemClock),
            in_flight: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            last_frame_id: AtomicI64::new(i64::MIN),
            stats: Arc::new(CaptureStats::default()),
            throttler: Arc::new(LogThrottler::with_secs(5)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share the in-flight flag with earlier loops so a restart waits for
    /// their last submission
    pub fn with_in_flight(mut self, in_flight: Arc<AtomicBool>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Tick until cancelled; results arriving after cancellation are dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        self.cancel = cancel.clone();
        let period = Duration::from_millis(self.config.period_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Frame capture started: every {:?}, {}x{}",
            period, self.config.target_width, self.config.target_height
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }

        let stats = &self.stats;
        info!(
            "Frame capture stopped: {} submitted, {} failed, {} skipped busy",
            stats.submitted(),
            stats.failed(),
            stats.skipped_busy.load(Ordering::Relaxed)
        );
    }

    /// Run one capture step
    ///
    /// Must be called from within a tokio runtime; the submission itself runs
    /// on a spawned task.
    pub fn tick(&self) -> TickOutcome {
        if self.is_in_flight() {
            self.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return TickOutcome::Busy;
        }

        if self.config.require_connected && *self.connection.borrow() != ConnectionState::Connected
        {
            self.stats
                .skipped_not_connected
                .fetch_add(1, Ordering::Relaxed);
            return TickOutcome::NotConnected;
        }

        let Some((source, frame)) = self.source.sample() else {
            self.stats.skipped_no_frame.fetch_add(1, Ordering::Relaxed);
            return TickOutcome::NoFrame;
        };

        let capture_ts = self.clock.now_millis();
        let jpeg = match encode_detection_jpeg(
            &frame,
            self.config.target_width,
            self.config.target_height,
            self.config.jpeg_quality,
        ) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                crate::warn_throttled!(self.throttler, "encode", "Cannot encode frame for detection: {}", e);
                return TickOutcome::EncodeFailed;
            }
        };

        let frame_id = self.next_frame_id().to_string();
        let capture = CaptureFrame {
            jpeg,
            frame_id: frame_id.clone(),
            capture_ts,
            source,
        };

        self.in_flight.store(true, Ordering::Release);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard(self.in_flight.clone());

        let backend = self.backend.clone();
        let store = self.store.clone();
        let stats = self.stats.clone();
        let throttler = self.throttler.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match backend.detect(&capture).await {
                Ok(_) if cancel.is_cancelled() => {
                    debug!("Dropping result for frame {}: detecting stopped", capture.frame_id);
                }
                Ok(set) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    store.replace(set);
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    crate::warn_throttled!(
                        throttler,
                        "detect",
                        "Detection failed for frame {}: {}",
                        capture.frame_id,
                        e
                    );
                }
            }
        });

        debug!("Submitted frame {} ({})", frame_id, source.as_str());
        TickOutcome::Submitted { frame_id }
    }

    /// Submission time in ms, bumped when the clock has not moved on
    fn next_frame_id(&self) -> i64 {
        let now = self.clock.now_millis();
        let mut last = self.last_frame_id.load(Ordering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match self.last_frame_id.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}
