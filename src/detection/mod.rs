//! Live object detection on the viewer
//!
//! Two delivery modes feed one [`DetectionStore`]:
//! - request/response: [`FrameCaptureLoop`] submits stills to a
//!   [`DetectionBackend`] (HTTP `POST /api/detect` at runtime)
//! - push: [`DetectionPushChannel`] receives sets from `/ws/detection`
//!
//! [`DetectionController`] switches "detecting" mode on and off.

pub mod capture_loop;
pub mod client;
pub mod push;
pub mod store;
pub mod types;

pub use capture_loop::{CaptureStats, Clock, FrameCaptureLoop, SystemClock, TickOutcome};
pub use client::{decode_detect_response, CaptureFrame, DetectionBackend, HttpDetector};
pub use push::DetectionPushChannel;
pub use store::DetectionStore;
pub use types::{
    decode_detection_payload, parse_detection_payload, Detection, DetectionOrigin, DetectionSet,
};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CaptureConfig;
use crate::events::{EventBus, SystemEvent};
use crate::video::PreferredSource;
use crate::webrtc::ConnectionState;

struct ActiveDetection {
    cancel: CancellationToken,
    capture: JoinHandle<()>,
    push: Option<DetectionPushChannel>,
    stats: Arc<CaptureStats>,
}

/// Owns "detecting" mode
///
/// Starting spawns the capture loop (and the push channel when a push URL
/// is set) under a child cancellation token; stopping cancels that token,
/// which stops the timer and closes the push channel together. Every loop
/// shares one in-flight flag, so a submission left running by `stop` still
/// blocks the next loop's first tick.
pub struct DetectionController {
    source: PreferredSource,
    backend: Arc<dyn DetectionBackend>,
    store: DetectionStore,
    connection: watch::Receiver<ConnectionState>,
    capture_config: CaptureConfig,
    push_url: Option<String>,
    in_flight: Arc<AtomicBool>,
    events: Arc<EventBus>,
    parent: CancellationToken,
    active: Option<ActiveDetection>,
}

impl DetectionController {
    pub fn new(
        source: PreferredSource,
        backend: Arc<dyn DetectionBackend>,
        store: DetectionStore,
        connection: watch::Receiver<ConnectionState>,
        capture_config: CaptureConfig,
        events: Arc<EventBus>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            source,
            backend,
            store,
            connection,
            capture_config,
            push_url: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            events,
            parent,
            active: None,
        }
    }

    /// Also listen on the push channel while detecting
    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = Some(url.into());
        self
    }

    pub fn store(&self) -> &DetectionStore {
        &self.store
    }

    pub fn is_detecting(&self) -> bool {
        self.active.is_some()
    }

    /// Counters of the running capture loop
    pub fn stats(&self) -> Option<Arc<CaptureStats>> {
        self.active.as_ref().map(|a| a.stats.clone())
    }

    /// Enter detecting mode; does nothing if already detecting
    pub fn start(&mut self) {
        if self.active.is_some() {
            return;
        }

        let cancel = self.parent.child_token();
        let capture = FrameCaptureLoop::new(
            self.source.clone(),
            self.backend.clone(),
            self.store.clone(),
            self.connection.clone(),
            self.capture_config.clone(),
        )
        .with_in_flight(self.in_flight.clone());
        let stats = capture.stats();
        let capture = tokio::spawn(capture.run(cancel.clone()));

        let push = self.push_url.as_ref().map(|url| {
            DetectionPushChannel::connect(url.clone(), self.store.clone(), cancel.clone())
        });

        self.active = Some(ActiveDetection {
            cancel,
            capture,
            push,
            stats,
        });
        info!("Detecting mode on");
        self.events
            .publish(SystemEvent::DetectionModeChanged { enabled: true });
    }

    /// Leave detecting mode, waiting for the timer and push reader to exit
    ///
    /// A submission already in flight is left to finish but its result is
    /// discarded.
    pub async fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        if let Err(e) = active.capture.await {
            warn!("Capture loop ended abnormally: {}", e);
        }
        if let Some(push) = active.push.as_mut() {
            push.close().await;
        }

        info!("Detecting mode off");
        self.events
            .publish(SystemEvent::DetectionModeChanged { enabled: false });
    }

    /// Flip detecting mode; returns the new state
    pub async fn toggle(&mut self) -> bool {
        if self.is_detecting() {
            self.stop().await;
        } else {
            self.start();
        }
        self.is_detecting()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::video::{FrameSlot, VideoFrame};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBackend(AtomicUsize);

    #[async_trait]
    impl DetectionBackend for CountingBackend {
        async fn detect(&self, _frame: &CaptureFrame) -> Result<DetectionSet> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(DetectionSet::empty(DetectionOrigin::Response))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_capture_timer() {
        let slot = FrameSlot::new();
        slot.publish(VideoFrame::rgb(vec![10u8; 8 * 8 * 3], 8, 8, 0).unwrap());

        let events = Arc::new(EventBus::new());
        let mut event_rx = events.subscribe();
        let backend = Arc::new(CountingBackend(AtomicUsize::new(0)));
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        let mut controller = DetectionController::new(
            PreferredSource::new().with_remote(Arc::new(slot)),
            backend.clone(),
            DetectionStore::new(events.clone()),
            state_rx,
            CaptureConfig {
                target_width: 8,
                target_height: 8,
                ..Default::default()
            },
            events,
            CancellationToken::new(),
        );

        assert!(controller.toggle().await);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!controller.toggle().await);

        let submitted = backend.0.load(Ordering::SeqCst);
        assert!(submitted >= 4);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(backend.0.load(Ordering::SeqCst), submitted);

        let mut modes = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            if let SystemEvent::DetectionModeChanged { enabled } = event {
                modes.push(enabled);
            }
        }
        assert_eq!(modes, [true, false]);
    }

    /// Takes a second per frame and tracks overlapping calls
    #[derive(Default)]
    struct SlowBackend {
        seen: parking_lot::Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl DetectionBackend for SlowBackend {
        async fn detect(&self, frame: &CaptureFrame) -> Result<DetectionSet> {
            self.seen.lock().push(frame.frame_id.clone());
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(DetectionSet {
                frame_id: Some(frame.frame_id.clone()),
                ..DetectionSet::empty(DetectionOrigin::Response)
            })
        }
    }

    fn slow_controller(backend: Arc<SlowBackend>) -> DetectionController {
        let slot = FrameSlot::new();
        slot.publish(VideoFrame::rgb(vec![10u8; 8 * 8 * 3], 8, 8, 0).unwrap());
        let events = Arc::new(EventBus::new());
        let (_, state_rx) = watch::channel(ConnectionState::Connected);

        DetectionController::new(
            PreferredSource::new().with_remote(Arc::new(slot)),
            backend,
            DetectionStore::new(events.clone()),
            state_rx,
            CaptureConfig {
                target_width: 8,
                target_height: 8,
                ..Default::default()
            },
            events,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_single_submission_in_flight() {
        let backend = Arc::new(SlowBackend::default());
        let mut controller = slow_controller(backend.clone());

        controller.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.stop().await;
        controller.start();
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        controller.stop().await;

        assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);
        let seen = backend.seen.lock().clone();
        assert!(seen.len() >= 2);

        // First result arrived after its loop stopped and was dropped
        let shown = controller.store().current();
        assert!(shown.frame_id.is_some());
        assert_ne!(shown.frame_id.as_deref(), Some(seen[0].as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_after_stop_is_discarded() {
        let backend = Arc::new(SlowBackend::default());
        let mut controller = slow_controller(backend.clone());

        controller.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.stop().await;
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        assert_eq!(backend.seen.lock().len(), 1);
        assert_eq!(backend.active.load(Ordering::SeqCst), 0);
        assert!(controller.store().current().frame_id.is_none());
    }
}
