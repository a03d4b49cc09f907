//! Detection overlay renderer
//!
//! Redraws the whole surface on every new detection set and every change of
//! the displayed video size. Boxes are normalized coordinates times the
//! current displayed width/height, so the overlay tracks the video however
//! it is scaled.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::canvas::{Canvas, Color, Rect};
use crate::config::OverlayConfig;
use crate::detection::{Detection, DetectionOrigin, DetectionSet};
use crate::events::{EventBus, SystemEvent};
use crate::metrics::{FpsMeter, FrameTiming, LatencyTracker};
use crate::utils::unix_millis;

const BOX_LINE_WIDTH: f32 = 2.0;
const BADGE_HEIGHT: f32 = 20.0;
const BADGE_PADDING: f32 = 5.0;

/// Displayed size of the video element, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
}

impl VideoGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Label badge text, e.g. `person: 0.87`
pub fn badge_text(detection: &Detection) -> String {
    format!("{}: {:.2}", detection.label, detection.score)
}

pub struct OverlayRenderer<C: Canvas> {
    canvas: C,
    score_threshold: Option<f32>,
    font_px: f32,
    fps: FpsMeter,
}

impl<C: Canvas> OverlayRenderer<C> {
    pub fn new(canvas: C, config: &OverlayConfig) -> Self {
        Self {
            canvas,
            score_threshold: config.score_threshold,
            font_px: config.font_px as f32,
            fps: FpsMeter::new(),
        }
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }

    pub fn fps(&self) -> u32 {
        self.fps.current_fps()
    }

    /// Clear and draw `set` at `geometry`; returns the number of boxes drawn
    pub fn render(&mut self, set: &DetectionSet, geometry: VideoGeometry) -> usize {
        if self.canvas.size() != (geometry.width, geometry.height) {
            self.canvas.resize(geometry.width, geometry.height);
        }
        self.canvas.clear();
        if geometry.is_empty() {
            return 0;
        }

        let width = geometry.width as f32;
        let height = geometry.height as f32;
        let mut drawn = 0;

        for detection in &set.detections {
            if self
                .score_threshold
                .is_some_and(|threshold| detection.score < threshold)
            {
                continue;
            }
            self.draw_detection(detection, width, height);
            drawn += 1;
        }

        self.fps.record_frame();
        drawn
    }

    fn draw_detection(&mut self, detection: &Detection, width: f32, height: f32) {
        let x1 = detection.xmin * width;
        let y1 = detection.ymin * height;
        let rect = Rect {
            x: x1,
            y: y1,
            width: (detection.width() * width).max(1.0),
            height: (detection.height() * height).max(1.0),
        };
        self.canvas.stroke_rect(rect, Color::RED, BOX_LINE_WIDTH);

        let text = badge_text(detection);
        let badge_width = self.canvas.measure_text(&text, self.font_px) + BADGE_PADDING * 2.0;
        let badge_x = x1.min(width - badge_width).max(0.0);
        let badge_y = (y1 - BADGE_HEIGHT).min(height - BADGE_HEIGHT).max(0.0);

        self.canvas.fill_rect(
            Rect {
                x: badge_x,
                y: badge_y,
                width: badge_width,
                height: BADGE_HEIGHT,
            },
            Color::RED,
        );
        self.canvas.fill_text(
            &text,
            badge_x + BADGE_PADDING,
            badge_y + BADGE_HEIGHT - BADGE_PADDING,
            self.font_px,
            Color::WHITE,
        );
    }

    /// Redraw whenever the detection set or the geometry changes
    ///
    /// Returns the renderer when cancelled or when both inputs are gone.
    pub async fn run(
        mut self,
        mut detections: watch::Receiver<Arc<DetectionSet>>,
        mut geometry: watch::Receiver<VideoGeometry>,
        events: Arc<EventBus>,
        latency: Option<Arc<LatencyTracker>>,
        cancel: CancellationToken,
    ) -> Self {
        let mut set = detections.borrow_and_update().clone();
        let mut size = *geometry.borrow_and_update();
        self.redraw(&set, size, &events);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = detections.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    set = detections.borrow_and_update().clone();
                    self.redraw(&set, size, &events);

                    if let (Some(tracker), DetectionOrigin::Response) = (latency.as_ref(), set.origin) {
                        if let Some(timing) = FrameTiming::from_set(&set, unix_millis()) {
                            tracker.record(timing);
                        }
                    }
                }
                changed = geometry.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    size = *geometry.borrow_and_update();
                    debug!("Overlay geometry {}x{}", size.width, size.height);
                    self.redraw(&set, size, &events);
                }
            }
        }

        self
    }

    fn redraw(&mut self, set: &DetectionSet, size: VideoGeometry, events: &EventBus) {
        let boxes = self.render(set, size);
        trace!("Overlay: {} boxes at {}x{}", boxes, size.width, size.height);
        events.publish(SystemEvent::OverlayUpdated {
            boxes,
            width: size.width,
            height: size.height,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionStore;
    use crate::overlay::canvas::DisplayList;
    use tokio::sync::broadcast;

    fn set(detections: Vec<Detection>) -> DetectionSet {
        DetectionSet {
            detections,
            ..DetectionSet::empty(DetectionOrigin::Response)
        }
    }

    fn det(label: &str, score: f32, xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Detection {
        Detection::normalized(label, score, xmin, ymin, xmax, ymax).unwrap()
    }

    fn renderer() -> OverlayRenderer<DisplayList> {
        OverlayRenderer::new(DisplayList::new(0, 0), &OverlayConfig::default())
    }

    #[test]
    fn test_update_replaces_previous_boxes() {
        let mut renderer = renderer();
        let geometry = VideoGeometry::new(640, 480);

        renderer.render(
            &set(vec![
                det("a", 0.9, 0.1, 0.1, 0.2, 0.2),
                det("b", 0.8, 0.5, 0.5, 0.6, 0.6),
            ]),
            geometry,
        );
        assert_eq!(renderer.canvas().boxes().len(), 2);

        renderer.render(&set(vec![det("c", 0.7, 0.3, 0.3, 0.4, 0.4)]), geometry);
        assert_eq!(renderer.canvas().labels(), ["c: 0.70"]);
        assert_eq!(renderer.canvas().boxes().len(), 1);

        renderer.render(&set(vec![]), geometry);
        assert!(renderer.canvas().ops().is_empty());
    }

    #[test]
    fn test_boxes_scale_linearly_with_width() {
        let detections = set(vec![
            det("a", 0.9, 0.25, 0.1, 0.5, 0.3),
            det("b", 0.6, 0.1, 0.5, 0.3, 0.9),
        ]);
        let mut renderer = renderer();

        renderer.render(&detections, VideoGeometry::new(320, 240));
        let narrow = renderer.canvas().boxes();
        renderer.render(&detections, VideoGeometry::new(640, 240));
        let wide = renderer.canvas().boxes();

        assert_eq!(narrow.len(), wide.len());
        for (n, w) in narrow.iter().zip(&wide) {
            assert_eq!(w.x, n.x * 2.0);
            assert_eq!(w.width, n.width * 2.0);
            assert_eq!(w.y, n.y);
            assert_eq!(w.height, n.height);
        }
    }

    #[test]
    fn test_badge_stays_on_surface() {
        let mut renderer = renderer();
        renderer.render(
            &set(vec![det("person", 0.5, 0.9, 0.0, 1.0, 0.1)]),
            VideoGeometry::new(200, 100),
        );

        let badge = renderer
            .canvas()
            .ops()
            .iter()
            .find_map(|op| match op {
                crate::overlay::canvas::DrawOp::FillRect { rect, .. } => Some(*rect),
                _ => None,
            })
            .unwrap();
        assert_eq!(badge.y, 0.0);
        assert!(badge.x >= 0.0);
        assert!(badge.x + badge.width <= 200.0 + 1e-3);
    }

    #[test]
    fn test_score_threshold() {
        let config = OverlayConfig {
            score_threshold: Some(0.5),
            ..Default::default()
        };
        let mut renderer = OverlayRenderer::new(DisplayList::new(0, 0), &config);
        let drawn = renderer.render(
            &set(vec![
                det("low", 0.2, 0.1, 0.1, 0.2, 0.2),
                det("high", 0.9, 0.1, 0.1, 0.2, 0.2),
            ]),
            VideoGeometry::new(100, 100),
        );
        assert_eq!(drawn, 1);
        assert_eq!(renderer.canvas().labels(), ["high: 0.90"]);
    }

    async fn next_overlay(rx: &mut broadcast::Receiver<SystemEvent>) -> (usize, u32) {
        loop {
            if let SystemEvent::OverlayUpdated { boxes, width, .. } = rx.recv().await.unwrap() {
                return (boxes, width);
            }
        }
    }

    #[tokio::test]
    async fn test_redraws_on_resize_and_update() {
        let events = Arc::new(EventBus::new());
        let mut event_rx = events.subscribe();
        let store = DetectionStore::new(events.clone());
        let (geometry_tx, geometry_rx) = watch::channel(VideoGeometry::new(100, 100));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(renderer().run(
            store.subscribe(),
            geometry_rx,
            events.clone(),
            None,
            cancel.clone(),
        ));

        assert_eq!(next_overlay(&mut event_rx).await, (0, 100));
        store.replace(set(vec![det("a", 0.9, 0.5, 0.5, 1.0, 1.0)]));
        assert_eq!(next_overlay(&mut event_rx).await, (1, 100));
        geometry_tx.send_replace(VideoGeometry::new(300, 100));
        assert_eq!(next_overlay(&mut event_rx).await, (1, 300));

        cancel.cancel();
        let renderer = task.await.unwrap();
        assert_eq!(renderer.canvas().boxes()[0].x, 150.0);
    }
}
