//! One viewer or camera session
//!
//! ```text
//! camera:  LocalCamera ─> VideoPublisher ─> RtcTransport ══> peer
//! viewer:  peer ══> RtcTransport ─> remote decoder ─> FrameSlot ─┐
//!                                      local camera (fallback) ──┴> FrameCaptureLoop
//!          DetectionStore <─ HTTP / push ─┘            OverlayRenderer <─┘
//! ```
//!
//! Everything the session spawns hangs off one cancellation token, so
//! [`SessionHandle::shutdown`] tears the whole graph down in one place.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::config::AppConfig;
use crate::detection::{DetectionController, DetectionStore, HttpDetector};
use crate::error::{AppError, Result};
use crate::events::EventBus;
use crate::join::JoinImagePoller;
use crate::metrics::{LatencyTracker, MetricsSummary};
use crate::overlay::{DisplayList, OverlayRenderer, VideoGeometry};
use crate::role::Role;
use crate::utils::unix_millis;
use crate::video::{run_remote_decoder, FrameSlot, LocalCamera, PreferredSource, VideoPublisher};
use crate::webrtc::{
    ConnectionState, ConnectionStateMonitor, NegotiationState, PeerConnectionManager,
    RtcTransport, SignalingChannel,
};

/// Viewer-only parts of a running session
struct ViewerSession {
    detection: DetectionController,
    geometry_tx: watch::Sender<VideoGeometry>,
    overlay: JoinHandle<OverlayRenderer<DisplayList>>,
    remote_video: JoinHandle<()>,
    join: Option<JoinHandle<()>>,
}

/// A running session
pub struct SessionHandle {
    role: Role,
    cancel: CancellationToken,
    monitor: ConnectionStateMonitor,
    negotiation_state: watch::Receiver<NegotiationState>,
    negotiation: Option<JoinHandle<NegotiationState>>,
    signaling: SignalingChannel,
    camera: Option<LocalCamera>,
    publisher: Option<VideoPublisher>,
    viewer: Option<ViewerSession>,
    latency: Arc<LatencyTracker>,
}

/// Start a session for `role`
///
/// The camera is acquired first: the camera role always needs it, the
/// viewer only when a device is configured. Acquisition failure aborts the
/// start with [`AppError::MediaAcquisition`]. Negotiation begins once the
/// signaling channel opens.
pub async fn start(
    role: Role,
    config: &AppConfig,
    events: Arc<EventBus>,
    cancel: CancellationToken,
) -> Result<SessionHandle> {
    info!("Starting {} session", role);

    let camera = match role {
        Role::Camera => Some(LocalCamera::acquire(&config.camera).await?),
        Role::Viewer if config.camera.device.is_some() && config.capture.allow_local_fallback => {
            Some(LocalCamera::acquire(&config.camera).await?)
        }
        Role::Viewer => None,
    };

    let signaling_url = config.server.signaling_url()?;
    let (transport, transport_events) = RtcTransport::new(role, &config.webrtc).await?;
    let transport = Arc::new(transport);

    let publisher = match (&camera, role) {
        (Some(camera), Role::Camera) => {
            let track = transport.video_track().ok_or_else(|| {
                AppError::Internal("Camera transport has no video track".to_string())
            })?;
            Some(VideoPublisher::start(
                &camera.frames(),
                track,
                config.camera.fps,
                cancel.child_token(),
            )?)
        }
        _ => None,
    };

    let mut signaling = SignalingChannel::connect(signaling_url);
    let inbound = signaling
        .take_receiver()
        .ok_or_else(|| AppError::Internal("Signaling receiver already taken".to_string()))?;

    let monitor = ConnectionStateMonitor::new(events.clone());
    let manager = PeerConnectionManager::new(
        role,
        transport.clone(),
        signaling.sender(),
        monitor.clone(),
        events.clone(),
    );
    let negotiation_state = manager.state_watch();
    let remote_stream = manager.remote_stream();

    let negotiation = tokio::spawn(manager.run(
        inbound,
        transport_events,
        signaling.opened(),
        cancel.child_token(),
    ));

    let latency = Arc::new(LatencyTracker::new(unix_millis()));

    let viewer = match role {
        Role::Viewer => Some(start_viewer(
            config,
            camera.as_ref(),
            remote_stream,
            &monitor,
            &events,
            &latency,
            &cancel,
        )?),
        Role::Camera => None,
    };

    Ok(SessionHandle {
        role,
        cancel,
        monitor,
        negotiation_state,
        negotiation: Some(negotiation),
        signaling,
        camera,
        publisher,
        viewer,
        latency,
    })
}

fn start_viewer(
    config: &AppConfig,
    camera: Option<&LocalCamera>,
    remote_stream: watch::Receiver<Option<Arc<TrackRemote>>>,
    monitor: &ConnectionStateMonitor,
    events: &Arc<EventBus>,
    latency: &Arc<LatencyTracker>,
    cancel: &CancellationToken,
) -> Result<ViewerSession> {
    let remote_frames = FrameSlot::new();
    let remote_video = tokio::spawn(follow_remote_stream(
        remote_stream,
        remote_frames.clone(),
        cancel.child_token(),
    ));

    let mut source = PreferredSource::new().with_remote(Arc::new(remote_frames));
    if let Some(camera) = camera {
        source = source.with_local(Arc::new(camera.frames()));
    }

    let store = DetectionStore::new(events.clone());
    let backend = Arc::new(HttpDetector::new(&config.server, &config.detection)?);
    let mut detection = DetectionController::new(
        source,
        backend,
        store.clone(),
        monitor.subscribe(),
        config.capture.clone(),
        events.clone(),
        cancel.child_token(),
    );
    if config.detection.enable_push {
        detection = detection.with_push_url(config.server.push_url()?);
    }
    if config.detection.enabled {
        detection.start();
    }

    let (geometry_tx, geometry_rx) = watch::channel(VideoGeometry::new(
        config.overlay.width,
        config.overlay.height,
    ));
    let renderer = OverlayRenderer::new(
        DisplayList::new(config.overlay.width, config.overlay.height),
        &config.overlay,
    );
    let overlay = tokio::spawn(renderer.run(
        store.subscribe(),
        geometry_rx,
        events.clone(),
        Some(latency.clone()),
        cancel.child_token(),
    ));

    let join = if config.join.enabled {
        let poller = JoinImagePoller::new(
            config.server.qr_url()?,
            Duration::from_secs(config.join.refresh_secs),
            events.clone(),
        );
        Some(tokio::spawn(poller.run(cancel.child_token())))
    } else {
        None
    };

    Ok(ViewerSession {
        detection,
        geometry_tx,
        overlay,
        remote_video,
        join,
    })
}

/// Decode whichever remote track is currently exposed
///
/// A new track replaces the decoder; losing the track clears the frames.
async fn follow_remote_stream(
    mut remote_stream: watch::Receiver<Option<Arc<TrackRemote>>>,
    frames: FrameSlot,
    cancel: CancellationToken,
) {
    let mut decoder: Option<(CancellationToken, JoinHandle<()>)> = None;

    loop {
        let track = remote_stream.borrow_and_update().clone();
        if let Some((token, handle)) = decoder.take() {
            token.cancel();
            let _ = handle.await;
        }
        if let Some(track) = track {
            let token = cancel.child_token();
            let slot = frames.clone();
            let task_token = token.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = run_remote_decoder(track, slot, task_token).await {
                    warn!("Remote video decoder stopped: {}", e);
                }
            });
            decoder = Some((token, handle));
        } else {
            frames.clear();
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = remote_stream.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some((token, handle)) = decoder.take() {
        token.cancel();
        let _ = handle.await;
    }
    frames.clear();
    debug!("Remote video follower exiting");
}

impl SessionHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.current()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation_state.borrow()
    }

    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.monitor.subscribe()
    }

    /// Report a new displayed video size (viewer only)
    pub fn resize_video(&self, width: u32, height: u32) {
        if let Some(viewer) = &self.viewer {
            viewer
                .geometry_tx
                .send_replace(VideoGeometry::new(width, height));
        }
    }

    /// Switch detecting mode (viewer only); returns whether it is on
    pub async fn set_detecting(&mut self, enabled: bool) -> bool {
        let Some(viewer) = self.viewer.as_mut() else {
            return false;
        };
        if enabled {
            viewer.detection.start();
        } else {
            viewer.detection.stop().await;
        }
        viewer.detection.is_detecting()
    }

    /// Wait for negotiation to end (connection failed or closed, or
    /// signaling lost before connecting)
    pub async fn finished(&mut self) -> NegotiationState {
        match self.negotiation.as_mut() {
            Some(handle) => {
                let result = handle.await;
                self.negotiation = None;
                result.unwrap_or_else(|e| {
                    warn!("Negotiation task failed: {}", e);
                    NegotiationState::Failed
                })
            }
            None => self.negotiation_state(),
        }
    }

    /// Stop every task, close the peer connection and signaling channel,
    /// release the camera
    pub async fn shutdown(mut self) -> MetricsSummary {
        info!("Stopping {} session", self.role);

        if let Some(viewer) = self.viewer.as_mut() {
            viewer.detection.stop().await;
        }
        self.cancel.cancel();

        if let Some(handle) = self.negotiation.take() {
            match handle.await {
                Ok(state) => debug!("Negotiation ended in {}", state),
                Err(e) => warn!("Negotiation task failed: {}", e),
            }
        }

        if let Some(viewer) = self.viewer.take() {
            match viewer.overlay.await {
                Ok(renderer) => debug!("Overlay stopped at {} fps", renderer.fps()),
                Err(e) => warn!("Overlay task failed: {}", e),
            }
            let _ = viewer.remote_video.await;
            if let Some(join) = viewer.join {
                let _ = join.await;
            }
        }

        if let Some(mut publisher) = self.publisher.take() {
            publisher.stop();
        }
        if let Some(mut camera) = self.camera.take() {
            camera.stop();
        }
        self.signaling.close();

        let summary = self.latency.summary();
        info!(
            "Session metrics: {} frames, median e2e {:?} ms, p95 e2e {:?} ms, {:.1} fps",
            summary.count_frames, summary.median_e2e_ms, summary.p95_e2e_ms, summary.processed_fps
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, JoinConfig, ServerConfig};

    fn offline_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                ..Default::default()
            },
            join: JoinConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_camera_without_device_fails_to_start() {
        let config = AppConfig {
            camera: CameraConfig {
                device: Some("/dev/vision-link-missing".to_string()),
                ..Default::default()
            },
            ..offline_config()
        };
        let err = start(
            Role::Camera,
            &config,
            Arc::new(EventBus::new()),
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AppError::MediaAcquisition { .. }));
    }

    #[tokio::test]
    async fn test_viewer_abandons_when_relay_unreachable() {
        let mut session = start(
            Role::Viewer,
            &offline_config(),
            Arc::new(EventBus::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let state = tokio::time::timeout(Duration::from_secs(10), session.finished())
            .await
            .unwrap();
        assert_eq!(state, NegotiationState::Idle);
        assert_eq!(session.connection_state(), ConnectionState::New);
        assert_eq!(*session.connection_watch().borrow(), ConnectionState::New);
        session.resize_video(1280, 720);

        assert!(session.set_detecting(true).await);
        assert!(!session.set_detecting(false).await);

        let summary = session.shutdown().await;
        assert_eq!(summary.count_frames, 0);
    }
}
