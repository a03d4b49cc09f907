//! Camera → H.264 → WebRTC sample track

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::encoder::H264Encoder;
use super::frame::VideoFrame;
use super::source::FrameSlot;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Keyframe interval so late joiners and lossy links recover
const KEYFRAME_INTERVAL: u64 = 60;

/// Publishes the newest camera frame on a sample track
///
/// Encoding runs on its own thread; frames that arrive while a frame is
/// being encoded are skipped, never queued.
pub struct VideoPublisher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl VideoPublisher {
    /// Must be called from within a tokio runtime
    pub fn start(
        frames: &FrameSlot,
        track: Arc<TrackLocalStaticSample>,
        fps: u32,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let runtime = Handle::current();
        let rx = frames.subscribe();
        let thread_cancel = cancel.clone();
        let frame_duration = Duration::from_millis(1000 / u64::from(fps.max(1)));

        let handle = std::thread::Builder::new()
            .name("h264-publisher".to_string())
            .spawn(move || publish_loop(runtime, rx, track, frame_duration, thread_cancel))
            .map_err(|e| AppError::VideoError(format!("Failed to spawn publisher: {}", e)))?;

        info!("Video publisher started");
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Video publisher thread panicked");
            }
            info!("Video publisher stopped");
        }
    }
}

impl Drop for VideoPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish_loop(
    runtime: Handle,
    mut rx: watch::Receiver<Option<VideoFrame>>,
    track: Arc<TrackLocalStaticSample>,
    frame_duration: Duration,
    cancel: CancellationToken,
) {
    let mut encoder: Option<H264Encoder> = None;
    let mut last_write: Option<Instant> = None;
    let throttler = LogThrottler::with_secs(5);

    loop {
        let frame = runtime.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => None,
                changed = rx.changed() => match changed {
                    Ok(()) => Some(rx.borrow_and_update().clone()),
                    Err(_) => None,
                },
            }
        });
        let frame = match frame {
            None => break,
            Some(None) => continue,
            Some(Some(frame)) => frame,
        };

        let needs_encoder = encoder
            .as_ref()
            .map_or(true, |e| e.dimensions() != (frame.width, frame.height));
        if needs_encoder {
            match H264Encoder::new(frame.width, frame.height) {
                Ok(e) => {
                    debug!("H.264 encoder ready for {}x{}", frame.width, frame.height);
                    encoder = Some(e);
                }
                Err(e) => {
                    crate::warn_throttled!(throttler, "encoder_init", "Cannot encode camera frames: {}", e);
                    continue;
                }
            }
        }
        let Some(enc) = encoder.as_mut() else {
            continue;
        };

        if enc.frame_count() > 0 && enc.frame_count() % KEYFRAME_INTERVAL == 0 {
            enc.force_keyframe();
        }

        let encoded = match enc.encode(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                crate::warn_throttled!(throttler, "encode", "H.264 encode failed: {}", e);
                continue;
            }
        };

        let now = Instant::now();
        let duration = last_write
            .map(|t| now.duration_since(t))
            .filter(|d| !d.is_zero())
            .unwrap_or(frame_duration);
        last_write = Some(now);

        let sample = Sample {
            data: encoded.data,
            duration,
            ..Default::default()
        };
        if let Err(e) = runtime.block_on(track.write_sample(&sample)) {
            crate::warn_throttled!(throttler, "write", "Failed to write video sample: {}", e);
        }
    }

    if encoder.is_none() {
        warn!("Video publisher exited before any frame was encoded");
    }
}
