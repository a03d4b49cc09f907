//! Local V4L2 camera
//!
//! Captures MJPEG from the device in a dedicated thread, decodes to RGB24
//! with turbojpeg and keeps only the newest frame in a [`FrameSlot`].

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use turbojpeg::{Decompressor, Image, PixelFormat as TJPixelFormat};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

use super::frame::VideoFrame;
use super::source::{FrameSlot, VideoSource};
use crate::config::CameraConfig;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Number of mmap buffers
const BUFFER_COUNT: u32 = 4;

/// Minimum valid MJPEG frame size; smaller buffers are partial frames
const MIN_FRAME_SIZE: usize = 128;

/// Dequeue timeout so the stop flag is honored on a stalled device
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Exclusive handle on a local camera
///
/// The device is released when the camera is stopped or dropped; the
/// capture thread is joined before either returns.
pub struct LocalCamera {
    device: PathBuf,
    width: u32,
    height: u32,
    slot: FrameSlot,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LocalCamera {
    /// Open the configured device and start capturing
    ///
    /// Fails with [`AppError::MediaAcquisition`] when no device is configured
    /// or it cannot be opened, configured or streamed.
    pub async fn acquire(config: &CameraConfig) -> Result<Self> {
        let device = config.device.clone().ok_or_else(|| AppError::MediaAcquisition {
            device: "<none>".to_string(),
            reason: "no camera device configured".to_string(),
        })?;
        let device = PathBuf::from(device);

        let slot = FrameSlot::new();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_device = device.clone();
        let thread_config = config.clone();
        let thread_slot = slot.clone();
        let thread_stop = stop_flag.clone();
        let handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                capture_thread(thread_device, thread_config, thread_slot, thread_stop, ready_tx)
            })
            .map_err(|e| AppError::MediaAcquisition {
                device: device.display().to_string(),
                reason: format!("failed to spawn capture thread: {}", e),
            })?;

        let opened = ready_rx.await.unwrap_or_else(|_| {
            Err(AppError::MediaAcquisition {
                device: device.display().to_string(),
                reason: "capture thread exited during startup".to_string(),
            })
        });

        let (width, height) = match opened {
            Ok(size) => size,
            Err(e) => {
                let _ = handle.join();
                return Err(e);
            }
        };

        info!(
            "Camera {} streaming MJPEG {}x{}",
            device.display(),
            width,
            height
        );

        Ok(Self {
            device,
            width,
            height,
            slot,
            stop_flag,
            handle: Some(handle),
        })
    }

    pub fn device(&self) -> &std::path::Path {
        &self.device
    }

    /// Negotiated capture size
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames(&self) -> FrameSlot {
        self.slot.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.stop_flag.load(Ordering::Relaxed)
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Camera capture thread panicked");
            }
            self.slot.clear();
            info!("Camera {} released", self.device.display());
        }
    }
}

impl VideoSource for LocalCamera {
    fn is_ready(&self) -> bool {
        self.is_running() && self.slot.is_ready()
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        self.slot.latest_frame()
    }
}

impl Drop for LocalCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_error(device: &std::path::Path, reason: impl std::fmt::Display) -> AppError {
    AppError::MediaAcquisition {
        device: device.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Whether a dequeue error means the device is gone
fn is_device_lost(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(5)        // EIO
            | Some(6)  // ENXIO
            | Some(19) // ENODEV
            | Some(32) // EPIPE
            | Some(108) // ESHUTDOWN
    )
}

fn capture_thread(
    path: PathBuf,
    config: CameraConfig,
    slot: FrameSlot,
    stop_flag: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(u32, u32)>>,
) {
    let device = match Device::with_path(&path) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(acquisition_error(&path, e)));
            return;
        }
    };

    let format = match configure(&device, &config) {
        Ok(format) => format,
        Err(e) => {
            let _ = ready.send(Err(acquisition_error(&path, e)));
            return;
        }
    };
    if format.fourcc != FourCC::new(b"MJPG") {
        let _ = ready.send(Err(acquisition_error(
            &path,
            format!("device does not support MJPEG (got {})", format.fourcc),
        )));
        return;
    }

    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(acquisition_error(&path, e)));
            return;
        }
    };
    stream.set_timeout(CAPTURE_TIMEOUT);

    let mut decompressor = match Decompressor::new() {
        Ok(d) => d,
        Err(e) => {
            let _ = ready.send(Err(acquisition_error(
                &path,
                format!("turbojpeg init failed: {}", e),
            )));
            return;
        }
    };

    if ready.send(Ok((format.width, format.height))).is_err() {
        return;
    }

    let throttler = LogThrottler::with_secs(5);
    let mut sequence = 0u64;

    while !stop_flag.load(Ordering::Relaxed) {
        let (buf, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                crate::warn_throttled!(throttler, "timeout", "Camera capture timeout - no signal?");
                continue;
            }
            Err(e) if is_device_lost(&e) => {
                error!("Camera {} lost: {}", path.display(), e);
                break;
            }
            Err(e) => {
                crate::warn_throttled!(throttler, "dequeue", "Camera capture error: {}", e);
                continue;
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        if used < MIN_FRAME_SIZE {
            debug!("Dropping short frame: {} bytes", used);
            continue;
        }

        match decode_mjpeg(&mut decompressor, &buf[..used], sequence) {
            Ok(frame) => {
                sequence += 1;
                slot.publish(frame);
            }
            Err(e) => {
                crate::warn_throttled!(throttler, "decode", "Dropping undecodable frame: {}", e)
            }
        }
    }

    slot.clear();
    debug!("Camera capture thread exiting");
}

fn configure(device: &Device, config: &CameraConfig) -> io::Result<v4l::Format> {
    let mut format = device.format()?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = FourCC::new(b"MJPG");
    let format = device.set_format(&format)?;

    if format.width != config.width || format.height != config.height {
        warn!(
            "Camera adjusted resolution {}x{} -> {}x{}",
            config.width, config.height, format.width, format.height
        );
    }

    if config.fps > 0 {
        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Failed to set camera frame rate {}: {}", config.fps, e);
        }
    }

    Ok(format)
}

/// Decode one MJPEG frame to RGB24
pub fn decode_mjpeg(
    decompressor: &mut Decompressor,
    jpeg: &[u8],
    sequence: u64,
) -> Result<VideoFrame> {
    let header = decompressor
        .read_header(jpeg)
        .map_err(|e| AppError::VideoError(format!("turbojpeg read_header failed: {}", e)))?;

    let pitch = header.width * 3;
    let mut image = Image {
        pixels: vec![0u8; header.height * pitch],
        width: header.width,
        pitch,
        height: header.height,
        format: TJPixelFormat::RGB,
    };

    decompressor
        .decompress(jpeg, image.as_deref_mut())
        .map_err(|e| AppError::VideoError(format!("turbojpeg decode failed: {}", e)))?;

    VideoFrame::rgb(
        image.pixels,
        header.width as u32,
        header.height as u32,
        sequence,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_device_is_acquisition_error() {
        let config = CameraConfig {
            device: Some("/dev/vision-link-does-not-exist".to_string()),
            ..Default::default()
        };
        let err = LocalCamera::acquire(&config).await.err().unwrap();
        assert!(matches!(err, AppError::MediaAcquisition { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unconfigured_device_is_acquisition_error() {
        let err = LocalCamera::acquire(&CameraConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::MediaAcquisition { .. }));
    }

    #[test]
    fn test_decode_mjpeg() {
        let rgb = vec![200u8; 16 * 8 * 3];
        let jpeg = turbojpeg::compress(
            Image {
                pixels: rgb.as_slice(),
                width: 16,
                pitch: 16 * 3,
                height: 8,
                format: TJPixelFormat::RGB,
            },
            90,
            turbojpeg::Subsamp::Sub2x2,
        )
        .unwrap();

        let mut decompressor = Decompressor::new().unwrap();
        let frame = decode_mjpeg(&mut decompressor, &jpeg, 7).unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.len(), 16 * 8 * 3);

        assert!(decode_mjpeg(&mut decompressor, b"not a jpeg", 0).is_err());
    }
}
