//! Remote H.264 track → decoded frames

use bytes::{Bytes, BytesMut};
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_remote::TrackRemote;

use super::frame::VideoFrame;
use super::source::FrameSlot;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Upper bound on a reassembled access unit; anything larger is corrupt
const MAX_ACCESS_UNIT: usize = 4 * 1024 * 1024;

/// Reassembles RTP payloads into Annex B access units
///
/// An access unit ends at the packet carrying the RTP marker bit.
#[derive(Default)]
pub struct AccessUnitAssembler {
    depacketizer: H264Packet,
    buffer: BytesMut,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP payload; returns a complete access unit on the marker
    pub fn push(&mut self, payload: &Bytes, marker: bool) -> Result<Option<Bytes>> {
        let nalus = self
            .depacketizer
            .depacketize(payload)
            .map_err(|e| AppError::VideoError(format!("H.264 depacketize failed: {}", e)))?;
        self.buffer.extend_from_slice(&nalus);

        if self.buffer.len() > MAX_ACCESS_UNIT {
            self.buffer.clear();
            return Err(AppError::VideoError("Access unit too large".to_string()));
        }

        if marker && !self.buffer.is_empty() {
            Ok(Some(self.buffer.split().freeze()))
        } else {
            Ok(None)
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Decode H.264 access units to RGB24 frames
pub struct H264Decoder {
    decoder: Decoder,
    sequence: u64,
}

impl H264Decoder {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new()
            .map_err(|e| AppError::VideoError(format!("Failed to create H.264 decoder: {}", e)))?;
        Ok(Self {
            decoder,
            sequence: 0,
        })
    }

    /// `None` while the decoder is still waiting for a keyframe
    pub fn decode(&mut self, access_unit: &[u8]) -> Result<Option<VideoFrame>> {
        let decoded = self
            .decoder
            .decode(access_unit)
            .map_err(|e| AppError::VideoError(format!("H.264 decode failed: {}", e)))?;

        let Some(yuv) = decoded else {
            return Ok(None);
        };

        let (width, height) = yuv.dimensions();
        let mut rgb = vec![0u8; width * height * 3];
        yuv.write_rgb8(&mut rgb);

        let frame = VideoFrame::rgb(rgb, width as u32, height as u32, self.sequence)?;
        self.sequence += 1;
        Ok(Some(frame))
    }
}

/// Read RTP from the remote track until it ends or `cancel` fires, keeping
/// the newest decoded frame in `slot`
///
/// Runs the decoder on a blocking thread per access unit so the RTP reader
/// never stalls the runtime.
pub async fn run_remote_decoder(
    track: Arc<TrackRemote>,
    slot: FrameSlot,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Decoding remote {} track", track.kind());

    let mut assembler = AccessUnitAssembler::new();
    let decoder = Arc::new(parking_lot::Mutex::new(H264Decoder::new()?));
    let throttler = LogThrottler::with_secs(5);

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read_rtp() => match read {
                Ok((packet, _)) => packet,
                Err(e) => {
                    info!("Remote track ended: {}", e);
                    break;
                }
            },
        };

        let access_unit = match assembler.push(&packet.payload, packet.header.marker) {
            Ok(Some(au)) => au,
            Ok(None) => continue,
            Err(e) => {
                crate::warn_throttled!(throttler, "depacketize", "{}", e);
                continue;
            }
        };

        let decoder = decoder.clone();
        let decoded = tokio::task::spawn_blocking(move || decoder.lock().decode(&access_unit))
            .await
            .map_err(|e| AppError::Internal(format!("Decoder task failed: {}", e)))?;

        match decoded {
            Ok(Some(frame)) => slot.publish(frame),
            Ok(None) => debug!("Decoder waiting for keyframe"),
            Err(e) => crate::warn_throttled!(throttler, "decode", "{}", e),
        }
    }

    slot.clear();
    Ok(())
}
