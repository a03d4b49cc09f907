//! Frame encoders
//!
//! - detection JPEG: RGB24 ──resize──> target size ──turbojpeg──> JPEG
//! - H.264: RGB24 ──BT.601──> I420 ──openh264──> Annex B access unit

use bytes::Bytes;
use image::imageops::FilterType;
use image::RgbImage;
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;
use turbojpeg::{Image, PixelFormat as TJPixelFormat, Subsamp};

use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// Downsample a frame and JPEG-encode it for the detector
///
/// The frame is stretched to exactly `width`x`height`; the detector works
/// on normalized coordinates so aspect ratio is not preserved.
pub fn encode_detection_jpeg(
    frame: &VideoFrame,
    width: u32,
    height: u32,
    quality: i32,
) -> Result<Bytes> {
    if width == 0 || height == 0 {
        return Err(AppError::VideoError(format!(
            "Invalid detection size {}x{}",
            width, height
        )));
    }

    let source = RgbImage::from_raw(frame.width, frame.height, frame.data().to_vec())
        .ok_or_else(|| AppError::VideoError("Frame buffer does not match its size".to_string()))?;

    let resized = if (frame.width, frame.height) == (width, height) {
        source
    } else {
        image::imageops::resize(&source, width, height, FilterType::Triangle)
    };

    let jpeg = turbojpeg::compress(
        Image {
            pixels: resized.as_raw().as_slice(),
            width: width as usize,
            pitch: width as usize * 3,
            height: height as usize,
            format: TJPixelFormat::RGB,
        },
        quality.clamp(1, 100),
        Subsamp::Sub2x2,
    )
    .map_err(|e| AppError::VideoError(format!("JPEG encode failed: {}", e)))?;

    Ok(Bytes::copy_from_slice(&jpeg))
}

/// One encoded H.264 access unit
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Annex B NAL units
    pub data: Bytes,
    pub is_keyframe: bool,
}

/// Software H.264 encoder for the published camera track
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl H264Encoder {
    /// Dimensions must be even; I420 chroma is subsampled 2x2
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(AppError::VideoError(format!(
                "H.264 needs even dimensions, got {}x{}",
                width, height
            )));
        }
        let encoder = Encoder::new()
            .map_err(|e| AppError::VideoError(format!("Failed to create H.264 encoder: {}", e)))?;
        Ok(Self {
            encoder,
            width,
            height,
            frame_count: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedFrame> {
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(AppError::VideoError(format!(
                "Frame {}x{} does not match encoder {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let yuv = rgb_to_i420(frame.data(), self.width as usize, self.height as usize);
        let buffer = YUVBuffer::from_vec(yuv, self.width as usize, self.height as usize);

        let bitstream = self
            .encoder
            .encode(&buffer)
            .map_err(|e| AppError::VideoError(format!("H.264 encode failed: {}", e)))?;
        self.frame_count += 1;

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        Ok(EncodedFrame {
            data: Bytes::from(bitstream.to_vec()),
            is_keyframe,
        })
    }

    pub fn force_keyframe(&mut self) {
        self.encoder.force_intra_frame();
    }
}

/// RGB24 to planar I420, BT.601 limited range
fn rgb_to_i420(rgb: &[u8], w: usize, h: usize) -> Vec<u8> {
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 3;
            let r = rgb[idx] as i32;
            let g = rgb[idx + 1] as i32;
            let b = rgb[idx + 2] as i32;

            y_plane[y * w + x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;

            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                u_plane[uv_idx] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
                v_plane[uv_idx] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            }
        }
    }

    yuv
}
