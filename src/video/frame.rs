//! Video frame data structures

use bytes::Bytes;
use std::time::Instant;

use crate::error::{AppError, Result};

/// A decoded RGB24 video frame
///
/// Cloning is cheap: pixel data is reference counted.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Monotonic per-source sequence number
    pub sequence: u64,
    /// When the frame was produced
    pub captured_at: Instant,
}

impl VideoFrame {
    /// Wrap RGB24 pixels, checking the buffer matches the dimensions
    pub fn rgb(data: impl Into<Bytes>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let data = data.into();
        let expected = width as usize * height as usize * 3;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(AppError::VideoError(format!(
                "RGB frame size mismatch: {} bytes for {}x{} (expected {})",
                data.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_size_checked() {
        assert!(VideoFrame::rgb(vec![0u8; 4 * 2 * 3], 4, 2, 0).is_ok());
        assert!(VideoFrame::rgb(vec![0u8; 10], 4, 2, 0).is_err());
        assert!(VideoFrame::rgb(Vec::<u8>::new(), 0, 0, 0).is_err());
    }
}
