//! Video capture, encoding and decoding
//!
//! ```text
//! camera:  V4L2 MJPEG ──turbojpeg──> FrameSlot ──openh264──> sample track
//! viewer:  RTP H.264 ──depacketize──> openh264 ──> FrameSlot ──> detection
//! ```

pub mod capture;
pub mod encoder;
pub mod frame;
pub mod publisher;
pub mod remote;
pub mod source;

pub use capture::LocalCamera;
pub use encoder::{encode_detection_jpeg, EncodedFrame, H264Encoder};
pub use frame::VideoFrame;
pub use publisher::VideoPublisher;
pub use remote::{run_remote_decoder, AccessUnitAssembler, H264Decoder};
pub use source::{FrameSlot, PreferredSource, SourceKind, VideoSource};
