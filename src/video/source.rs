//! Frame sources the detection loop can sample from

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use super::frame::VideoFrame;

/// Where a sampled frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Remote,
    Local,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Remote => "remote",
            SourceKind::Local => "local",
        }
    }
}

/// Anything that can hand out its most recent frame
pub trait VideoSource: Send + Sync {
    /// Has produced at least one frame and is still live
    fn is_ready(&self) -> bool;

    fn latest_frame(&self) -> Option<VideoFrame>;
}

/// Single-slot holder for the newest frame of a stream
///
/// Writers overwrite, readers always see the latest frame; nothing queues.
#[derive(Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<VideoFrame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, frame: VideoFrame) {
        self.tx.send_replace(Some(frame));
    }

    /// Mark the stream as gone
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<VideoFrame>> {
        self.tx.subscribe()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSource for FrameSlot {
    fn is_ready(&self) -> bool {
        self.tx.borrow().is_some()
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        self.tx.borrow().clone()
    }
}

/// Remote video first, local camera as fallback
#[derive(Clone, Default)]
pub struct PreferredSource {
    remote: Option<Arc<dyn VideoSource>>,
    local: Option<Arc<dyn VideoSource>>,
}

impl PreferredSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self, source: Arc<dyn VideoSource>) -> Self {
        self.remote = Some(source);
        self
    }

    pub fn with_local(mut self, source: Arc<dyn VideoSource>) -> Self {
        self.local = Some(source);
        self
    }

    /// Whichever source is ready, remote preferred
    pub fn select(&self) -> Option<(SourceKind, &Arc<dyn VideoSource>)> {
        if let Some(remote) = self.remote.as_ref().filter(|s| s.is_ready()) {
            return Some((SourceKind::Remote, remote));
        }
        self.local
            .as_ref()
            .filter(|s| s.is_ready())
            .map(|s| (SourceKind::Local, s))
    }

    pub fn is_ready(&self) -> bool {
        self.select().is_some()
    }

    /// Latest frame from the preferred ready source
    pub fn sample(&self) -> Option<(SourceKind, VideoFrame)> {
        let (kind, source) = self.select()?;
        source.latest_frame().map(|frame| (kind, frame))
    }
}
