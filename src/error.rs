use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Camera could not be opened (missing device, permission denied, busy)
    #[error("Media acquisition failed [{device}]: {reason}")]
    MediaAcquisition { device: String, reason: String },

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Detection error: {0}")]
    Detection(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors that must stop the session instead of being logged and skipped
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::MediaAcquisition { .. } | AppError::Config(_)
        )
    }
}

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::WebRtcError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Signaling(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
