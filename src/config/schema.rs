use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Relay / inference server endpoints
    pub server: ServerConfig,
    /// ICE server settings
    pub webrtc: WebRtcConfig,
    /// Local camera settings
    pub camera: CameraConfig,
    /// Detection frame capture settings
    pub capture: CaptureConfig,
    /// Detection client settings
    pub detection: DetectionConfig,
    /// Overlay rendering settings
    pub overlay: OverlayConfig,
    /// Join image poller settings
    pub join: JoinConfig,
}

/// Server configuration
///
/// Every endpoint is derived from `base_url`; `ws`/`wss` are picked from the
/// `http`/`https` scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the relay server (e.g. "http://192.168.1.10:8000")
    pub base_url: String,
    /// Signaling WebSocket path
    pub signaling_path: String,
    /// Detection push WebSocket path
    pub push_path: String,
    /// Detection request path
    pub detect_path: String,
    /// Join image path
    pub qr_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            signaling_path: "/ws".to_string(),
            push_path: "/ws/detection".to_string(),
            detect_path: "/api/detect".to_string(),
            qr_path: "/api/qr".to_string(),
        }
    }
}

impl ServerConfig {
    fn base(&self) -> Result<reqwest::Url> {
        reqwest::Url::parse(&self.base_url)
            .map_err(|e| AppError::Config(format!("Invalid server URL {}: {}", self.base_url, e)))
    }

    fn http_url(&self, path: &str) -> Result<String> {
        let url = self
            .base()?
            .join(path)
            .map_err(|e| AppError::Config(format!("Invalid path {}: {}", path, e)))?;
        Ok(url.to_string())
    }

    fn ws_url(&self, path: &str) -> Result<String> {
        let mut url = self
            .base()?
            .join(path)
            .map_err(|e| AppError::Config(format!("Invalid path {}: {}", path, e)))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(AppError::Config(format!(
                    "Unsupported server scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| AppError::Config(format!("Cannot use scheme {}", scheme)))?;
        Ok(url.to_string())
    }

    pub fn signaling_url(&self) -> Result<String> {
        self.ws_url(&self.signaling_path)
    }

    pub fn push_url(&self) -> Result<String> {
        self.ws_url(&self.push_path)
    }

    pub fn detect_url(&self) -> Result<String> {
        self.http_url(&self.detect_path)
    }

    pub fn qr_url(&self) -> Result<String> {
        self.http_url(&self.qr_path)
    }
}

/// TURN server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN URLs; several allow UDP/TCP fallback
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServer>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
        }
    }
}

/// Local camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device path; the camera role requires one, the viewer may omit it
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// H.264 target bitrate in kbps
    pub bitrate_kbps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 2000,
        }
    }
}

/// Frame capture loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Tick period
    pub period_ms: u64,
    /// Downsampled frame width
    pub target_width: u32,
    /// Downsampled frame height
    pub target_height: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: i32,
    /// Only capture while the peer connection is connected
    pub require_connected: bool,
    /// Use the local camera when no remote video is available
    pub allow_local_fallback: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            period_ms: 200,
            target_width: 224,
            target_height: 224,
            jpeg_quality: 70,
            require_connected: true,
            allow_local_fallback: true,
        }
    }
}

/// Detection client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Start in detecting mode
    pub enabled: bool,
    /// Open the push channel while detecting
    pub enable_push: bool,
    /// Per-request timeout; none means wait indefinitely
    pub request_timeout_ms: Option<u64>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enable_push: true,
            request_timeout_ms: None,
        }
    }
}

/// Overlay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Initial surface width
    pub width: u32,
    /// Initial surface height
    pub height: u32,
    /// Hide detections below this score
    pub score_threshold: Option<f32>,
    pub font_px: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            score_threshold: None,
            font_px: 14,
        }
    }
}

/// Join image poller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    pub enabled: bool,
    pub refresh_secs: u64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let server = ServerConfig {
            base_url: "http://10.0.0.2:8000".to_string(),
            ..Default::default()
        };
        assert_eq!(server.signaling_url().unwrap(), "ws://10.0.0.2:8000/ws");
        assert_eq!(server.push_url().unwrap(), "ws://10.0.0.2:8000/ws/detection");
        assert_eq!(server.detect_url().unwrap(), "http://10.0.0.2:8000/api/detect");
        assert_eq!(server.qr_url().unwrap(), "http://10.0.0.2:8000/api/qr");

        let secure = ServerConfig {
            base_url: "https://relay.example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(secure.signaling_url().unwrap(), "wss://relay.example.com/ws");
    }

    #[test]
    fn test_invalid_base_url() {
        let server = ServerConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(server.signaling_url(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [capture]
            period_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.period_ms, 500);
        assert_eq!(config.capture.target_width, 224);
        assert_eq!(config.join.refresh_secs, 60);
        assert_eq!(config.webrtc.stun_servers.len(), 1);
    }
}
