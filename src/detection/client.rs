//! Request/response detection over HTTP

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::types::{decode_detection_payload, DetectionOrigin, DetectionSet};
use crate::config::{DetectionConfig, ServerConfig};
use crate::error::{AppError, Result};
use crate::video::SourceKind;

/// One encoded still submitted for detection
///
/// Not retained after the submission completes.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub jpeg: Bytes,
    /// Unique per submission, derived from the submission time in ms
    pub frame_id: String,
    /// Capture time (ms since epoch)
    pub capture_ts: i64,
    pub source: SourceKind,
}

/// Something that turns a frame into detections
#[async_trait]
pub trait DetectionBackend: Send + Sync + 'static {
    async fn detect(&self, frame: &CaptureFrame) -> Result<DetectionSet>;
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: String,
    frame_id: &'a str,
    capture_ts: i64,
    source: &'static str,
}

/// `POST /api/detect` client
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
}

impl HttpDetector {
    pub fn new(server: &ServerConfig, detection: &DetectionConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(ms) = detection.request_timeout_ms.filter(|ms| *ms > 0) {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let client = builder
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: server.detect_url()?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DetectionBackend for HttpDetector {
    async fn detect(&self, frame: &CaptureFrame) -> Result<DetectionSet> {
        let body = DetectRequest {
            image: jpeg_data_url(&frame.jpeg),
            frame_id: &frame.frame_id,
            capture_ts: frame.capture_ts,
            source: frame.source.as_str(),
        };

        let response = self
            .client
            .post(&self.url)
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Detection(format!(
                "Detector returned {} for frame {}",
                response.status(),
                frame.frame_id
            )));
        }

        let value: Value = response.json().await?;
        let mut set = decode_detect_response(&value)?;
        if set.frame_id.is_none() {
            set.frame_id = Some(frame.frame_id.clone());
        }
        if set.capture_ts.is_none() {
            set.capture_ts = Some(frame.capture_ts);
        }

        debug!(
            "Frame {} -> {} detections",
            frame.frame_id,
            set.detections.len()
        );
        Ok(set)
    }
}

/// A response carrying `error` is a failed request, anything else decodes
/// to a (possibly empty) set
pub fn decode_detect_response(value: &Value) -> Result<DetectionSet> {
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(AppError::Detection(message));
    }
    Ok(decode_detection_payload(value, DetectionOrigin::Response))
}

fn jpeg_data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_response_is_failure() {
        let err = decode_detect_response(&json!({"error": "Failed to decode image"})).unwrap_err();
        assert!(matches!(err, AppError::Detection(m) if m == "Failed to decode image"));

        let set = decode_detect_response(&json!({"error": null, "detections": []})).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_data_url() {
        assert_eq!(jpeg_data_url(&[0xFF, 0xD8]), "data:image/jpeg;base64,/9g=");
    }

    #[test]
    fn test_request_body_shape() {
        let body = DetectRequest {
            image: jpeg_data_url(b"jpg"),
            frame_id: "1200",
            capture_ts: 1200,
            source: SourceKind::Remote.as_str(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["frame_id"], "1200");
        assert_eq!(value["capture_ts"], 1200);
        assert_eq!(value["source"], "remote");
        assert!(value["image"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
    }

    #[tokio::test]
    async fn test_unreachable_detector_fails() {
        let server = ServerConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let detection = DetectionConfig {
            request_timeout_ms: Some(2000),
            ..Default::default()
        };
        let detector = HttpDetector::new(&server, &detection).unwrap();
        assert_eq!(detector.url(), "http://127.0.0.1:9/api/detect");

        let frame = CaptureFrame {
            jpeg: Bytes::from_static(b"jpg"),
            frame_id: "1000".to_string(),
            capture_ts: 1000,
            source: SourceKind::Local,
        };
        tokio_test::assert_err!(detector.detect(&frame).await);
    }
}
