//! Detection data model and payload decoding

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label used when the detector omits one
pub const DEFAULT_LABEL: &str = "obj";

/// One detected object, coordinates normalized to `[0, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Detection {
    /// Build a detection, clamping into `[0, 1]`
    ///
    /// Returns `None` for degenerate boxes (`xmin >= xmax` or `ymin >= ymax`
    /// after clamping) or non-finite values.
    pub fn normalized(
        label: impl Into<String>,
        score: f32,
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
    ) -> Option<Self> {
        if ![score, xmin, ymin, xmax, ymax].iter().all(|v| v.is_finite()) {
            return None;
        }
        let clamp = |v: f32| v.clamp(0.0, 1.0);
        let (xmin, ymin, xmax, ymax) = (clamp(xmin), clamp(ymin), clamp(xmax), clamp(ymax));
        if xmin >= xmax || ymin >= ymax {
            return None;
        }
        Some(Self {
            label: label.into(),
            score: clamp(score),
            xmin,
            ymin,
            xmax,
            ymax,
        })
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }
}

/// Which delivery mode produced a detection set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionOrigin {
    /// Reply to a frame this node submitted
    Response,
    /// Pushed by the detector, not tied to a submission
    Push,
}

/// The complete set of currently visible detections
///
/// A new set replaces the previous one outright; sets are never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    pub frame_id: Option<String>,
    pub capture_ts: Option<i64>,
    /// Detector receive time (ms)
    pub recv_ts: Option<i64>,
    /// Detector inference completion time (ms)
    pub inference_ts: Option<i64>,
    pub origin: DetectionOrigin,
    pub detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn empty(origin: DetectionOrigin) -> Self {
        Self {
            frame_id: None,
            capture_ts: None,
            recv_ts: None,
            inference_ts: None,
            origin,
            detections: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[derive(Deserialize)]
struct RawDetection {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    score: Option<f32>,
    xmin: f32,
    ymin: f32,
    xmax: f32,
    ymax: f32,
}

/// Decode a detector payload into a typed set
///
/// Accepts `{"detections": [...]}` and `{"payload": {"detections": [...]}}`.
/// A missing or non-array `detections` field yields an empty set; individual
/// entries that are not valid detections are dropped.
pub fn decode_detection_payload(value: &Value, origin: DetectionOrigin) -> DetectionSet {
    let body = match value.get("detections") {
        Some(Value::Array(_)) => value,
        _ => value
            .get("payload")
            .filter(|p| p.get("detections").is_some_and(Value::is_array))
            .unwrap_or(value),
    };

    let detections = body
        .get("detections")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(decode_detection).collect())
        .unwrap_or_default();

    DetectionSet {
        frame_id: body.get("frame_id").and_then(id_string),
        capture_ts: body.get("capture_ts").and_then(Value::as_i64),
        recv_ts: body.get("recv_ts").and_then(Value::as_i64),
        inference_ts: body.get("inference_ts").and_then(Value::as_i64),
        origin,
        detections,
    }
}

/// [`decode_detection_payload`] over raw text; unparseable text is an empty set
pub fn parse_detection_payload(text: &str, origin: DetectionOrigin) -> DetectionSet {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => decode_detection_payload(&value, origin),
        Err(_) => DetectionSet::empty(origin),
    }
}

fn decode_detection(value: &Value) -> Option<Detection> {
    let raw = RawDetection::deserialize(value).ok()?;
    let label = raw
        .label
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_LABEL.to_string());
    Detection::normalized(
        label,
        raw.score.unwrap_or(0.0),
        raw.xmin,
        raw.ymin,
        raw.xmax,
        raw.ymax,
    )
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
