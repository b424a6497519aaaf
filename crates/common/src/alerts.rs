//! Alert documents published to the message bus.
//!
//! The broadcast service consumes these as JSON, so the wire shape
//! (camelCase fields, ISO-8601 timestamps) is part of the contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Structured metadata carried alongside a face detection alert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertMetadata {
    pub faces: Vec<BoundingBox>,
}

/// A face detection event for a single camera, built once per sampling
/// pass that yields at least one validated face.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceDetectionAlert {
    pub camera_id: String,
    pub camera_name: String,
    pub face_count: usize,
    pub confidence: f64,
    /// Base64-encoded JPEG with bounding boxes drawn in.
    pub image_data: String,
    pub detected_at: DateTime<Utc>,
    pub metadata: AlertMetadata,
}

impl FaceDetectionAlert {
    pub fn new(
        camera_id: impl Into<String>,
        camera_name: impl Into<String>,
        confidence: f64,
        image_data: String,
        faces: Vec<BoundingBox>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            camera_name: camera_name.into(),
            face_count: faces.len(),
            confidence,
            image_data,
            detected_at: Utc::now(),
            metadata: AlertMetadata { faces },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_serializes_with_camel_case_fields() {
        let alert = FaceDetectionAlert::new(
            "cam-1",
            "Lobby",
            0.5,
            "aGVsbG8=".to_string(),
            vec![BoundingBox {
                x: 10,
                y: 20,
                width: 64,
                height: 70,
            }],
        );

        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["cameraId"], "cam-1");
        assert_eq!(value["cameraName"], "Lobby");
        assert_eq!(value["faceCount"], 1);
        assert_eq!(value["imageData"], "aGVsbG8=");
        assert_eq!(value["metadata"]["faces"][0]["x"], 10);
        assert_eq!(value["metadata"]["faces"][0]["width"], 64);
        // RFC 3339 timestamp, parseable by the broadcast service
        assert!(value["detectedAt"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn face_count_tracks_boxes() {
        let alert = FaceDetectionAlert::new("c", "n", 0.5, String::new(), vec![]);
        assert_eq!(alert.face_count, 0);
        assert!(alert.metadata.faces.is_empty());
    }
}
