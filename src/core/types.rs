// Shared request/response types for the compositing pipeline

use axum::body::Bytes;
use serde::{Deserialize, Serialize};

/// Client placement transform, centred on the canvas midpoint
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    /// Degrees, clockwise as rendered by the editor
    pub rotation: f64,
    pub scale: f64,
}

/// Transform after translation into canvas pixel space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedTransform {
    pub x_canvas: i64,
    pub y_canvas: i64,
    /// Normalized to [0, 360)
    pub rotation: f64,
    pub scale: f64,
}

/// Placement region in canvas pixels. `x2`/`y2` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }

    /// Corners divided by the canvas side, as the sampler expects
    pub fn normalized(&self, side: u32) -> [f32; 4] {
        let s = side as f32;
        [
            self.x1 as f32 / s,
            self.y1 as f32 / s,
            self.x2 as f32 / s,
            self.y2 as f32 / s,
        ]
    }
}

/// Raw compositing request as received from the client
#[derive(Debug, Clone, Default)]
pub struct InfuseRequest {
    pub background_image: Option<Bytes>,
    pub front_image: Option<Bytes>,
    pub removed_bg_image: Option<Bytes>,
    pub transform: Option<String>,
    pub batch_count: Option<String>,
    pub step_count: Option<String>,
}

/// One generated composite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleResult {
    pub id: String,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
}

/// Error payload returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_dimensions() {
        let bbox = BoundingBox { x1: 10, y1: 20, x2: 110, y2: 70 };
        assert_eq!(bbox.width(), 100);
        assert_eq!(bbox.height(), 50);
        assert!(bbox.contains(10, 20));
        assert!(!bbox.contains(110, 20));
        assert_eq!(bbox.normalized(100), [0.1, 0.2, 1.1, 0.7]);
    }

    #[test]
    fn test_sample_result_wire_format() {
        let result = SampleResult {
            id: "result-0-12345".into(),
            image_url: "data:image/png;base64,AAAA".into(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["imageUrl"], "data:image/png;base64,AAAA");
        assert_eq!(json["id"], "result-0-12345");
    }
}
