// Transform resolution: client placement -> canvas pixel space

use crate::core::errors::{InfuseError, InfuseResult};
use crate::core::types::{ResolvedTransform, Transform};

/// How client offsets are scaled before being added to the canvas midpoint.
///
/// The editor and the two server variants disagree here: the model-backed
/// endpoint halves the offsets, the placeholder endpoint adds them as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinateScale {
    /// Offsets added unchanged (factor 1)
    Full,
    /// Offsets halved first (factor 0.5)
    #[default]
    Half,
}

impl CoordinateScale {
    pub fn factor(self) -> f64 {
        match self {
            CoordinateScale::Full => 1.0,
            CoordinateScale::Half => 0.5,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().parse::<f64>().ok()? {
            f if f == 1.0 => Some(CoordinateScale::Full),
            f if f == 0.5 => Some(CoordinateScale::Half),
            _ => None,
        }
    }
}

/// Resolves client transforms into canvas coordinates
#[derive(Debug, Clone)]
pub struct TransformResolver {
    canvas_size: u32,
    scale: CoordinateScale,
}

impl TransformResolver {
    pub fn new(canvas_size: u32, scale: CoordinateScale) -> Self {
        Self { canvas_size, scale }
    }

    /// Parse the JSON-encoded transform form field
    pub fn parse(&self, raw: &str) -> InfuseResult<Transform> {
        serde_json::from_str::<Transform>(raw)
            .map_err(|e| InfuseError::InvalidTransform(e.to_string()))
    }

    pub fn resolve(&self, transform: &Transform) -> InfuseResult<ResolvedTransform> {
        let Transform { x, y, rotation, scale } = *transform;

        if ![x, y, rotation, scale].iter().all(|v| v.is_finite()) {
            return Err(InfuseError::InvalidTransform(
                "fields must be finite numbers".to_string(),
            ));
        }
        if scale <= 0.0 {
            return Err(InfuseError::InvalidTransform(format!(
                "scale must be > 0, got {}",
                scale
            )));
        }

        let half = f64::from(self.canvas_size) / 2.0;
        let factor = self.scale.factor();

        // Truncation toward zero matches the deployed integer conversion
        Ok(ResolvedTransform {
            x_canvas: (x * factor + half).trunc() as i64,
            y_canvas: (y * factor + half).trunc() as i64,
            rotation: rotation.rem_euclid(360.0),
            scale,
        })
    }

    /// Parse and resolve in one step
    pub fn resolve_raw(&self, raw: &str) -> InfuseResult<ResolvedTransform> {
        let transform = self.parse(raw)?;
        self.resolve(&transform)
    }
}
