// Bounding box calculation for the placed foreground

use tracing::debug;

use crate::core::errors::{InfuseError, InfuseResult};
use crate::core::types::{BoundingBox, ResolvedTransform};

/// Geometry used to turn a rotated foreground into a placement box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BboxPolicy {
    /// Deployed behaviour: the scaled extent is halved, then halved again
    /// around the centre, so the box spans `dim * scale / 2` pixels.
    #[default]
    NestedHalf,
    /// Box spans the full scaled extent `dim * scale`.
    Centered,
}

impl BboxPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "nested-half" | "nested_half" | "legacy" => Some(BboxPolicy::NestedHalf),
            "centered" | "centred" => Some(BboxPolicy::Centered),
            _ => None,
        }
    }

    /// Distance from the centre to each edge, per axis
    fn reach(self, rotated_w: u32, rotated_h: u32, scale: f64) -> (i64, i64) {
        match self {
            BboxPolicy::NestedHalf => {
                let half_w = (f64::from(rotated_w) * scale / 2.0).trunc() as i64;
                let half_h = (f64::from(rotated_h) * scale / 2.0).trunc() as i64;
                (half_w / 2, half_h / 2)
            }
            BboxPolicy::Centered => (
                (f64::from(rotated_w) * scale / 2.0).trunc() as i64,
                (f64::from(rotated_h) * scale / 2.0).trunc() as i64,
            ),
        }
    }
}

/// Computes and clamps the placement box on the canvas
#[derive(Debug, Clone)]
pub struct BboxCalculator {
    canvas_size: u32,
    policy: BboxPolicy,
}

impl BboxCalculator {
    pub fn new(canvas_size: u32, policy: BboxPolicy) -> Self {
        Self { canvas_size, policy }
    }

    pub fn policy(&self) -> BboxPolicy {
        self.policy
    }

    /// # Arguments
    /// * `rotated` - foreground dimensions after rotate-with-expand
    /// * `transform` - resolved canvas-space placement
    ///
    /// # Returns
    /// A box with `0 <= x1 < x2 <= S` and `0 <= y1 < y2 <= S`, or
    /// `DegenerateBoundingBox` when nothing of it lands on the canvas.
    pub fn compute(
        &self,
        rotated: (u32, u32),
        transform: &ResolvedTransform,
    ) -> InfuseResult<BoundingBox> {
        let (reach_x, reach_y) = self.policy.reach(rotated.0, rotated.1, transform.scale);
        let side = i64::from(self.canvas_size);

        // Extreme offsets and scales saturate at the i64 bounds before clamping
        let x1 = transform.x_canvas.saturating_sub(reach_x).max(0);
        let y1 = transform.y_canvas.saturating_sub(reach_y).max(0);
        let x2 = transform.x_canvas.saturating_add(reach_x).min(side);
        let y2 = transform.y_canvas.saturating_add(reach_y).min(side);

        if x2 <= x1 || y2 <= y1 {
            debug!(x1, y1, x2, y2, "placement clamps to an empty box");
            return Err(InfuseError::DegenerateBoundingBox { x1, y1, x2, y2 });
        }

        // x1 < x2 <= side and x1 >= 0, so every corner fits in u32
        Ok(BoundingBox {
            x1: x1 as u32,
            y1: y1 as u32,
            x2: x2 as u32,
            y2: y2 as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: i64, y: i64, scale: f64) -> ResolvedTransform {
        ResolvedTransform { x_canvas: x, y_canvas: y, rotation: 0.0, scale }
    }

    #[test]
    fn test_nested_half_at_midpoint() {
        let calc = BboxCalculator::new(512, BboxPolicy::NestedHalf);
        let bbox = calc.compute((512, 512), &at(256, 256, 1.0)).unwrap();
        // 512 * 1 / 2 = 256, halved again -> 128 on each side
        assert_eq!(bbox, BoundingBox { x1: 128, y1: 128, x2: 384, y2: 384 });
    }

    #[test]
    fn test_centered_policy_uses_full_extent() {
        let calc = BboxCalculator::new(512, BboxPolicy::Centered);
        let bbox = calc.compute((200, 100), &at(256, 256, 1.0)).unwrap();
        assert_eq!(bbox, BoundingBox { x1: 156, y1: 206, x2: 356, y2: 306 });
    }

    #[test]
    fn test_clamps_to_canvas_edges() {
        let calc = BboxCalculator::new(512, BboxPolicy::NestedHalf);
        let bbox = calc.compute((512, 512), &at(10, 500, 2.0)).unwrap();
        assert_eq!(bbox, BoundingBox { x1: 0, y1: 244, x2: 266, y2: 512 });
    }

    #[test]
    fn test_far_outside_is_degenerate() {
        let calc = BboxCalculator::new(512, BboxPolicy::NestedHalf);
        let err = calc.compute((512, 512), &at(-244, -244, 0.01)).unwrap_err();
        assert!(matches!(err, InfuseError::DegenerateBoundingBox { .. }));

        let err = calc.compute((512, 512), &at(900, 100, 1.0)).unwrap_err();
        assert!(matches!(err, InfuseError::DegenerateBoundingBox { .. }));
    }

    #[test]
    fn test_tiny_scale_collapses() {
        let calc = BboxCalculator::new(512, BboxPolicy::NestedHalf);
        // 512 * 0.005 / 2 = 1 -> halved to 0
        let err = calc.compute((512, 512), &at(256, 256, 0.005)).unwrap_err();
        assert!(matches!(err, InfuseError::DegenerateBoundingBox { .. }));
    }

    #[test]
    fn test_invariant_holds_over_grid() {
        for policy in [BboxPolicy::NestedHalf, BboxPolicy::Centered] {
            let calc = BboxCalculator::new(512, policy);
            for x in (-800..=1300).step_by(97) {
                for y in (-800..=1300).step_by(101) {
                    for scale in [0.01, 0.3, 1.0, 2.5, 10.0] {
                        match calc.compute((725, 300), &at(x, y, scale)) {
                            Ok(b) => {
                                assert!(b.x1 < b.x2 && b.x2 <= 512);
                                assert!(b.y1 < b.y2 && b.y2 <= 512);
                            }
                            Err(e) => {
                                assert!(matches!(e, InfuseError::DegenerateBoundingBox { .. }))
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_extreme_transforms_clamp_without_overflow() {
        use crate::phases::transform::{CoordinateScale, TransformResolver};

        let resolver = TransformResolver::new(512, CoordinateScale::Half);
        let huge_scale = resolver
            .resolve_raw(r#"{"x":0,"y":0,"rotation":0,"scale":1e300}"#)
            .unwrap();
        let far_right = resolver
            .resolve_raw(r#"{"x":1e20,"y":0,"rotation":0,"scale":1}"#)
            .unwrap();
        let far_left = resolver
            .resolve_raw(r#"{"x":-1e20,"y":-1e20,"rotation":0,"scale":1}"#)
            .unwrap();

        for policy in [BboxPolicy::NestedHalf, BboxPolicy::Centered] {
            let calc = BboxCalculator::new(512, policy);

            let full = calc.compute((512, 512), &huge_scale).unwrap();
            assert_eq!(full, BoundingBox { x1: 0, y1: 0, x2: 512, y2: 512 });

            for resolved in [&far_right, &far_left] {
                let err = calc.compute((512, 512), resolved).unwrap_err();
                assert!(matches!(err, InfuseError::DegenerateBoundingBox { .. }));
            }
        }
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!(BboxPolicy::parse("nested-half"), Some(BboxPolicy::NestedHalf));
        assert_eq!(BboxPolicy::parse("Centered"), Some(BboxPolicy::Centered));
        assert_eq!(BboxPolicy::parse("square"), None);
    }
}
