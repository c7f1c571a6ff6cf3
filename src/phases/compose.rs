// Batch composition: gathers canvas-space conditioning for the sampler

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::core::errors::{InfuseError, InfuseResult};
use crate::core::types::BoundingBox;
use crate::phases::mask::Mask;
use crate::utils::image_ops::rotate_expand;

/// Everything the sampler conditions on for one request.
///
/// Geometry is shared by every sample; per-sample variation comes only from
/// the sampler's noise. Replication to `batch_count` happens when the sampler
/// encodes this into tensors.
#[derive(Debug, Clone)]
pub struct ConditioningBatch {
    pub background: RgbImage,
    pub foreground: RgbImage,
    pub bbox: BoundingBox,
    pub mask: Mask,
    pub batch_count: usize,
}

impl ConditioningBatch {
    pub fn canvas_size(&self) -> u32 {
        self.background.width()
    }
}

/// Foreground after rotation, stretched back onto the canvas
#[derive(Debug, Clone)]
pub struct RotatedForeground {
    pub image: DynamicImage,
    /// Frame size right after rotate-with-expand, before the canvas resize
    pub rotated_dims: (u32, u32),
}

/// Resize to the canvas, rotate clockwise by `rotation` with frame expansion,
/// then resize to the canvas again.
pub fn rotate_foreground(front: &DynamicImage, rotation: f64, canvas_size: u32) -> RotatedForeground {
    let on_canvas = front.resize_exact(canvas_size, canvas_size, FilterType::CatmullRom);
    let rotated = rotate_expand(&on_canvas, -rotation);
    let rotated_dims = (rotated.width(), rotated.height());

    RotatedForeground {
        image: rotated.resize_exact(canvas_size, canvas_size, FilterType::CatmullRom),
        rotated_dims,
    }
}

/// Validates batch parameters and packages conditioning
#[derive(Debug, Clone)]
pub struct BatchComposer {
    canvas_size: u32,
    max_batch_count: usize,
}

impl BatchComposer {
    pub fn new(canvas_size: u32, max_batch_count: usize) -> Self {
        Self {
            canvas_size,
            max_batch_count,
        }
    }

    pub fn max_batch_count(&self) -> usize {
        self.max_batch_count
    }

    pub fn check_batch_count(&self, batch_count: i64) -> InfuseResult<usize> {
        if batch_count < 1 || batch_count as u64 > self.max_batch_count as u64 {
            return Err(InfuseError::InvalidBatchCount {
                value: batch_count,
                max: self.max_batch_count,
            });
        }
        Ok(batch_count as usize)
    }

    pub fn compose(
        &self,
        background: &DynamicImage,
        foreground: &RotatedForeground,
        bbox: BoundingBox,
        mask: Mask,
        batch_count: i64,
    ) -> InfuseResult<ConditioningBatch> {
        let batch_count = self.check_batch_count(batch_count)?;

        let side = self.canvas_size;
        if mask.dimensions() != (side, side) {
            return Err(InfuseError::Internal(format!(
                "mask is {:?}, expected {}x{}",
                mask.dimensions(),
                side,
                side
            )));
        }

        let background = if background.width() == side && background.height() == side {
            background.to_rgb8()
        } else {
            background
                .resize_exact(side, side, FilterType::CatmullRom)
                .to_rgb8()
        };

        let fg = &foreground.image;
        let foreground = if fg.width() == side && fg.height() == side {
            fg.to_rgb8()
        } else {
            fg.resize_exact(side, side, FilterType::CatmullRom).to_rgb8()
        };

        Ok(ConditioningBatch {
            background,
            foreground,
            bbox,
            mask,
            batch_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb};

    fn mask(side: u32) -> Mask {
        Mask::binarize(&GrayImage::from_pixel(side, side, Luma([1])))
    }

    fn bbox() -> BoundingBox {
        BoundingBox { x1: 8, y1: 8, x2: 24, y2: 24 }
    }

    #[test]
    fn test_batch_count_bounds() {
        let composer = BatchComposer::new(32, 4);
        assert!(matches!(
            composer.check_batch_count(0),
            Err(InfuseError::InvalidBatchCount { value: 0, max: 4 })
        ));
        assert!(composer.check_batch_count(-3).is_err());
        assert!(composer.check_batch_count(5).is_err());
        assert_eq!(composer.check_batch_count(4).unwrap(), 4);
    }

    #[test]
    fn test_compose_resizes_to_canvas() {
        let composer = BatchComposer::new(32, 4);
        let bg = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 60, Rgb([10, 20, 30])));
        let fg = rotate_foreground(
            &DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb([200, 0, 0]))),
            0.0,
            32,
        );

        let batch = composer.compose(&bg, &fg, bbox(), mask(32), 2).unwrap();
        assert_eq!(batch.background.dimensions(), (32, 32));
        assert_eq!(batch.foreground.dimensions(), (32, 32));
        assert_eq!(batch.batch_count, 2);
        assert_eq!(batch.canvas_size(), 32);
        assert_eq!(*batch.background.get_pixel(5, 5), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_compose_rejects_bad_count_and_mask() {
        let composer = BatchComposer::new(32, 4);
        let bg = DynamicImage::ImageRgb8(RgbImage::new(32, 32));
        let fg = rotate_foreground(&bg, 0.0, 32);

        assert!(matches!(
            composer.compose(&bg, &fg, bbox(), mask(32), 0),
            Err(InfuseError::InvalidBatchCount { .. })
        ));
        assert!(matches!(
            composer.compose(&bg, &fg, bbox(), mask(16), 1),
            Err(InfuseError::Internal(_))
        ));
    }

    #[test]
    fn test_rotated_dims_reported_before_resize() {
        let front = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let fg = rotate_foreground(&front, 90.0, 64);
        assert_eq!(fg.rotated_dims, (64, 64));
        assert_eq!((fg.image.width(), fg.image.height()), (64, 64));

        let fg = rotate_foreground(&front, 30.0, 64);
        assert!(fg.rotated_dims.0 > 64);
    }
}
