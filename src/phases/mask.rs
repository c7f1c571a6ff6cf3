// Foreground mask extraction from the background-removed upload

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use tracing::{debug, instrument};

use crate::utils::image_ops::{bt601_luma, rotate_expand};

/// Binary canvas-resolution mask, every pixel either 0 or 255
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask(GrayImage);

impl Mask {
    /// Threshold a luminance image: anything above zero is foreground
    pub fn binarize(luma: &GrayImage) -> Self {
        let mut out = luma.clone();
        for p in out.pixels_mut() {
            p.0[0] = if p.0[0] > 0 { 255 } else { 0 };
        }
        Mask(out)
    }

    pub fn image(&self) -> &GrayImage {
        &self.0
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        self.0.get_pixel(x, y).0[0] == 255
    }

    /// Fraction of pixels marked foreground
    pub fn coverage(&self) -> f32 {
        let total = self.0.len();
        if total == 0 {
            return 0.0;
        }
        let set = self.0.as_raw().iter().filter(|&&v| v == 255).count();
        set as f32 / total as f32
    }
}

/// Builds the foreground mask aligned with the rotated foreground
#[derive(Debug, Clone)]
pub struct MaskExtractor {
    canvas_size: u32,
}

impl MaskExtractor {
    pub fn new(canvas_size: u32) -> Self {
        Self { canvas_size }
    }

    /// Rotate by the placement rotation, stretch to the canvas, then binarize.
    ///
    /// Luminance uses ITU-R 601 weights. Fully transparent pixels are always
    /// background, whatever their colour channels hold.
    #[instrument(skip(self, removed_bg), fields(width = removed_bg.width(), height = removed_bg.height()))]
    pub fn extract(&self, removed_bg: &DynamicImage, rotation: f64) -> Mask {
        let rotated = rotate_expand(removed_bg, -rotation);
        let resized = rotated
            .resize_exact(self.canvas_size, self.canvas_size, FilterType::CatmullRom)
            .to_rgba8();

        let luma = GrayImage::from_fn(self.canvas_size, self.canvas_size, |x, y| {
            let [r, g, b, a] = resized.get_pixel(x, y).0;
            if a == 0 {
                Luma([0])
            } else {
                Luma([bt601_luma(r, g, b)])
            }
        });

        let mask = Mask::binarize(&luma);
        debug!("Mask coverage {:.1}%", mask.coverage() * 100.0);
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn subject_on_black(size: u32) -> DynamicImage {
        // White square in the centre quarter, black elsewhere
        let img = RgbImage::from_fn(size, size, |x, y| {
            let inside = (size / 4..3 * size / 4).contains(&x) && (size / 4..3 * size / 4).contains(&y);
            if inside {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_mask_is_binary_and_canvas_sized() {
        let mask = MaskExtractor::new(64).extract(&subject_on_black(128), 0.0);
        assert_eq!(mask.dimensions(), (64, 64));
        assert!(mask.image().as_raw().iter().all(|&v| v == 0 || v == 255));
        assert!(mask.is_foreground(32, 32));
        assert!(!mask.is_foreground(2, 2));
    }

    #[test]
    fn test_binarize_is_idempotent() {
        let gradient = GrayImage::from_fn(32, 32, |x, y| Luma([((x + y) * 4) as u8]));
        let once = Mask::binarize(&gradient);
        let twice = Mask::binarize(once.image());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_transparent_pixels_are_background() {
        let img = RgbaImage::from_fn(16, 16, |x, _| {
            if x < 8 {
                Rgba([200, 200, 200, 0])
            } else {
                Rgba([200, 200, 200, 255])
            }
        });
        let mask = MaskExtractor::new(16).extract(&DynamicImage::ImageRgba8(img), 0.0);
        assert!(!mask.is_foreground(2, 8));
        assert!(mask.is_foreground(13, 8));
    }

    #[test]
    fn test_rotation_keeps_corners_empty() {
        let full = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([255, 255, 255])));
        let mask = MaskExtractor::new(64).extract(&full, 45.0);
        assert!(!mask.is_foreground(0, 0));
        assert!(mask.is_foreground(32, 32));
        assert!(mask.coverage() > 0.3 && mask.coverage() < 0.7);
    }
}
