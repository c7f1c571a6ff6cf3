use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

/// Asynchronously load an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large uploads.
pub async fn load_image_from_memory_async(bytes: &[u8]) -> Result<DynamicImage> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to load image from memory")
    })
    .await
    .context("Failed to spawn blocking task for image loading")?
}

/// Asynchronously encode an image to PNG bytes using spawn_blocking.
pub async fn encode_png_async(img: DynamicImage) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode_png(&img))
        .await
        .context("Failed to spawn blocking task for PNG encoding")?
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(png_bytes)
}

/// Wrap PNG bytes as a `data:` URI
pub fn png_data_url(png_bytes: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(png_bytes)
    )
}

/// Affine coefficients mapping output pixels back into the source image.
///
/// Mirrors the usual imaging-library convention: positive angles rotate
/// counter-clockwise, coefficients are rounded to 15 decimals so that right
/// angles produce exact frames, and the expanded frame is
/// `ceil(max) - floor(min)` over the rotated corners.
#[derive(Debug, Clone, Copy)]
struct RotationFrame {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
    width: u32,
    height: u32,
}

fn round15(v: f64) -> f64 {
    (v * 1e15).round() / 1e15
}

impl RotationFrame {
    fn new(width: u32, height: u32, angle_ccw: f64) -> Self {
        let w = f64::from(width);
        let h = f64::from(height);
        let theta = -angle_ccw.to_radians();

        let a = round15(theta.cos());
        let b = round15(theta.sin());
        let d = round15(-theta.sin());
        let e = a;

        let (cx, cy) = (w / 2.0, h / 2.0);
        let c = a * -cx + b * -cy + cx;
        let f = d * -cx + e * -cy + cy;

        let map = |x: f64, y: f64, c: f64, f: f64| (a * x + b * y + c, d * x + e * y + f);

        let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)].map(|(x, y)| map(x, y, c, f));
        let (min_x, max_x) = corners
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.0), hi.max(p.0)));
        let (min_y, max_y) = corners
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.1), hi.max(p.1)));

        let new_w = (max_x.ceil() - min_x.floor()).max(1.0);
        let new_h = (max_y.ceil() - min_y.floor()).max(1.0);

        let (c, f) = map(-(new_w - w) / 2.0, -(new_h - h) / 2.0, c, f);

        Self {
            a,
            b,
            c,
            d,
            e,
            f,
            width: new_w as u32,
            height: new_h as u32,
        }
    }

    fn source(&self, x: u32, y: u32) -> (f64, f64) {
        let (x, y) = (f64::from(x) + 0.5, f64::from(y) + 0.5);
        (
            self.a * x + self.b * y + self.c,
            self.d * x + self.e * y + self.f,
        )
    }
}

/// Dimensions of an image after rotating it and growing the frame to fit
pub fn rotated_dimensions(width: u32, height: u32, angle_ccw: f64) -> (u32, u32) {
    let frame = RotationFrame::new(width, height, angle_ccw);
    (frame.width, frame.height)
}

/// Rotate counter-clockwise by `angle_ccw` degrees, expanding the frame to
/// hold the whole result. Nearest-neighbour sampling; uncovered pixels are
/// transparent black.
pub fn rotate_expand(img: &DynamicImage, angle_ccw: f64) -> DynamicImage {
    let src = img.to_rgba8();
    let (sw, sh) = src.dimensions();
    let frame = RotationFrame::new(sw, sh, angle_ccw);

    let out = RgbaImage::from_fn(frame.width, frame.height, |x, y| {
        let (sx, sy) = frame.source(x, y);
        if sx < 0.0 || sy < 0.0 {
            return Rgba([0, 0, 0, 0]);
        }
        let (ix, iy) = (sx.floor() as u32, sy.floor() as u32);
        if ix < sw && iy < sh {
            *src.get_pixel(ix, iy)
        } else {
            Rgba([0, 0, 0, 0])
        }
    });

    DynamicImage::ImageRgba8(out)
}

/// ITU-R 601-2 luma with the integer weights and rounding used by common
/// imaging libraries for RGB -> L conversion.
#[inline]
pub fn bt601_luma(r: u8, g: u8, b: u8) -> u8 {
    ((u32::from(r) * 19595 + u32::from(g) * 38470 + u32::from(b) * 7471 + 0x8000) >> 16) as u8
}
