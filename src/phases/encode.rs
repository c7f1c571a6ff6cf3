// Result encoding: sampler tensors -> PNG data URIs

use futures::future::join_all;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{ArrayView3, Axis};
use rand::Rng;
use tracing::{debug, instrument};

use crate::core::errors::{InfuseError, InfuseResult};
use crate::core::types::SampleResult;
use crate::services::sampler::SampleTensor;
use crate::utils::image_ops::{encode_png_async, png_data_url};

/// Converts sampler output into client-facing results
#[derive(Debug, Clone)]
pub struct ResultEncoder {
    canvas_size: u32,
}

impl ResultEncoder {
    pub fn new(canvas_size: u32) -> Self {
        Self { canvas_size }
    }

    /// Denormalize NCHW samples in [-1, 1] into canvas-sized RGB images
    pub fn to_images(&self, samples: &SampleTensor) -> InfuseResult<Vec<RgbImage>> {
        let (_, channels, height, width) = samples.dim();
        if channels != 3 {
            return Err(InfuseError::Internal(format!(
                "sampler produced {} channels, expected 3",
                channels
            )));
        }
        if height == 0 || width == 0 {
            return Err(InfuseError::Internal("sampler produced empty images".to_string()));
        }

        Ok(samples
            .axis_iter(Axis(0))
            .map(|sample| self.to_image(sample))
            .collect())
    }

    fn to_image(&self, sample: ArrayView3<'_, f32>) -> RgbImage {
        let (_, height, width) = sample.dim();
        let channel = |c: usize, x: u32, y: u32| -> u8 {
            let v = (sample[[c, y as usize, x as usize]] + 1.0) / 2.0;
            // Truncating cast, NaN becomes 0
            (v.clamp(0.0, 1.0) * 255.0) as u8
        };

        let img = RgbImage::from_fn(width as u32, height as u32, |x, y| {
            Rgb([channel(0, x, y), channel(1, x, y), channel(2, x, y)])
        });

        if img.dimensions() == (self.canvas_size, self.canvas_size) {
            img
        } else {
            DynamicImage::ImageRgb8(img)
                .resize_exact(self.canvas_size, self.canvas_size, FilterType::CatmullRom)
                .to_rgb8()
        }
    }

    /// Encode every sample, preserving sample order in the result list
    #[instrument(skip(self, samples), fields(samples = samples.dim().0))]
    pub async fn encode(&self, samples: &SampleTensor) -> InfuseResult<Vec<SampleResult>> {
        let images = self.to_images(samples)?;

        let encoded = join_all(
            images
                .into_iter()
                .map(|img| encode_png_async(DynamicImage::ImageRgb8(img))),
        )
        .await;

        let mut rng = rand::rng();
        let mut results = Vec::with_capacity(encoded.len());
        for (index, png) in encoded.into_iter().enumerate() {
            let png = png.map_err(|e| InfuseError::Internal(format!("{:#}", e)))?;
            results.push(SampleResult {
                id: format!("result-{}-{}", index, rng.random_range(10000..100000)),
                image_url: png_data_url(&png),
            });
        }

        debug!("Encoded {} results", results.len());
        Ok(results)
    }
}
