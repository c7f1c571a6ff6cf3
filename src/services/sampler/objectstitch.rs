// ObjectStitch diffusion sampler over exported ONNX graphs
//
// Four graphs live in the model directory:
//   conditioner.onnx  foreground (1,3,224,224)            -> "embedding" (1,T,D)
//   encoder.onnx      "image" (1,3,S,S) in [-1,1]         -> "latent" (1,4,S/8,S/8)
//   unet.onnx         "sample" (n,9,h,w), "timestep" (n), "context" (n,T,D), "bbox" (n,4)
//                                                         -> "noise_pred" (n,4,h,w)
//   decoder.onnx      "latent" (n,4,h,w)                  -> "image" (n,3,S,S)

use anyhow::Context;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{concatenate, Array1, Array2, Array3, Array4, Axis};
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::path::Path;
use tracing::{debug, info};

use super::{CancelFlag, SampleParams, SampleTensor, Sampler};
use crate::core::errors::{SamplerError, SamplerResult};
use crate::core::types::BoundingBox;
use crate::phases::compose::ConditioningBatch;
use crate::phases::mask::Mask;
use crate::services::onnx_builder::build_session;

/// Stable Diffusion latent scaling
const LATENT_SCALE: f32 = 0.18215;
const LATENT_CHANNELS: usize = 4;
const LATENT_DOWNSCALE: u32 = 8;

const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;

const CLIP_SIZE: u32 = 224;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Deterministic DDIM (eta = 0) over a scaled-linear beta schedule
#[derive(Debug, Clone)]
pub struct DdimSchedule {
    alphas_cumprod: Vec<f64>,
}

impl Default for DdimSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl DdimSchedule {
    pub fn new() -> Self {
        let (lo, hi) = (BETA_START.sqrt(), BETA_END.sqrt());
        let last = (TRAIN_TIMESTEPS - 1) as f64;

        let mut acc = 1.0;
        let alphas_cumprod = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let beta = (lo + (hi - lo) * i as f64 / last).powi(2);
                acc *= 1.0 - beta;
                acc
            })
            .collect();
        Self { alphas_cumprod }
    }

    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        self.alphas_cumprod[t.min(TRAIN_TIMESTEPS - 1)]
    }

    /// Uniformly spaced timesteps, ascending
    pub fn timesteps(&self, steps: u32) -> Vec<usize> {
        let stride = (TRAIN_TIMESTEPS / steps.max(1) as usize).max(1);
        let mut out: Vec<usize> = (0..TRAIN_TIMESTEPS)
            .step_by(stride)
            .map(|t| (t + 1).min(TRAIN_TIMESTEPS - 1))
            .collect();
        out.dedup();
        out
    }

    /// (alpha_t, alpha_prev) pairs in denoising order
    pub fn plan(&self, steps: u32) -> Vec<(usize, f64, f64)> {
        let timesteps = self.timesteps(steps);
        let mut plan: Vec<(usize, f64, f64)> = timesteps
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let prev = if i == 0 {
                    self.alphas_cumprod[0]
                } else {
                    self.alpha_cumprod(timesteps[i - 1])
                };
                (t, self.alpha_cumprod(t), prev)
            })
            .collect();
        plan.reverse();
        plan
    }

    /// One deterministic DDIM update
    pub fn step(x: &Array4<f32>, eps: &Array4<f32>, alpha: f64, alpha_prev: f64) -> Array4<f32> {
        let a = alpha as f32;
        let a_prev = alpha_prev as f32;
        let pred_x0 = (x - &(eps * (1.0 - a).sqrt())) / a.sqrt();
        pred_x0 * a_prev.sqrt() + eps * (1.0 - a_prev).sqrt()
    }
}

/// Classifier-free guidance: eps_u + g * (eps_c - eps_u)
pub fn guide(cond: &Array4<f32>, uncond: &Array4<f32>, scale: f32) -> Array4<f32> {
    uncond + &((cond - uncond) * scale)
}

/// Foreground with everything outside the mask blacked out, CLIP-normalized at 224px
pub fn clip_input(foreground: &RgbImage, mask: &Mask) -> Array4<f32> {
    let masked = RgbImage::from_fn(foreground.width(), foreground.height(), |x, y| {
        if mask.is_foreground(x, y) {
            *foreground.get_pixel(x, y)
        } else {
            Rgb([0, 0, 0])
        }
    });
    normalize_clip(&masked)
}

fn normalize_clip(img: &RgbImage) -> Array4<f32> {
    let resized = DynamicImage::ImageRgb8(img.clone())
        .resize_exact(CLIP_SIZE, CLIP_SIZE, FilterType::CatmullRom)
        .to_rgb8();

    let side = CLIP_SIZE as usize;
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            input[[0, c, y as usize, x as usize]] = (v - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    input
}

/// Background in [-1, 1] with the bbox region cleared for inpainting
pub fn inpaint_input(background: &RgbImage, bbox: &BoundingBox) -> Array4<f32> {
    let (w, h) = background.dimensions();
    let mut input = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in background.enumerate_pixels() {
        if bbox.contains(x, y) {
            continue;
        }
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
    input
}

/// 1 where a latent cell's centre falls inside the bbox
pub fn latent_bbox_mask(bbox: &BoundingBox, canvas_size: u32) -> Array4<f32> {
    let side = (canvas_size / LATENT_DOWNSCALE) as usize;
    Array4::from_shape_fn((1, 1, side, side), |(_, _, ly, lx)| {
        let cx = lx as u32 * LATENT_DOWNSCALE + LATENT_DOWNSCALE / 2;
        let cy = ly as u32 * LATENT_DOWNSCALE + LATENT_DOWNSCALE / 2;
        if bbox.contains(cx, cy) {
            1.0
        } else {
            0.0
        }
    })
}

/// Gaussian starting latent, drawn from the request's generator
pub fn initial_latent<R: Rng + ?Sized>(n: usize, side: usize, rng: &mut R) -> Array4<f32> {
    Array4::from_shape_simple_fn((n, LATENT_CHANNELS, side, side), || {
        rng.sample::<f32, _>(StandardNormal)
    })
}

/// Repeat a batch-1 array `n` times along the batch axis
fn repeat_batch<D: ndarray::RemoveAxis>(
    single: &ndarray::Array<f32, D>,
    n: usize,
) -> SamplerResult<ndarray::Array<f32, D>> {
    let views = vec![single.view(); n];
    concatenate(Axis(0), &views).map_err(|e| SamplerError::ShapeMismatch {
        expected: format!("{} x {:?}", n, single.shape()),
        actual: e.to_string(),
    })
}

fn to_array4(name: &str, dims: &[i64], data: &[f32]) -> SamplerResult<Array4<f32>> {
    if dims.len() != 4 {
        return Err(SamplerError::ShapeMismatch {
            expected: format!("4-d {}", name),
            actual: format!("{:?}", dims),
        });
    }
    Array4::from_shape_vec(
        (dims[0] as usize, dims[1] as usize, dims[2] as usize, dims[3] as usize),
        data.to_vec(),
    )
    .map_err(|e| SamplerError::ShapeMismatch {
        expected: format!("{:?}", dims),
        actual: e.to_string(),
    })
}

fn to_array3(name: &str, dims: &[i64], data: &[f32]) -> SamplerResult<Array3<f32>> {
    if dims.len() != 3 {
        return Err(SamplerError::ShapeMismatch {
            expected: format!("3-d {}", name),
            actual: format!("{:?}", dims),
        });
    }
    Array3::from_shape_vec(
        (dims[0] as usize, dims[1] as usize, dims[2] as usize),
        data.to_vec(),
    )
    .map_err(|e| SamplerError::ShapeMismatch {
        expected: format!("{:?}", dims),
        actual: e.to_string(),
    })
}

/// Loaded ObjectStitch graphs.
///
/// Sessions sit behind mutexes because `Session::run` needs `&mut`; the
/// sampler adapter already guarantees a single caller at a time.
pub struct ObjectStitchModel {
    conditioner: Mutex<Session>,
    encoder: Mutex<Session>,
    unet: Mutex<Session>,
    decoder: Mutex<Session>,
    schedule: DdimSchedule,
    backend: String,
}

impl ObjectStitchModel {
    pub fn load(model_dir: &Path, forced_backend: Option<&str>) -> anyhow::Result<Self> {
        info!("Loading ObjectStitch graphs from {}", model_dir.display());

        let load = |name: &str| {
            build_session(&model_dir.join(format!("{}.onnx", name)), name, forced_backend)
                .with_context(|| format!("Failed to load {} graph", name))
        };

        let (backend, unet) = load("unet")?;
        let (_, conditioner) = load("conditioner")?;
        let (_, encoder) = load("encoder")?;
        let (_, decoder) = load("decoder")?;

        info!("✓ ObjectStitch ready on {}", backend);
        Ok(Self {
            conditioner: Mutex::new(conditioner),
            encoder: Mutex::new(encoder),
            unet: Mutex::new(unet),
            decoder: Mutex::new(decoder),
            schedule: DdimSchedule::new(),
            backend,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    fn embed(&self, foreground: Array4<f32>) -> SamplerResult<Array3<f32>> {
        let input = Tensor::from_array(foreground)?;
        let mut session = self.conditioner.lock();
        let outputs = session.run(ort::inputs!["foreground" => input])?;
        let (shape, data) = outputs["embedding"].try_extract_tensor::<f32>()?;
        to_array3("embedding", shape.as_ref(), data)
    }

    fn encode(&self, image: Array4<f32>) -> SamplerResult<Array4<f32>> {
        let input = Tensor::from_array(image)?;
        let mut session = self.encoder.lock();
        let outputs = session.run(ort::inputs!["image" => input])?;
        let (shape, data) = outputs["latent"].try_extract_tensor::<f32>()?;
        Ok(to_array4("latent", shape.as_ref(), data)? * LATENT_SCALE)
    }

    fn decode(&self, latent: &Array4<f32>) -> SamplerResult<Array4<f32>> {
        let input = Tensor::from_array(latent / LATENT_SCALE)?;
        let mut session = self.decoder.lock();
        let outputs = session.run(ort::inputs!["latent" => input])?;
        let (shape, data) = outputs["image"].try_extract_tensor::<f32>()?;
        to_array4("image", shape.as_ref(), data)
    }

    fn predict_noise(
        &self,
        sample: &Array4<f32>,
        timestep: usize,
        context: &Array3<f32>,
        bbox: &Array2<f32>,
    ) -> SamplerResult<Array4<f32>> {
        let n = sample.dim().0;
        let sample = Tensor::from_array(sample.clone())?;
        let timestep = Tensor::from_array(Array1::<i64>::from_elem(n, timestep as i64))?;
        let context = Tensor::from_array(context.clone())?;
        let bbox = Tensor::from_array(bbox.clone())?;

        let mut session = self.unet.lock();
        let outputs = session.run(ort::inputs![
            "sample" => sample,
            "timestep" => timestep,
            "context" => context,
            "bbox" => bbox,
        ])?;
        let (shape, data) = outputs["noise_pred"].try_extract_tensor::<f32>()?;
        to_array4("noise_pred", shape.as_ref(), data)
    }
}

impl Sampler for ObjectStitchModel {
    fn name(&self) -> &str {
        "objectstitch"
    }

    fn sample(
        &self,
        batch: &ConditioningBatch,
        params: &SampleParams,
        rng: &mut StdRng,
        cancel: &CancelFlag,
    ) -> SamplerResult<SampleTensor> {
        let n = params.batch_size;
        let side = batch.canvas_size();
        let latent_side = (side / LATENT_DOWNSCALE) as usize;

        // Conditioning is computed once and shared across the batch
        let cond = repeat_batch(&self.embed(clip_input(&batch.foreground, &batch.mask))?, n)?;
        let blank = RgbImage::new(side, side);
        let uncond = repeat_batch(&self.embed(normalize_clip(&blank))?, n)?;

        let inpaint = repeat_batch(&self.encode(inpaint_input(&batch.background, &batch.bbox))?, n)?;
        let region = repeat_batch(&latent_bbox_mask(&batch.bbox, side), n)?;
        let bbox_row = Array1::from(batch.bbox.normalized(side).to_vec());
        let bbox = repeat_batch(&bbox_row.insert_axis(Axis(0)), n)?;
        cancel.check()?;

        let mut x = initial_latent(n, latent_side, rng);

        let plan = self.schedule.plan(params.step_count);
        debug!("DDIM over {} timesteps, guidance {}", plan.len(), params.guidance_scale);

        for (t, alpha, alpha_prev) in plan {
            cancel.check()?;
            let sample = concatenate(Axis(1), &[x.view(), inpaint.view(), region.view()])
                .map_err(|e| SamplerError::ShapeMismatch {
                    expected: format!("({}, 9, {}, {})", n, latent_side, latent_side),
                    actual: e.to_string(),
                })?;

            let eps_c = self.predict_noise(&sample, t, &cond, &bbox)?;
            let eps_u = self.predict_noise(&sample, t, &uncond, &bbox)?;
            let eps = guide(&eps_c, &eps_u, params.guidance_scale);

            x = DdimSchedule::step(&x, &eps, alpha, alpha_prev);
        }

        cancel.check()?;
        self.decode(&x)
    }
}
