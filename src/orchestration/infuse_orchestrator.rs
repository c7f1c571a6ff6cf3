// Infuse Orchestrator: runs one compositing request end to end

use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{InfuseError, InfuseResult};
use crate::core::types::{InfuseRequest, SampleResult};
use crate::phases::bbox::BboxCalculator;
use crate::phases::compose::{rotate_foreground, BatchComposer};
use crate::phases::encode::ResultEncoder;
use crate::phases::mask::MaskExtractor;
use crate::phases::transform::TransformResolver;
use crate::services::sampler::{RandomSource, Sampler, SamplerAdapter};
use crate::utils::image_ops::load_image_from_memory_async;
use crate::utils::Metrics;

/// Sequences resolver, geometry, composer, sampler and encoder.
///
/// Every stage except the sampler is stateless and runs concurrently across
/// requests. Any failure aborts the request; there are no partial results.
pub struct InfuseOrchestrator {
    config: Arc<Config>,
    resolver: TransformResolver,
    bbox: BboxCalculator,
    masks: MaskExtractor,
    composer: BatchComposer,
    adapter: SamplerAdapter,
    encoder: ResultEncoder,
    metrics: Metrics,
}

impl InfuseOrchestrator {
    pub fn new(
        config: Arc<Config>,
        sampler: Arc<dyn Sampler>,
        random: Arc<dyn RandomSource>,
        metrics: Metrics,
    ) -> Self {
        let side = config.canvas_size();
        let adapter =
            SamplerAdapter::new(sampler, random, config.guidance_scale(), metrics.clone());

        info!(
            "✓ Pipeline ready (canvas {}px, offsets x{}, bbox {:?}, max batch {})",
            side,
            config.geometry.coordinate_scale.factor(),
            config.geometry.bbox_policy,
            config.max_batch_count()
        );

        Self {
            resolver: TransformResolver::new(side, config.geometry.coordinate_scale),
            bbox: BboxCalculator::new(side, config.geometry.bbox_policy),
            masks: MaskExtractor::new(side),
            composer: BatchComposer::new(side, config.max_batch_count()),
            encoder: ResultEncoder::new(side),
            adapter,
            metrics,
            config,
        }
    }

    pub fn sampler_name(&self) -> &str {
        self.adapter.sampler_name()
    }

    pub fn sampler_busy(&self) -> bool {
        self.adapter.is_busy()
    }

    pub fn canvas_size(&self) -> u32 {
        self.config.canvas_size()
    }

    /// Process one compositing request.
    ///
    /// # Workflow:
    /// 1. Resolve the transform and validate batch/step counts (no decoding yet)
    /// 2. Decode the three uploads concurrently
    /// 3. Rotate the foreground and extract the mask in parallel, then derive the bbox
    /// 4. Compose the conditioning batch
    /// 5. Sample under the exclusive gate
    /// 6. Encode results in sample order
    pub async fn process(&self, request: InfuseRequest) -> InfuseResult<Vec<SampleResult>> {
        let start = Instant::now();
        self.metrics.record_request_started();

        match self.run(request).await {
            Ok(results) => {
                let elapsed = start.elapsed();
                self.metrics.record_request_succeeded(results.len(), elapsed);
                info!(
                    "✓ Request complete: {} images in {:.2}s",
                    results.len(),
                    elapsed.as_secs_f64()
                );
                Ok(results)
            }
            Err(e) => {
                self.metrics.record_request_failed(e.kind());
                match &e {
                    InfuseError::Internal(_) | InfuseError::SamplerExhausted(_) => {
                        error!("Request failed after {:.2}s: {}", start.elapsed().as_secs_f64(), e)
                    }
                    _ => warn!("Request rejected: {}", e),
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, request))]
    async fn run(&self, request: InfuseRequest) -> InfuseResult<Vec<SampleResult>> {
        let raw_transform = request
            .transform
            .as_deref()
            .ok_or_else(|| InfuseError::InvalidTransform("missing transform field".to_string()))?;
        let resolved = self.resolver.resolve_raw(raw_transform)?;
        let batch_count = self.parse_batch_count(request.batch_count.as_deref())?;
        let step_count = self.parse_step_count(request.step_count.as_deref())?;

        info!(
            "Infuse request: transform={:?}, batch_count={}, steps={}",
            resolved, batch_count, step_count
        );

        let (background, front, removed_bg) = tokio::try_join!(
            decode_upload("background_image", request.background_image.as_deref()),
            decode_upload("front_image", request.front_image.as_deref()),
            decode_upload("removed_bg_image", request.removed_bg_image.as_deref()),
        )?;

        let side = self.canvas_size();
        let rotation = resolved.rotation;
        let masks = self.masks.clone();
        let (rotated, mask) = tokio::try_join!(
            blocking(move || rotate_foreground(&front, rotation, side)),
            blocking(move || masks.extract(&removed_bg, rotation)),
        )?;

        let bbox = self.bbox.compute(rotated.rotated_dims, &resolved)?;
        debug!("Placement bbox {:?} from rotated frame {:?}", bbox, rotated.rotated_dims);

        let composer = self.composer.clone();
        let batch = blocking(move || {
            composer.compose(&background, &rotated, bbox, mask, batch_count as i64)
        })
        .await??;

        let samples = self.adapter.sample(Arc::new(batch), step_count).await?;
        self.encoder.encode(&samples).await
    }

    fn parse_batch_count(&self, raw: Option<&str>) -> InfuseResult<usize> {
        let raw = raw
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| InfuseError::MalformedRequest("missing batch_count field".to_string()))?;
        let value: i64 = raw.parse().map_err(|_| {
            InfuseError::MalformedRequest(format!("batch_count must be an integer, got '{}'", raw))
        })?;
        self.composer.check_batch_count(value)
    }

    fn parse_step_count(&self, raw: Option<&str>) -> InfuseResult<u32> {
        let max = self.config.sampler.max_step_count;
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(self.config.sampler.default_step_count);
        };
        let value: i64 = raw.parse().map_err(|_| {
            InfuseError::MalformedRequest(format!("step_count must be an integer, got '{}'", raw))
        })?;
        if value < 1 || value > i64::from(max) {
            return Err(InfuseError::InvalidStepCount { value, max });
        }
        Ok(value as u32)
    }
}

async fn decode_upload(field: &'static str, bytes: Option<&[u8]>) -> InfuseResult<DynamicImage> {
    let bytes = bytes
        .filter(|b| !b.is_empty())
        .ok_or_else(|| InfuseError::ImageDecode {
            field,
            reason: "missing upload".to_string(),
        })?;
    load_image_from_memory_async(bytes)
        .await
        .map_err(|e| InfuseError::ImageDecode {
            field,
            reason: format!("{:#}", e),
        })
}

/// Run CPU-bound image work off the async workers
async fn blocking<T, F>(f: F) -> InfuseResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| InfuseError::Internal(format!("image task failed: {}", e)))
}
