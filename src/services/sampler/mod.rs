// Sampler capability and the exclusive-access adapter around it

pub mod objectstitch;
#[cfg(any(test, feature = "test-util"))]
pub mod placeholder;
pub mod random;

use ndarray::Array4;
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{SamplerError, SamplerResult};
use crate::phases::compose::ConditioningBatch;
use crate::utils::Metrics;

pub use objectstitch::ObjectStitchModel;
#[cfg(any(test, feature = "test-util"))]
pub use placeholder::PlaceholderSampler;
pub use random::{RandomSource, SeedPolicy};

/// Decoded samples in NCHW layout, values nominally in [-1, 1]
pub type SampleTensor = Array4<f32>;

/// Per-call sampling parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleParams {
    pub step_count: u32,
    pub guidance_scale: f32,
    pub batch_size: usize,
}

/// Raised when the caller stops waiting for a sampling call
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Bail out of a sampling loop once cancelled
    pub fn check(&self) -> SamplerResult<()> {
        if self.is_cancelled() {
            Err(SamplerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Cancels the flag when dropped unless disarmed first
struct CancelOnDrop {
    flag: CancelFlag,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: CancelFlag) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}

/// Keeps the queue-depth gauge honest even if the waiting future is dropped
struct QueueSlot<'a>(&'a Metrics);

impl<'a> QueueSlot<'a> {
    fn enter(metrics: &'a Metrics) -> Self {
        metrics.sampler_enqueued();
        Self(metrics)
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.sampler_dequeued();
    }
}

/// A generative model that turns conditioning into images.
///
/// Implementations may assume they are never called concurrently: the
/// [`SamplerAdapter`] serializes every call in the process.
pub trait Sampler: Send + Sync {
    fn name(&self) -> &str;

    /// Produce exactly `params.batch_size` samples at canvas resolution
    fn sample(
        &self,
        batch: &ConditioningBatch,
        params: &SampleParams,
        rng: &mut StdRng,
        cancel: &CancelFlag,
    ) -> SamplerResult<SampleTensor>;
}

/// Sole entry point to the sampler.
///
/// Holds a single permit: at most one sampling call runs at a time and
/// waiters are served in arrival order. The permit moves into the blocking
/// task, so it is returned when sampling actually stops, on success, error,
/// panic or cancellation.
pub struct SamplerAdapter {
    sampler: Arc<dyn Sampler>,
    random: Arc<dyn RandomSource>,
    guidance_scale: f32,
    gate: Arc<Semaphore>,
    metrics: Metrics,
}

impl SamplerAdapter {
    pub fn new(
        sampler: Arc<dyn Sampler>,
        random: Arc<dyn RandomSource>,
        guidance_scale: f32,
        metrics: Metrics,
    ) -> Self {
        info!(
            "Sampler '{}' ready (guidance {}, seed {})",
            sampler.name(),
            guidance_scale,
            random.describe()
        );
        Self {
            sampler,
            random,
            guidance_scale,
            gate: Arc::new(Semaphore::new(1)),
            metrics,
        }
    }

    pub fn sampler_name(&self) -> &str {
        self.sampler.name()
    }

    /// True while a sampling call holds the device
    pub fn is_busy(&self) -> bool {
        self.gate.available_permits() == 0
    }

    #[instrument(skip(self, batch), fields(batch_size = batch.batch_count, steps = step_count))]
    pub async fn sample(
        &self,
        batch: Arc<ConditioningBatch>,
        step_count: u32,
    ) -> SamplerResult<SampleTensor> {
        let params = SampleParams {
            step_count,
            guidance_scale: self.guidance_scale,
            batch_size: batch.batch_count,
        };

        let queued_at = Instant::now();
        let permit = {
            let _slot = QueueSlot::enter(&self.metrics);
            Arc::clone(&self.gate)
                .acquire_owned()
                .await
                .map_err(|_| SamplerError::Unavailable)?
        };
        let waited = queued_at.elapsed();
        debug!("Acquired sampler after {:.1}ms", waited.as_secs_f64() * 1000.0);

        let cancel = CancelFlag::new();
        let mut on_drop = CancelOnDrop::new(cancel.clone());
        let sampler = Arc::clone(&self.sampler);
        let mut rng = self.random.request_rng();

        let started = Instant::now();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            sampler.sample(&batch, &params, &mut rng, &cancel)
        })
        .await;
        on_drop.disarm();
        let ran = started.elapsed();

        let samples = match joined {
            Ok(result) => result?,
            Err(e) => {
                warn!("Sampling task aborted: {}", e);
                return Err(SamplerError::Backend(format!("sampling task failed: {}", e)));
            }
        };

        if samples.dim().0 != params.batch_size {
            return Err(SamplerError::ShapeMismatch {
                expected: format!("{} samples", params.batch_size),
                actual: format!("{} samples", samples.dim().0),
            });
        }

        self.metrics.record_sampling(waited, ran);
        info!(
            "Sampled {} images in {:.2}s (queued {:.2}s)",
            params.batch_size,
            ran.as_secs_f64(),
            waited.as_secs_f64()
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BoundingBox;
    use crate::phases::mask::Mask;
    use image::{GrayImage, RgbImage};
    use std::time::Duration;

    fn tiny_batch(batch_count: usize) -> Arc<ConditioningBatch> {
        Arc::new(ConditioningBatch {
            background: RgbImage::new(16, 16),
            foreground: RgbImage::new(16, 16),
            bbox: BoundingBox { x1: 4, y1: 4, x2: 12, y2: 12 },
            mask: Mask::binarize(&GrayImage::new(16, 16)),
            batch_count,
        })
    }

    fn adapter(sampler: Arc<PlaceholderSampler>) -> SamplerAdapter {
        SamplerAdapter::new(sampler, Arc::new(SeedPolicy::Fixed(100)), 5.0, Metrics::new())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_calls_never_overlap() {
        let stub = Arc::new(PlaceholderSampler::with_delay(Duration::from_millis(30)));
        let adapter = Arc::new(adapter(Arc::clone(&stub)));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let adapter = Arc::clone(&adapter);
                tokio::spawn(async move { adapter.sample(tiny_batch(1), 10).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut intervals = stub.intervals();
        assert_eq!(intervals.len(), 6);
        intervals.sort_by_key(|(start, _)| *start);
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "sampler calls overlapped");
        }
    }

    #[tokio::test]
    async fn test_failure_releases_gate() {
        let stub = Arc::new(PlaceholderSampler::new());
        let adapter = adapter(Arc::clone(&stub));

        stub.fail_next_with_exhaustion();
        let err = adapter.sample(tiny_batch(2), 10).await.unwrap_err();
        assert!(matches!(err, SamplerError::Exhausted(_)));
        assert!(!adapter.is_busy());

        let samples = adapter.sample(tiny_batch(2), 10).await.unwrap();
        assert_eq!(samples.dim(), (2, 3, 16, 16));
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn test_params_forwarded() {
        let stub = Arc::new(PlaceholderSampler::new());
        let adapter = adapter(Arc::clone(&stub));
        adapter.sample(tiny_batch(3), 25).await.unwrap();

        let params = stub.last_params().unwrap();
        assert_eq!(params.step_count, 25);
        assert_eq!(params.guidance_scale, 5.0);
        assert_eq!(params.batch_size, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_caller_cancels_sampling() {
        let stub = Arc::new(PlaceholderSampler::with_delay(Duration::from_secs(5)));
        let adapter = Arc::new(adapter(Arc::clone(&stub)));

        let pending = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.sample(tiny_batch(1), 10).await })
        };
        while stub.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pending.abort();

        // The stub notices cancellation between its sleep slices and gives the gate back
        let started = Instant::now();
        while adapter.is_busy() {
            assert!(started.elapsed() < Duration::from_secs(2), "gate not released");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stub.cancelled_calls(), 1);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(flag.check().is_ok());
        {
            let _guard = CancelOnDrop::new(flag.clone());
        }
        assert!(matches!(flag.check(), Err(SamplerError::Cancelled)));

        let flag = CancelFlag::new();
        let mut guard = CancelOnDrop::new(flag.clone());
        guard.disarm();
        drop(guard);
        assert!(!flag.is_cancelled());
    }
}
