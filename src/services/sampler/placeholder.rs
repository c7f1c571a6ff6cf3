// Stand-in sampler: flat-colour images, no model required.
//
// Used as the deterministic test double and as a latency-injecting fake for
// load tests. Each sample's red channel is tagged with its batch index so
// ordering can be verified end to end.

use ndarray::Array4;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::{CancelFlag, SampleParams, SampleTensor, Sampler};
use crate::core::errors::{SamplerError, SamplerResult};
use crate::core::types::BoundingBox;
use crate::phases::compose::ConditioningBatch;

const SLEEP_SLICE: Duration = Duration::from_millis(5);

pub struct PlaceholderSampler {
    delay: Duration,
    calls: AtomicUsize,
    cancelled: AtomicUsize,
    fail_next: AtomicBool,
    intervals: Mutex<Vec<(Instant, Instant)>>,
    last_params: Mutex<Option<SampleParams>>,
    last_bbox: Mutex<Option<BoundingBox>>,
}

impl PlaceholderSampler {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Sleep this long inside every call, checking for cancellation
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            intervals: Mutex::new(Vec::new()),
            last_params: Mutex::new(None),
            last_bbox: Mutex::new(None),
        }
    }

    /// Make the next call fail as if the device ran out of memory
    pub fn fail_next_with_exhaustion(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of times `sample` was entered
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cancelled_calls(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Entry/exit instants of every completed call
    pub fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.intervals.lock().clone()
    }

    pub fn last_params(&self) -> Option<SampleParams> {
        *self.last_params.lock()
    }

    /// Bounding box of the most recent conditioning batch
    pub fn last_bbox(&self) -> Option<BoundingBox> {
        *self.last_bbox.lock()
    }

    /// Red level used to tag sample `index`, recoverable after 8-bit encoding
    pub fn tag_level(index: usize) -> u8 {
        ((index * 16) % 256) as u8
    }

    fn wait(&self, cancel: &CancelFlag) -> SamplerResult<()> {
        let deadline = Instant::now() + self.delay;
        loop {
            if let Err(e) = cancel.check() {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn render(&self, batch: &ConditioningBatch, n: usize, rng: &mut StdRng) -> SampleTensor {
        let side = batch.canvas_size() as usize;
        // Bin centres survive the truncating 8-bit conversion unchanged
        let to_unit = |level: u8| (f32::from(level) + 0.5) / 255.0 * 2.0 - 1.0;

        let colours: Vec<[f32; 3]> = (0..n)
            .map(|i| {
                [
                    to_unit(Self::tag_level(i)),
                    to_unit(rng.random()),
                    to_unit(rng.random()),
                ]
            })
            .collect();

        Array4::from_shape_fn((n, 3, side, side), |(i, c, _, _)| colours[i][c])
    }
}

impl Default for PlaceholderSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for PlaceholderSampler {
    fn name(&self) -> &str {
        "placeholder"
    }

    fn sample(
        &self,
        batch: &ConditioningBatch,
        params: &SampleParams,
        rng: &mut StdRng,
        cancel: &CancelFlag,
    ) -> SamplerResult<SampleTensor> {
        let entered = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock() = Some(*params);
        *self.last_bbox.lock() = Some(batch.bbox);

        let outcome = self.wait(cancel).and_then(|_| {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                Err(SamplerError::from_backend("CUDA out of memory (injected)"))
            } else {
                Ok(self.render(batch, params.batch_size, rng))
            }
        });

        self.intervals.lock().push((entered, Instant::now()));
        outcome
    }
}
