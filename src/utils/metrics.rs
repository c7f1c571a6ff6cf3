use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing samples kept per series; older samples are dropped first
const SAMPLE_WINDOW: usize = 1024;

/// Process-wide metrics collector.
///
/// Tracks request outcomes, sampler contention and timings.
/// Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Request Metrics
    requests_total: AtomicUsize,
    requests_succeeded: AtomicUsize,
    requests_failed: AtomicUsize,
    failures_by_kind: DashMap<&'static str, AtomicUsize>,
    images_generated: AtomicUsize,
    request_duration_ms: RwLock<SampleWindow>,

    // Sampler Metrics
    sampler_queue_depth: AtomicUsize,
    sampler_runs: AtomicUsize,
    sampler_wait_ms: RwLock<SampleWindow>,
    sampler_run_ms: RwLock<SampleWindow>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                requests_succeeded: AtomicUsize::new(0),
                requests_failed: AtomicUsize::new(0),
                failures_by_kind: DashMap::new(),
                images_generated: AtomicUsize::new(0),
                request_duration_ms: RwLock::new(SampleWindow::new(SAMPLE_WINDOW)),
                sampler_queue_depth: AtomicUsize::new(0),
                sampler_runs: AtomicUsize::new(0),
                sampler_wait_ms: RwLock::new(SampleWindow::new(SAMPLE_WINDOW)),
                sampler_run_ms: RwLock::new(SampleWindow::new(SAMPLE_WINDOW)),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_request_started(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_succeeded(&self, images: usize, duration: Duration) {
        self.inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        self.inner.images_generated.fetch_add(images, Ordering::Relaxed);
        self.inner.request_duration_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_request_failed(&self, kind: &'static str) {
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .failures_by_kind
            .entry(kind)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Sampler Metrics
    pub fn sampler_enqueued(&self) {
        self.inner.sampler_queue_depth.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sampler_dequeued(&self) {
        self.inner.sampler_queue_depth.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn sampler_queue_depth(&self) -> usize {
        self.inner.sampler_queue_depth.load(Ordering::SeqCst)
    }

    pub fn record_sampling(&self, waited: Duration, ran: Duration) {
        self.inner.sampler_runs.fetch_add(1, Ordering::Relaxed);
        self.inner.sampler_wait_ms.write().push(waited.as_millis() as u64);
        self.inner.sampler_run_ms.write().push(ran.as_millis() as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (request_avg, request_p95) = {
            let durations = self.inner.request_duration_ms.read();
            (durations.avg(), durations.percentile(0.95))
        };
        let wait_avg = self.inner.sampler_wait_ms.read().avg();
        let run_avg = self.inner.sampler_run_ms.read().avg();

        let mut failures_by_kind: Vec<(String, usize)> = self
            .inner
            .failures_by_kind
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect();
        failures_by_kind.sort();

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            failures_by_kind,
            images_generated: self.inner.images_generated.load(Ordering::Relaxed),
            request_avg_ms: request_avg,
            request_p95_ms: request_p95,
            sampler_runs: self.inner.sampler_runs.load(Ordering::Relaxed),
            sampler_queue_depth: self.sampler_queue_depth(),
            sampler_wait_avg_ms: wait_avg,
            sampler_run_avg_ms: run_avg,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut failures = String::new();
        for (kind, count) in &snapshot.failures_by_kind {
            failures.push_str(&format!(
                "infuse_requests_failed_total{{kind=\"{}\"}} {}\n",
                kind, count
            ));
        }

        format!(
            r#"# HELP infuse_requests_total Compositing requests received
# TYPE infuse_requests_total counter
infuse_requests_total {}

# HELP infuse_requests_succeeded_total Compositing requests that returned images
# TYPE infuse_requests_succeeded_total counter
infuse_requests_succeeded_total {}

# HELP infuse_requests_failed_total Failed compositing requests by error kind
# TYPE infuse_requests_failed_total counter
{}
# HELP infuse_images_generated_total Composite images returned to clients
# TYPE infuse_images_generated_total counter
infuse_images_generated_total {}

# HELP infuse_request_avg_ms Average successful request latency in milliseconds
# TYPE infuse_request_avg_ms gauge
infuse_request_avg_ms {}

# HELP infuse_sampler_queue_depth Requests waiting for the sampler
# TYPE infuse_sampler_queue_depth gauge
infuse_sampler_queue_depth {}

# HELP infuse_sampler_wait_avg_ms Average wait for exclusive sampler access
# TYPE infuse_sampler_wait_avg_ms gauge
infuse_sampler_wait_avg_ms {}

# HELP infuse_sampler_run_avg_ms Average sampling duration
# TYPE infuse_sampler_run_avg_ms gauge
infuse_sampler_run_avg_ms {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {}
"#,
            snapshot.requests_total,
            snapshot.requests_succeeded,
            failures,
            snapshot.images_generated,
            snapshot.request_avg_ms,
            snapshot.sampler_queue_depth,
            snapshot.sampler_wait_avg_ms,
            snapshot.sampler_run_avg_ms,
            snapshot.uptime_seconds,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub requests_succeeded: usize,
    pub requests_failed: usize,
    pub failures_by_kind: Vec<(String, usize)>,
    pub images_generated: usize,
    pub request_avg_ms: u64,
    pub request_p95_ms: u64,
    pub sampler_runs: usize,
    pub sampler_queue_depth: usize,
    pub sampler_wait_avg_ms: u64,
    pub sampler_run_avg_ms: u64,
    pub uptime_seconds: u64,
}

/// Most recent timing samples with a running sum
struct SampleWindow {
    samples: VecDeque<u64>,
    capacity: usize,
    sum: u64,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0,
        }
    }

    fn push(&mut self, value: u64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn avg(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.sum / self.samples.len() as u64
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p) as usize;
        sorted[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_request_started();
        metrics.record_request_started();
        metrics.record_request_succeeded(3, Duration::from_millis(100));
        metrics.record_request_failed("invalid_transform");
        metrics.record_sampling(Duration::from_millis(10), Duration::from_millis(90));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_succeeded, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.images_generated, 3);
        assert_eq!(snapshot.failures_by_kind, vec![("invalid_transform".to_string(), 1)]);
        assert_eq!(snapshot.sampler_runs, 1);
        assert_eq!(snapshot.sampler_run_avg_ms, 90);
    }

    #[test]
    fn test_timing_history_is_bounded() {
        let metrics = Metrics::new();
        let total = SAMPLE_WINDOW + 500;
        for i in 0..total {
            let ms = if i < 500 { 10_000 } else { 20 };
            metrics.record_request_succeeded(1, Duration::from_millis(ms));
            metrics.record_sampling(Duration::from_millis(ms), Duration::from_millis(ms));
        }

        assert_eq!(metrics.inner.request_duration_ms.read().len(), SAMPLE_WINDOW);
        assert_eq!(metrics.inner.sampler_wait_ms.read().len(), SAMPLE_WINDOW);
        assert_eq!(metrics.inner.sampler_run_ms.read().len(), SAMPLE_WINDOW);

        // The slow early samples have aged out of the window
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_avg_ms, 20);
        assert_eq!(snapshot.request_p95_ms, 20);
        assert_eq!(snapshot.sampler_run_avg_ms, 20);
        assert_eq!(snapshot.sampler_runs, total);
        assert_eq!(snapshot.images_generated, total);
    }

    #[test]
    fn test_queue_depth() {
        let metrics = Metrics::new();
        metrics.sampler_enqueued();
        metrics.sampler_enqueued();
        metrics.sampler_dequeued();
        assert_eq!(metrics.sampler_queue_depth(), 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_request_started();
        metrics.record_request_failed("sampler_exhausted");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("infuse_requests_total 1"));
        assert!(prometheus.contains("infuse_requests_failed_total{kind=\"sampler_exhausted\"} 1"));
    }
}
