use crate::snapshot::{MetricsSnapshot, RouteMetrics};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Bins cover 1µs..1s in six decades of ten bins each, plus a catch-all
/// for anything slower.
const HISTOGRAM_BINS: usize = 61;

/// Log-scale latency histogram.
///
/// Recording is lock-free: a sample maps to a bin by decade and decile,
/// counters use relaxed atomics. Percentiles are estimated by scanning the
/// bins, which is fine for a read path that only serves `__metrics`.
struct LatencyHistogram {
    bins: [AtomicU64; HISTOGRAM_BINS],
    total_latency_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::bin_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Maps a latency to its bin: decade index picks the block of ten,
    /// the leading digit picks the bin within it.
    fn bin_for(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10() as usize;
        if decade >= 6 {
            return HISTOGRAM_BINS - 1;
        }
        let leading = (latency_us / 10u64.pow(decade as u32)) as usize;
        decade * 10 + (leading - 1).min(9)
    }

    /// Lower edge of a bin, used as the percentile estimate.
    fn bin_floor(bin: usize) -> u64 {
        if bin >= HISTOGRAM_BINS - 1 {
            return 1_000_000;
        }
        let decade = bin / 10;
        let leading = (bin % 10) as u64 + 1;
        leading * 10u64.pow(decade as u32)
    }

    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let target = (total * percentile).div_ceil(100).max(1);
        let mut seen = 0u64;
        for (bin, counter) in self.bins.iter().enumerate() {
            seen += counter.load(Ordering::Relaxed);
            if seen >= target {
                return Self::bin_floor(bin);
            }
        }
        Self::bin_floor(HISTOGRAM_BINS - 1)
    }

    fn average(&self) -> u64 {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / samples
    }
}

struct RouteRecorder {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    histogram: LatencyHistogram,
}

impl RouteRecorder {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            histogram: LatencyHistogram::new(),
        }
    }
}

/// Thread-safe metrics storage shared between the request path and the
/// `__metrics` endpoint.
pub struct MetricsRegistry {
    started: Instant,
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    duplicates: AtomicU64,
    routes: RwLock<HashMap<String, Arc<RouteRecorder>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Records one completed request for a route.
    pub fn record_call(&self, route: &str, latency_us: u64, success: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let recorder = self.recorder_for(route);
        recorder.calls.fetch_add(1, Ordering::Relaxed);
        if success {
            recorder.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            recorder.failures.fetch_add(1, Ordering::Relaxed);
        }
        recorder.histogram.record(latency_us);
    }

    /// Records a request rejected as a duplicate. Duplicates are not
    /// counted as route calls.
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let routes = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let route_metrics = routes
            .iter()
            .map(|(route, rec)| {
                (
                    route.clone(),
                    RouteMetrics {
                        call_count: rec.calls.load(Ordering::Relaxed),
                        success_count: rec.successes.load(Ordering::Relaxed),
                        failure_count: rec.failures.load(Ordering::Relaxed),
                        avg_latency_us: rec.histogram.average(),
                        p50_latency_us: rec.histogram.estimate_percentile(50),
                        p95_latency_us: rec.histogram.estimate_percentile(95),
                        p99_latency_us: rec.histogram.estimate_percentile(99),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.successes.load(Ordering::Relaxed),
            failed_requests: self.failures.load(Ordering::Relaxed),
            rejected_duplicates: self.duplicates.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            routes: route_metrics,
        }
    }

    fn recorder_for(&self, route: &str) -> Arc<RouteRecorder> {
        {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            if let Some(recorder) = routes.get(route) {
                return Arc::clone(recorder);
            }
        }
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            routes
                .entry(route.to_string())
                .or_insert_with(|| Arc::new(RouteRecorder::new())),
        )
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
