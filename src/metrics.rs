#![forbid(unsafe_code)]

// Service metrics — lock-free AtomicU64 counters/gauges and Prometheus-compatible histograms.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in milliseconds for internal storage).
/// Admin-side room operations are slow, so the scale runs from 10s to 1h.
const BUCKET_BOUNDS_MS: [u64; 7] = [
    10_000,    // 10s
    30_000,    // 30s
    60_000,    // 1min
    300_000,   // 5min
    600_000,   // 10min
    1_200_000, // 20min
    3_600_000, // 1h
];

const BUCKET_LABELS: [&str; 7] = ["10", "30", "60", "300", "600", "1200", "3600"];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// Cumulative bucket counters — bucket[i] counts observations <= BUCKET_BOUNDS_MS[i]
    buckets: [AtomicU64; 7],
    /// +Inf bucket (total count)
    count: AtomicU64,
    /// Sum of all observations in milliseconds
    sum_ms: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }

    /// Record a duration observation.
    pub fn observe(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.sum_ms.fetch_add(ms, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    /// Render in Prometheus text exposition format.
    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_ms = self.sum_ms.load(Relaxed);
        // Convert milliseconds to seconds with 3 decimal places
        let _ = writeln!(out, "{name}_sum {}.{:03}", sum_ms / 1_000, sum_ms % 1_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Service-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServiceMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    leaves_total: AtomicU64,
    deletes_total: AtomicU64,
    cleanups_requested_total: AtomicU64,

    // Gauges — current queue depths
    leave_queue_depth: AtomicU64,
    delete_queue_depth: AtomicU64,
    error_queue_depth: AtomicU64,

    // Histograms
    leave_duration: Histogram,
    delete_duration: Histogram,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                leaves_total: AtomicU64::new(0),
                deletes_total: AtomicU64::new(0),
                cleanups_requested_total: AtomicU64::new(0),
                leave_queue_depth: AtomicU64::new(0),
                delete_queue_depth: AtomicU64::new(0),
                error_queue_depth: AtomicU64::new(0),
                leave_duration: Histogram::new(),
                delete_duration: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_deletes(&self) {
        self.inner.deletes_total.fetch_add(1, Relaxed);
    }

    pub fn inc_cleanups_requested(&self) {
        self.inner.cleanups_requested_total.fetch_add(1, Relaxed);
    }

    pub fn deletes_total(&self) -> u64 {
        self.inner.deletes_total.load(Relaxed)
    }

    // --- Gauges ---

    pub fn set_queue_depths(&self, leave: u64, delete: u64, error: u64) {
        self.inner.leave_queue_depth.store(leave, Relaxed);
        self.inner.delete_queue_depth.store(delete, Relaxed);
        self.inner.error_queue_depth.store(error, Relaxed);
    }

    // --- Histograms ---

    pub fn observe_leave(&self, duration: Duration) {
        self.inner.leave_duration.observe(duration);
    }

    pub fn observe_delete(&self, duration: Duration) {
        self.inner.delete_duration.observe(duration);
    }

    // --- Prometheus rendering ---

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        let i = &self.inner;

        // Counters
        render_counter(&mut out, "sweepserv_leave_count", "Number of room leaves performed", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "sweepserv_delete_count", "Number of room deletions performed", i.deletes_total.load(Relaxed));
        render_counter(&mut out, "sweepserv_cleanups_requested_total", "Number of bulk cleanup requests received", i.cleanups_requested_total.load(Relaxed));

        // Gauges
        render_gauge(&mut out, "sweepserv_leave_queue_length", "Current length of the leave queue", i.leave_queue_depth.load(Relaxed));
        render_gauge(&mut out, "sweepserv_delete_queue_length", "Current length of the delete queue", i.delete_queue_depth.load(Relaxed));
        render_gauge(&mut out, "sweepserv_error_queue_length", "Current length of the error queue", i.error_queue_depth.load(Relaxed));

        // Histograms
        i.leave_duration.render(
            "sweepserv_leave_seconds",
            "Time taken to leave a room in seconds",
            &mut out,
        );
        i.delete_duration.render(
            "sweepserv_delete_seconds",
            "Time taken to delete a room in seconds",
            &mut out,
        );

        out
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let h = Histogram::new();
        h.observe(Duration::from_secs(5));
        h.observe(Duration::from_secs(45));
        h.observe(Duration::from_secs(7200));

        let mut out = String::new();
        h.render("test_seconds", "test", &mut out);
        assert!(out.contains("test_seconds_bucket{le=\"10\"} 1"));
        assert!(out.contains("test_seconds_bucket{le=\"60\"} 2"));
        assert!(out.contains("test_seconds_bucket{le=\"3600\"} 2"));
        assert!(out.contains("test_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(out.contains("test_seconds_count 3"));
    }

    #[test]
    fn test_render_includes_queue_gauges() {
        let metrics = ServiceMetrics::new();
        metrics.set_queue_depths(3, 1, 0);
        metrics.inc_leaves();
        let out = metrics.render_prometheus();
        assert!(out.contains("sweepserv_leave_queue_length 3"));
        assert!(out.contains("sweepserv_delete_queue_length 1"));
        assert!(out.contains("sweepserv_error_queue_length 0"));
        assert!(out.contains("sweepserv_leave_count 1"));
    }
}
