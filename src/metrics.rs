//! Process-wide metrics registry. Lifecycle: init once at start, updated
//! via atomics from the cycle driver, flushed on shutdown, exposed as
//! Prometheus text exposition on `GET /metrics`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::audit::Mode;

#[derive(Debug, Default)]
struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum: Mutex<f64>,
    count: AtomicU64,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds.iter().map(|b| (*b, AtomicU64::new(0))).collect(),
            sum: Mutex::new(0.0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        for (bound, counter) in &self.buckets {
            if value <= *bound {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.sum.lock().unwrap() += value;
    }
}

/// The metrics named in `spec.md` §6, backed by lock-free counters where
/// possible and a small mutex only for the histogram sum.
pub struct Metrics {
    files_deleted_total: Mutex<HashMap<&'static str, AtomicU64>>,
    bytes_freed_total: Mutex<HashMap<&'static str, AtomicU64>>,
    errors_total: Mutex<HashMap<&'static str, AtomicU64>>,
    cleanup_duration_seconds: Histogram,
    cycle_total: AtomicU64,
    cleanup_last_mode: AtomicU64,
    candidates_considered_total: AtomicU64,
    used_percent: Mutex<HashMap<String, f64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            files_deleted_total: Mutex::new(HashMap::new()),
            bytes_freed_total: Mutex::new(HashMap::new()),
            errors_total: Mutex::new(HashMap::new()),
            cleanup_duration_seconds: Histogram::new(&[0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 600.0]),
            cycle_total: AtomicU64::new(0),
            cleanup_last_mode: AtomicU64::new(0),
            candidates_considered_total: AtomicU64::new(0),
            used_percent: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_deletion(&self, mode: Mode, bytes: u64) {
        self.files_deleted_total
            .lock()
            .unwrap()
            .entry(mode.as_str())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.bytes_freed_total
            .lock()
            .unwrap()
            .entry(mode.as_str())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: &'static str) {
        self.errors_total
            .lock()
            .unwrap()
            .entry(kind)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle(&self, mode: Mode, duration_seconds: f64) {
        self.cycle_total.fetch_add(1, Ordering::Relaxed);
        self.cleanup_last_mode.store(mode.gauge_value() as u64, Ordering::Relaxed);
        self.cleanup_duration_seconds.observe(duration_seconds);
    }

    pub fn add_candidates_considered(&self, n: u64) {
        self.candidates_considered_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_used_percent(&self, root: &str, value: f64) {
        self.used_percent.lock().unwrap().insert(root.to_string(), value);
    }

    /// Render the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP storagesage_files_deleted_total Files deleted, by mode\n");
        out.push_str("# TYPE storagesage_files_deleted_total counter\n");
        for (mode, count) in self.files_deleted_total.lock().unwrap().iter() {
            out.push_str(&format!(
                "storagesage_files_deleted_total{{mode=\"{mode}\"}} {}\n",
                count.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP storagesage_bytes_freed_total Bytes freed, by mode\n");
        out.push_str("# TYPE storagesage_bytes_freed_total counter\n");
        for (mode, count) in self.bytes_freed_total.lock().unwrap().iter() {
            out.push_str(&format!(
                "storagesage_bytes_freed_total{{mode=\"{mode}\"}} {}\n",
                count.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP storagesage_errors_total Errors, by kind\n");
        out.push_str("# TYPE storagesage_errors_total counter\n");
        for (kind, count) in self.errors_total.lock().unwrap().iter() {
            out.push_str(&format!(
                "storagesage_errors_total{{kind=\"{kind}\"}} {}\n",
                count.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP storagesage_cleanup_duration_seconds Cycle duration\n");
        out.push_str("# TYPE storagesage_cleanup_duration_seconds histogram\n");
        let mut cumulative = 0u64;
        for (bound, counter) in &self.cleanup_duration_seconds.buckets {
            cumulative = cumulative.max(counter.load(Ordering::Relaxed));
            out.push_str(&format!(
                "storagesage_cleanup_duration_seconds_bucket{{le=\"{bound}\"}} {cumulative}\n"
            ));
        }
        out.push_str(&format!(
            "storagesage_cleanup_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.cleanup_duration_seconds.count.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "storagesage_cleanup_duration_seconds_sum {}\n",
            *self.cleanup_duration_seconds.sum.lock().unwrap()
        ));
        out.push_str(&format!(
            "storagesage_cleanup_duration_seconds_count {}\n",
            self.cleanup_duration_seconds.count.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP storagesage_cycle_total Cleanup cycles run\n");
        out.push_str("# TYPE storagesage_cycle_total counter\n");
        out.push_str(&format!(
            "storagesage_cycle_total {}\n",
            self.cycle_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP storagesage_cleanup_last_mode Mode of the most recent cycle (0=AGE,1=DISK_USAGE,2=STACK,3=DRY_RUN)\n");
        out.push_str("# TYPE storagesage_cleanup_last_mode gauge\n");
        out.push_str(&format!(
            "storagesage_cleanup_last_mode {}\n",
            self.cleanup_last_mode.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP storagesage_candidates_considered_total Candidates evaluated by the policy engine\n");
        out.push_str("# TYPE storagesage_candidates_considered_total counter\n");
        out.push_str(&format!(
            "storagesage_candidates_considered_total {}\n",
            self.candidates_considered_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP storagesage_used_percent Used-percent of the filesystem backing a scan root\n");
        out.push_str("# TYPE storagesage_used_percent gauge\n");
        for (root, value) in self.used_percent.lock().unwrap().iter() {
            out.push_str(&format!("storagesage_used_percent{{root=\"{root}\"}} {value}\n"));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_counters() {
        let m = Metrics::new();
        m.record_deletion(Mode::Age, 4096);
        m.record_error("scan_io");
        m.record_cycle(Mode::Age, 1.5);
        m.set_used_percent("/data", 42.0);

        let text = m.render();
        assert!(text.contains("storagesage_files_deleted_total{mode=\"AGE\"} 1"));
        assert!(text.contains("storagesage_bytes_freed_total{mode=\"AGE\"} 4096"));
        assert!(text.contains("storagesage_errors_total{kind=\"scan_io\"} 1"));
        assert!(text.contains("storagesage_cycle_total 1"));
        assert!(text.contains("storagesage_cleanup_last_mode 0"));
        assert!(text.contains("storagesage_used_percent{root=\"/data\"} 42"));
    }
}
