use std::collections::HashMap;
use std::mem;
use std::sync::Mutex;
use std::time::Duration;

/// Per-tag counters and duration samples for one handler pipeline.
///
/// `min_input_count`/`max_input_count` are the rolling extremes of the
/// pipeline's input depth observed at each completed dispatch. All counters
/// are cumulative until the next destructive [`MetricsRegistry::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobHandlerMetrics {
    pub min_input_count: usize,
    pub max_input_count: usize,
    pub processed: u64,
    /// Terminal drops: retry exhaustion and poison payloads.
    pub failures: u64,
    /// Requeues after a failed handling attempt.
    pub retries: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub process_time_samples: Vec<Duration>,
}

impl JobHandlerMetrics {
    fn observe_depth(&mut self, depth: usize, first: bool) {
        if first {
            self.min_input_count = depth;
            self.max_input_count = depth;
        } else {
            self.min_input_count = self.min_input_count.min(depth);
            self.max_input_count = self.max_input_count.max(depth);
        }
    }
}

/// Process-wide metrics store, drained periodically by an external telemetry
/// collector.
pub struct MetricsRegistry {
    inner: Mutex<HashMap<String, JobHandlerMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn update<F>(&self, tag: &str, depth: usize, apply: F)
    where
        F: FnOnce(&mut JobHandlerMetrics),
    {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let first = !map.contains_key(tag);
        let entry = map.entry(tag.to_string()).or_default();
        entry.observe_depth(depth, first);
        apply(entry);
    }

    pub fn record_processed(&self, tag: &str, depth: usize, elapsed: Duration) {
        self.update(tag, depth, |m| {
            m.processed += 1;
            m.process_time_samples.push(elapsed);
        });
    }

    pub fn record_retry(&self, tag: &str, depth: usize, cancelled: bool) {
        self.update(tag, depth, |m| {
            m.retries += 1;
            if cancelled {
                m.cancelled += 1;
            }
        });
    }

    pub fn record_dropped(&self, tag: &str, depth: usize, cancelled: bool) {
        self.update(tag, depth, |m| {
            m.failures += 1;
            if cancelled {
                m.cancelled += 1;
            }
        });
    }

    pub fn record_expired(&self, tag: &str, depth: usize) {
        self.update(tag, depth, |m| m.expired += 1);
    }

    /// Atomically take and reset everything accumulated so far.
    pub fn snapshot(&self) -> HashMap<String, JobHandlerMetrics> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        mem::take(&mut *map)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile over duration samples using linear interpolation between ranks
/// (zero-based rank `p/100 * (n - 1)`). Returns `None` for an empty set.
///
/// This is what the external telemetry collaborator applies to
/// `process_time_samples` before each reset.
pub fn percentile(samples: &[Duration], pct: f64) -> Option<Duration> {
    if samples.is_empty() || !(0.0..=100.0).contains(&pct) {
        return None;
    }

    let mut sorted = samples.to_vec();
    sorted.sort();

    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }

    let frac = rank - lo as f64;
    let lo_s = sorted[lo].as_secs_f64();
    let hi_s = sorted[hi].as_secs_f64();
    Some(Duration::from_secs_f64(lo_s + (hi_s - lo_s) * frac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_interpolate_between_ranks() {
        let samples: Vec<Duration> = (1..=10).map(|i| Duration::from_millis(i * 10)).collect();

        let as_ms = |d: Option<Duration>| d.unwrap().as_secs_f64() * 1000.0;

        assert!((as_ms(percentile(&samples, 50.0)) - 55.0).abs() < 1e-6);
        assert!((as_ms(percentile(&samples, 90.0)) - 91.0).abs() < 1e-6);
        assert!((as_ms(percentile(&samples, 99.0)) - 99.1).abs() < 1e-6);
        assert_eq!(percentile(&samples, 0.0), Some(Duration::from_millis(10)));
        assert_eq!(percentile(&samples, 100.0), Some(Duration::from_millis(100)));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn snapshot_is_destructive() {
        let registry = MetricsRegistry::new();
        registry.record_processed("a", 3, Duration::from_millis(5));
        registry.record_retry("a", 1, false);
        registry.record_dropped("a", 0, true);
        registry.record_expired("b", 0);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);

        let a = &snapshot["a"];
        assert_eq!(a.processed, 1);
        assert_eq!(a.retries, 1);
        assert_eq!(a.failures, 1);
        assert_eq!(a.cancelled, 1);
        assert_eq!(a.min_input_count, 0);
        assert_eq!(a.max_input_count, 3);
        assert_eq!(a.process_time_samples.len(), 1);
        assert_eq!(snapshot["b"].expired, 1);

        assert!(registry.snapshot().is_empty());
    }
}
