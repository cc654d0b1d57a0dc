//! Process-wide HTTP telemetry: rolling counters, a fixed-size response-time
//! reservoir, per-endpoint aggregates, and a sampled time series.
//!
//! Grounded on the reference `MetricsStore` (`metrics_middleware.go`): same
//! reservoir-then-sort percentile strategy, same path normalisation rule,
//! same 30s sampler cadence. Counters are plain atomics so `record` never
//! blocks a concurrent reader; the reservoir, endpoint map, and time-series
//! ring each carry their own lock so a slow sort in one view can't stall
//! writers touching another.

pub mod sampler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub success_rate_pct: f64,
    pub avg_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub path: String,
    pub calls: i64,
    pub errors: i64,
    pub avg_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesPoint {
    pub timestamp: i64,
    pub api_success: f64,
    pub api_failed: f64,
    pub avg_resp_ms: f64,
}

#[derive(Default)]
struct EndpointStat {
    calls: AtomicI64,
    errors: AtomicI64,
    total_ms: AtomicI64,
}

struct Reservoir {
    samples: Vec<f64>,
    index: usize,
    full: bool,
}

impl Reservoir {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            index: 0,
            full: false,
        }
    }

    fn push(&mut self, ms: f64) {
        self.samples[self.index] = ms;
        self.index += 1;
        if self.index >= self.samples.len() {
            self.index = 0;
            self.full = true;
        }
    }

    fn live_copy(&self) -> Vec<f64> {
        if self.full {
            self.samples.clone()
        } else {
            self.samples[..self.index].to_vec()
        }
    }
}

pub struct MetricsStore {
    total_calls: AtomicI64,
    success_calls: AtomicI64,
    failed_calls: AtomicI64,
    reservoir: RwLock<Reservoir>,
    endpoints: RwLock<HashMap<String, EndpointStat>>,
    ring: RwLock<TimeSeriesRing>,
}

struct TimeSeriesRing {
    points: Vec<TimeSeriesPoint>,
    max_len: usize,
}

impl MetricsStore {
    pub fn new(reservoir_size: usize, ring_capacity: usize) -> Self {
        Self {
            total_calls: AtomicI64::new(0),
            success_calls: AtomicI64::new(0),
            failed_calls: AtomicI64::new(0),
            reservoir: RwLock::new(Reservoir::new(reservoir_size)),
            endpoints: RwLock::new(HashMap::new()),
            ring: RwLock::new(TimeSeriesRing {
                points: Vec::with_capacity(ring_capacity),
                max_len: ring_capacity,
            }),
        }
    }

    pub fn record(&self, path: &str, status: u16, elapsed_ms: f64) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if (200..400).contains(&status) {
            self.success_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        self.reservoir.write().push(elapsed_ms);

        let normalized = normalize_path(path);
        {
            let endpoints = self.endpoints.read();
            if let Some(stat) = endpoints.get(&normalized) {
                stat.calls.fetch_add(1, Ordering::Relaxed);
                stat.total_ms.fetch_add(elapsed_ms as i64, Ordering::Relaxed);
                if status >= 400 {
                    stat.errors.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        }
        let mut endpoints = self.endpoints.write();
        let stat = endpoints.entry(normalized).or_default();
        stat.calls.fetch_add(1, Ordering::Relaxed);
        stat.total_ms.fetch_add(elapsed_ms as i64, Ordering::Relaxed);
        if status >= 400 {
            stat.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn summary(&self) -> Summary {
        let total = self.total_calls.load(Ordering::Relaxed);
        let success = self.success_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        let success_rate_pct = if total > 0 {
            success as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Summary {
            total,
            success,
            failed,
            success_rate_pct,
            avg_ms: self.avg_response_ms(),
        }
    }

    fn avg_response_ms(&self) -> f64 {
        let data = self.reservoir.read().live_copy();
        if data.is_empty() {
            return 0.0;
        }
        let sum: f64 = data.iter().sum();
        round2(sum / data.len() as f64)
    }

    pub fn percentiles(&self) -> Percentiles {
        let mut data = self.reservoir.read().live_copy();
        if data.is_empty() {
            return Percentiles::default();
        }
        data.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Percentiles {
            p50: percentile(&data, 50),
            p95: percentile(&data, 95),
            p99: percentile(&data, 99),
        }
    }

    pub fn top_endpoints(&self, k: usize) -> Vec<EndpointInfo> {
        let endpoints = self.endpoints.read();
        let mut list: Vec<EndpointInfo> = endpoints
            .iter()
            .map(|(path, stat)| {
                let calls = stat.calls.load(Ordering::Relaxed);
                let total_ms = stat.total_ms.load(Ordering::Relaxed);
                let avg_ms = if calls > 0 {
                    round2(total_ms as f64 / calls as f64)
                } else {
                    0.0
                };
                EndpointInfo {
                    path: path.clone(),
                    calls,
                    errors: stat.errors.load(Ordering::Relaxed),
                    avg_ms,
                }
            })
            .collect();
        list.sort_by(|a, b| b.calls.cmp(&a.calls));
        list.truncate(k);
        list
    }

    pub fn query_time_series(&self, since_secs: i64, now: i64, max_points: usize) -> Vec<TimeSeriesPoint> {
        let ring = self.ring.read();
        let cutoff = now - since_secs;
        let filtered: Vec<TimeSeriesPoint> = ring
            .points
            .iter()
            .filter(|p| p.timestamp > cutoff)
            .cloned()
            .collect();

        if max_points > 0 && filtered.len() > max_points {
            let step = (filtered.len() / max_points).max(1);
            filtered.into_iter().step_by(step).collect()
        } else {
            filtered
        }
    }

    /// Snapshot of `(success, failed, total_ms_across_endpoints)`, used by
    /// the background sampler to compute deltas between ticks.
    pub(crate) fn raw_counts(&self) -> (i64, i64, i64) {
        let success = self.success_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        let total_ms: i64 = self
            .endpoints
            .read()
            .values()
            .map(|s| s.total_ms.load(Ordering::Relaxed))
            .sum();
        (success, failed, total_ms)
    }

    pub(crate) fn push_time_series_point(&self, point: TimeSeriesPoint) {
        let mut ring = self.ring.write();
        if ring.points.len() >= ring.max_len {
            ring.points.remove(0);
        }
        ring.points.push(point);
    }
}

fn percentile(sorted: &[f64], p: u32) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let idx = ((p as f64 / 100.0 * n as f64).ceil() as i64 - 1).clamp(0, n as i64 - 1);
    sorted[idx as usize]
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Replaces any purely-numeric segment, or any segment of 32+ hex/`-`
/// characters (UUIDs, device fingerprints), with `:id`. Idempotent: running
/// it twice on an already-normalised path is a no-op.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| if is_id_segment(seg) { ":id" } else { seg })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_id_segment(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    if s.len() >= 32 && s.bytes().all(|b| b.is_ascii_hexdigit() || b == b'-') {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_replaces_numeric_and_hex_segments() {
        assert_eq!(normalize_path("/api/admin/user/5"), "/api/admin/user/:id");
        assert_eq!(
            normalize_path("/api/device/3fa85f6457174562b3fc2c963f66afa6-abcd"),
            "/api/device/:id"
        );
        assert_eq!(normalize_path("/api/metrics/summary"), "/api/metrics/summary");
    }

    #[test]
    fn normalize_path_is_idempotent() {
        let once = normalize_path("/api/admin/user/5");
        let twice = normalize_path(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn record_updates_counters_and_classifies_by_status() {
        let store = MetricsStore::new(100, 10);
        store.record("/api/x", 200, 10.0);
        store.record("/api/x", 500, 20.0);
        let s = store.summary();
        assert_eq!(s.total, 2);
        assert_eq!(s.success, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.success_rate_pct, 50.0);
    }

    #[test]
    fn percentiles_are_zero_on_empty_reservoir() {
        let store = MetricsStore::new(100, 10);
        let p = store.percentiles();
        assert_eq!((p.p50, p.p95, p.p99), (0.0, 0.0, 0.0));
    }

    #[test]
    fn percentiles_match_reference_formula_on_known_population() {
        let store = MetricsStore::new(100, 10);
        for ms in 1..=100 {
            store.record("/api/x", 200, ms as f64);
        }
        let p = store.percentiles();
        assert_eq!(p.p50, 50.0);
        assert_eq!(p.p95, 95.0);
        assert_eq!(p.p99, 99.0);
    }

    #[test]
    fn reservoir_wraps_once_full() {
        let store = MetricsStore::new(4, 10);
        for ms in [1.0, 2.0, 3.0, 4.0, 5.0] {
            store.record("/api/x", 200, ms);
        }
        // capacity 4, fifth write wraps to slot 0 overwriting the "1.0" sample
        let p = store.percentiles();
        assert!(p.p99 >= 4.0);
    }

    #[test]
    fn top_endpoints_sorts_by_call_count_descending() {
        let store = MetricsStore::new(100, 10);
        for _ in 0..5 {
            store.record("/api/busy", 200, 1.0);
        }
        store.record("/api/quiet", 200, 1.0);
        let top = store.top_endpoints(10);
        assert_eq!(top[0].path, "/api/busy");
        assert_eq!(top[0].calls, 5);
    }

    #[test]
    fn query_time_series_filters_and_downsamples() {
        let store = MetricsStore::new(10, 100);
        for i in 0..10 {
            store.push_time_series_point(TimeSeriesPoint {
                timestamp: i,
                api_success: 1.0,
                api_failed: 0.0,
                avg_resp_ms: 5.0,
            });
        }
        let all = store.query_time_series(1000, 20, 0);
        assert_eq!(all.len(), 10);
        let sampled = store.query_time_series(1000, 20, 3);
        assert!(sampled.len() <= 3);
        let recent = store.query_time_series(3, 9, 0);
        assert!(recent.iter().all(|p| p.timestamp > 6));
    }

    #[test]
    fn ring_drops_oldest_point_when_full() {
        let store = MetricsStore::new(10, 2);
        for i in 0..3 {
            store.push_time_series_point(TimeSeriesPoint {
                timestamp: i,
                api_success: 0.0,
                api_failed: 0.0,
                avg_resp_ms: 0.0,
            });
        }
        let points = store.query_time_series(1000, 10, 0);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, 1);
    }
}
