//! Background task that samples [`MetricsStore`] into the time-series ring
//! every 30 seconds, mirroring the reference `collectLoop` goroutine.

use std::sync::Arc;
use std::time::Duration;

use super::{MetricsStore, TimeSeriesPoint};

const TICK: Duration = Duration::from_secs(30);

pub async fn run(store: Arc<MetricsStore>, mut now: impl FnMut() -> i64 + Send + 'static) {
    let mut last_success = 0i64;
    let mut last_failed = 0i64;
    let mut last_total_ms = 0i64;
    let mut interval = tokio::time::interval(TICK);

    loop {
        interval.tick().await;
        let (success, failed, total_ms) = store.raw_counts();
        let delta_success = success - last_success;
        let delta_failed = failed - last_failed;
        let delta_total_ms = total_ms - last_total_ms;
        let delta_total = delta_success + delta_failed;

        let avg_resp_ms = if delta_total > 0 {
            (delta_total_ms as f64 / delta_total as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };

        store.push_time_series_point(TimeSeriesPoint {
            timestamp: now(),
            api_success: delta_success as f64,
            api_failed: delta_failed as f64,
            avg_resp_ms,
        });

        tracing::debug!(delta_success, delta_failed, avg_resp_ms, "metrics sample tick");

        last_success = success;
        last_failed = failed;
        last_total_ms = total_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[tokio::test(start_paused = true)]
    async fn samples_deltas_since_previous_tick() {
        let store = Arc::new(MetricsStore::new(100, 10));
        let clock = Arc::new(AtomicI64::new(0));
        let clock_for_sampler = clock.clone();

        store.record("/api/x", 200, 10.0);

        let handle = tokio::spawn(run(store.clone(), move || {
            clock_for_sampler.fetch_add(1, Ordering::Relaxed)
        }));

        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        let points = store.query_time_series(1000, clock.load(Ordering::Relaxed) + 1, 0);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].api_success, 1.0);

        handle.abort();
    }
}
