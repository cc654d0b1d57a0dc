//! `GET /api/metrics/summary`, `GET /api/metrics/timeseries`, and
//! `GET /api/ws/stats`, plus the request-timing middleware that feeds
//! [`MetricsStore`].

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use super::{envelope, AppState, Authed};
use crate::error::HubResult;

const TOP_ENDPOINTS: usize = 10;

/// Request-timing middleware: records every response through the shared
/// [`MetricsStore`], keyed by the normalized path. Runs for every route on
/// the router, including the unauthenticated media proxy, mirroring the
/// teacher's blanket instrumentation middleware.
pub async fn record_request(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    state.metrics.record(&path, response.status().as_u16(), elapsed_ms);
    response
}

pub async fn summary(State(state): State<Arc<AppState>>, Authed(_): Authed) -> HubResult<Response> {
    let summary = state.metrics.summary();
    let percentiles = state.metrics.percentiles();
    let top = state.metrics.top_endpoints(TOP_ENDPOINTS);
    Ok(envelope::ok(serde_json::json!({
        "summary": summary,
        "percentiles": percentiles,
        "top_endpoints": top,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct TimeSeriesParams {
    #[serde(default = "default_range")]
    pub range: String,
}

fn default_range() -> String {
    "1h".to_string()
}

/// Parses the `range` query param into `(since_secs, max_points)`, matching
/// the reference dashboard's five presets.
fn range_window(range: &str) -> (i64, usize) {
    match range {
        "5m" => (5 * 60, 60),
        "15m" => (15 * 60, 90),
        "1h" => (60 * 60, 120),
        "6h" => (6 * 60 * 60, 180),
        "24h" => (24 * 60 * 60, 288),
        _ => (60 * 60, 120),
    }
}

pub async fn timeseries(
    State(state): State<Arc<AppState>>,
    Authed(_): Authed,
    Query(params): Query<TimeSeriesParams>,
) -> HubResult<Response> {
    let (since_secs, max_points) = range_window(&params.range);
    let now = chrono::Utc::now().timestamp();
    let points = state.metrics.query_time_series(since_secs, now, max_points);
    Ok(envelope::ok(serde_json::json!({ "points": points })).into_response())
}

pub async fn ws_stats(State(state): State<Arc<AppState>>, Authed(_): Authed) -> HubResult<Response> {
    let ids = state.registry.ids();
    let stats: Vec<serde_json::Value> = ids
        .iter()
        .filter_map(|id| {
            let conn = state.registry.get(id)?;
            let s = conn.stats();
            Some(serde_json::json!({
                "agent_id": id,
                "hostname": conn.hostname(),
                "version": conn.version(),
                "last_seen": conn.last_seen(),
                "ping_count": s.ping_count,
                "pong_count": s.pong_count,
                "failure_count": s.failure_count,
                "avg_latency_ms": s.avg_latency_ms,
                "messages_sent": s.messages_sent,
                "messages_recv": s.messages_recv,
            }))
        })
        .collect();
    Ok(envelope::ok(serde_json::json!({
        "connected": stats.len(),
        "connections": stats,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_presets_map_to_expected_windows() {
        assert_eq!(range_window("5m"), (300, 60));
        assert_eq!(range_window("24h"), (86400, 288));
        assert_eq!(range_window("bogus"), (3600, 120));
    }

    #[test]
    fn normalize_path_is_exposed_for_the_middleware() {
        assert_eq!(crate::metrics::normalize_path("/api/device/5"), "/api/device/:id");
    }
}
