//! Axum HTTP surface: RPC submission, the media proxy, and metrics
//! read-out. The agent WebSocket upgrade itself is deliberately NOT routed
//! through here — see `hub::mod` for why.

pub mod envelope;
pub mod routes_media;
pub mod routes_metrics;
pub mod routes_rpc;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::binding::BindingStore;
use crate::config::Config;
use crate::hub::connection::Connection;
use crate::hub::registry::Registry;
use crate::jwt::{Claims, JwtVerifier};
use crate::mediator::Mediator;
use crate::metrics::MetricsStore;
use crate::store::AgentRepository;

pub struct AppState {
    pub config: Arc<Config>,
    pub jwt: Arc<JwtVerifier>,
    pub mediator: Arc<Mediator>,
    pub metrics: Arc<MetricsStore>,
    pub binding: Arc<BindingStore>,
    pub agents: Arc<dyn AgentRepository>,
    pub registry: Arc<Registry<Connection>>,
    pub media_client: reqwest::Client,
}

/// Extracts and verifies the bearer JWT on routes that require it. Routes
/// that omit this extractor (the media proxy) are intentionally anonymous
/// per §6.
pub struct Authed(pub Claims);

impl FromRequestParts<Arc<AppState>> for Authed {
    type Rejection = crate::error::HubError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = crate::jwt::bearer_token(header).ok_or(crate::error::HubError::Unauthorized)?;
        let claims = state.jwt.verify(token)?;
        Ok(Authed(claims))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let metrics_state = state.clone();

    Router::new()
        .route("/api/remoteCall", post(routes_rpc::remote_call))
        .route("/api/video/play", get(routes_media::play))
        .route("/api/metrics/summary", get(routes_metrics::summary))
        .route("/api/metrics/timeseries", get(routes_metrics::timeseries))
        .route("/api/ws/stats", get(routes_metrics::ws_stats))
        .layer(axum::middleware::from_fn_with_state(metrics_state, routes_metrics::record_request))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}
