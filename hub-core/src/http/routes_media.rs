//! `GET /api/video/play`: the streaming media proxy. Anonymous per §6 — the
//! URL itself is the capability.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use url::Url;

use super::AppState;
use crate::error::{HubError, HubResult};
use crate::media_proxy;

#[derive(Debug, Deserialize)]
pub struct PlayParams {
    pub url: String,
    pub key: Option<String>,
}

pub async fn play(
    State(state): State<Arc<AppState>>,
    method: Method,
    Query(params): Query<PlayParams>,
    headers: HeaderMap,
) -> HubResult<Response> {
    let url = Url::parse(&params.url).map_err(|e| HubError::InvalidRequest(format!("bad url: {e}")))?;
    media_proxy::check_url_policy(&url).await?;

    let decrypt_key = params
        .key
        .as_deref()
        .map(|k| k.parse::<u64>())
        .transpose()
        .map_err(|_| HubError::InvalidRequest("key must be a decimal u64".into()))?;

    let range = headers.get(axum::http::header::RANGE).and_then(|v| v.to_str().ok());
    let method_is_head = method == Method::HEAD;

    let (upstream, body) = media_proxy::fetch(&state.media_client, &url, range, method_is_head, decrypt_key).await?;

    let mut response_headers = upstream.headers;
    response_headers.insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        axum::http::HeaderValue::from_static("*"),
    );
    response_headers.insert(axum::http::header::ACCEPT_RANGES, axum::http::HeaderValue::from_static("bytes"));

    let status = StatusCode::from_u16(upstream.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = response_headers;

    let response = match body {
        Some(reader) => builder
            .body(Body::from_stream(ReaderStream::new(reader)))
            .map_err(|e| HubError::Internal(e.to_string()))?,
        None => builder.body(Body::empty()).map_err(|e| HubError::Internal(e.to_string()))?,
    };

    Ok(response.into_response())
}
