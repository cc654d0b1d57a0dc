//! JSON envelope helpers shared by the HTTP handlers, mirroring the
//! `{code, message, data}` shape `error::HubError`'s `IntoResponse` already
//! produces for failures.

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
pub struct Ok<T: Serialize> {
    pub code: i32,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Response {
    Json(Ok { code: 0, data }).into_response()
}

pub fn ok_value(data: Value) -> Response {
    Json(Ok { code: 0, data }).into_response()
}
