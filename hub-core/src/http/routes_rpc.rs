//! `POST /api/remoteCall`: the HTTP front door to the Call Mediator.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::{envelope, AppState, Authed};
use crate::error::HubResult;
use crate::mediator::CallRequest;

#[derive(Debug, Deserialize)]
pub struct RemoteCallBody {
    pub client_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub async fn remote_call(
    State(state): State<Arc<AppState>>,
    Authed(claims): Authed,
    Json(body): Json<RemoteCallBody>,
) -> HubResult<Response> {
    let agents = state.agents.clone();
    let user_id = claims.user_id;

    let outcome = state
        .mediator
        .call(
            CallRequest {
                user_id,
                agent_id: body.client_id,
                action: body.action,
                data: body.data,
            },
            move |user_id| {
                agents
                    .first_online_for_user(user_id)
                    .map_err(|e| crate::error::HubError::Internal(e.to_string()))
            },
        )
        .await?;

    Ok(envelope::ok_value(serde_json::json!({
        "success": outcome.success,
        "data": outcome.data,
        "error": outcome.error,
    }))
    .into_response())
}
