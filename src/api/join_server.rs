//! Join-server endpoint
//!
//! A single `POST /` taking Backend Interfaces messages. Protocol failures are
//! answered with HTTP 200 and a `Result.ResultCode`; malformed JSON gets 400 and
//! only internal failures 500.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use std::sync::Arc;
use tracing::{debug, error};

use super::ApiError;
use crate::join::backend::{JoinAnsPayload, JoinReqPayload, JoinServer};

pub fn routes(server: Arc<JoinServer>) -> Router {
    Router::new()
        .route("/", post(handle))
        .with_state(server)
}

/// POST /
async fn handle(
    State(server): State<Arc<JoinServer>>,
    body: Bytes,
) -> Result<Json<JoinAnsPayload>, ApiError> {
    let req: JoinReqPayload = serde_json::from_slice(&body).map_err(|e| {
        debug!("malformed join-server request: {}", e);
        ApiError::new(StatusCode::BAD_REQUEST, format!("malformed request: {}", e))
    })?;

    match server.handle(req).await {
        Ok(ans) => Ok(Json(ans)),
        Err(e) => {
            error!("join-server request failed: {}", e);
            Err(e.into())
        }
    }
}
