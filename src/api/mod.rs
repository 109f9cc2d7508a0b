//! HTTP surfaces
//!
//! - [`as_server`]: ingress RPCs called by network-servers
//! - [`join_server`]: Backend Interfaces join endpoint
//! - [`operator`]: operator REST API with server-sent event streams

pub mod as_server;
pub mod join_server;
pub mod operator;

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::Identity;
use crate::error::Error;

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: status.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::UnknownDevice(_)
        | Error::NoActivation(_)
        | Error::NoDeviceKeys(_)
        | Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidArgument(_)
        | Error::InvalidFrame(_)
        | Error::CodecFailed(_)
        | Error::MicFailed => StatusCode::BAD_REQUEST,
        Error::PermissionDenied => StatusCode::FORBIDDEN,
        Error::AlreadyExists(_)
        | Error::DevNonceReused { .. }
        | Error::RejoinCounterReplay { .. }
        | Error::FCntReplay { .. }
        | Error::DuplicateFrame { .. }
        | Error::ServiceProfileMismatch { .. }
        | Error::JoinNonceExhausted(_)
        | Error::CounterExhausted => StatusCode::CONFLICT,
        Error::NetworkServerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::new(status_for(&err), err.to_string())
    }
}

/// Bearer tokens of the operator API.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, Identity>,
}

impl TokenTable {
    pub fn new(tokens: impl IntoIterator<Item = (String, Identity)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Identity behind the `Authorization: Bearer ...` header.
    pub fn identify(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "unknown bearer token"))
    }
}

/// Serve `router` until the listener fails.
pub async fn serve(name: &str, listener: TcpListener, router: Router) -> anyhow::Result<()> {
    info!("{} listening on {}", name, listener.local_addr()?);
    axum::serve(listener, router.layer(TraceLayer::new_for_http())).await?;
    Ok(())
}

/// Serve `router` on an ephemeral local port; returns the base URL.
#[cfg(test)]
pub(crate) async fn spawn_test_server(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
