//! Application-server ingress
//!
//! The RPCs a network-server calls: uplink data, downlink ACKs, errors and
//! proprietary uplinks. Callers are trusted; no identity is checked here.

use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use super::ApiError;
use crate::context::AppContext;
use crate::downlink::{DownlinkAck, DownlinkPipeline};
use crate::uplink::{ProprietaryUplink, UplinkData, UplinkError, UplinkPipeline};

pub struct AsState {
    uplink: UplinkPipeline,
    downlink: DownlinkPipeline,
}

impl AsState {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            uplink: UplinkPipeline::new(ctx.clone()),
            downlink: DownlinkPipeline::new(ctx),
        }
    }
}

pub fn routes(state: Arc<AsState>) -> Router {
    Router::new()
        .route("/api/as/uplink", post(handle_uplink_data))
        .route("/api/as/downlink-ack", post(handle_downlink_ack))
        .route("/api/as/error", post(handle_error))
        .route("/api/as/proprietary", post(handle_proprietary_uplink))
        .with_state(state)
}

/// POST /api/as/uplink
async fn handle_uplink_data(
    State(state): State<Arc<AsState>>,
    Json(req): Json<UplinkData>,
) -> Result<Json<Value>, ApiError> {
    state.uplink.handle_uplink(req).await?;
    Ok(Json(json!({})))
}

/// POST /api/as/downlink-ack
async fn handle_downlink_ack(
    State(state): State<Arc<AsState>>,
    Json(req): Json<DownlinkAck>,
) -> Result<Json<Value>, ApiError> {
    state.downlink.handle_ack(req).await?;
    Ok(Json(json!({})))
}

/// POST /api/as/error
async fn handle_error(
    State(state): State<Arc<AsState>>,
    Json(req): Json<UplinkError>,
) -> Result<Json<Value>, ApiError> {
    state.uplink.handle_error(req).await?;
    Ok(Json(json!({})))
}

/// POST /api/as/proprietary
async fn handle_proprietary_uplink(
    State(state): State<Arc<AsState>>,
    Json(req): Json<ProprietaryUplink>,
) -> Result<Json<Value>, ApiError> {
    state.uplink.handle_proprietary(req).await?;
    Ok(Json(json!({})))
}
