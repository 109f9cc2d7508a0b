//! Operator REST API
//!
//! Every request carries a bearer token mapped to an [`Identity`]; authorization
//! itself happens in [`Operator`]. Frame and event logs are streamed as server-sent
//! events.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{ApiError, TokenTable};
use crate::auth::Identity;
use crate::downlink::{Enqueue, Payload, QueueItem};
use crate::encoding::base64_bytes;
use crate::lorawan::{Aes128Key, DevAddr, Eui64};
use crate::metrics::MetricsSnapshot;
use crate::multicast::MulticastQueueEntry;
use crate::operator::{ActivateDevice, Operator};
use crate::storage::{
    Device, DeviceActivation, DeviceKeys, MulticastGroup, MulticastGroupType,
};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub struct OperatorState {
    pub operator: Operator,
    pub tokens: TokenTable,
}

impl OperatorState {
    fn identify(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        self.tokens.identify(headers)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBody {
    #[serde(default)]
    pub dev_eui: Option<Eui64>,
    pub application_id: i64,
    pub device_profile_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub skip_fcnt_check: bool,
}

impl DeviceBody {
    fn into_device(self, dev_eui: Eui64) -> Device {
        let now = Utc::now();
        Device {
            dev_eui,
            application_id: self.application_id,
            device_profile_id: self.device_profile_id,
            name: self.name,
            description: self.description,
            skip_fcnt_check: self.skip_fcnt_check,
            last_seen_at: None,
            battery: None,
            margin: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysBody {
    pub nwk_key: Aes128Key,
    #[serde(default)]
    pub app_key: Option<Aes128Key>,
}

/// Either raw `data` (base64) or an `object` for the application's encoder.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueBody {
    pub f_port: u8,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default)]
    pub reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub f_cnt: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupBody {
    pub name: String,
    pub service_profile_id: Uuid,
    pub mc_addr: DevAddr,
    pub mc_nwk_s_key: Aes128Key,
    pub mc_app_s_key: Aes128Key,
    #[serde(default)]
    pub f_cnt: u32,
    pub group_type: MulticastGroupType,
    pub dr: u8,
    pub frequency: u32,
    #[serde(default)]
    pub ping_slot_period: u32,
}

impl GroupBody {
    fn into_group(self, id: Uuid) -> MulticastGroup {
        let now = Utc::now();
        MulticastGroup {
            id,
            name: self.name,
            service_profile_id: self.service_profile_id,
            mc_addr: self.mc_addr,
            mc_nwk_s_key: self.mc_nwk_s_key,
            mc_app_s_key: self.mc_app_s_key,
            f_cnt: self.f_cnt,
            group_type: self.group_type,
            dr: self.dr,
            frequency: self.frequency,
            ping_slot_period: self.ping_slot_period,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberBody {
    pub dev_eui: Eui64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastEnqueueBody {
    pub f_port: u8,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

pub fn routes(state: Arc<OperatorState>) -> Router {
    Router::new()
        .route("/api/devices", post(create_device))
        .route(
            "/api/devices/:dev_eui",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/api/devices/:dev_eui/activate", post(activate_device))
        .route("/api/devices/:dev_eui/activation", get(get_activation))
        .route("/api/devices/:dev_eui/keys", get(get_keys).put(update_keys))
        .route(
            "/api/devices/:dev_eui/queue",
            post(enqueue).get(list_queue).delete(flush_queue),
        )
        .route("/api/devices/:dev_eui/frames", get(stream_frame_logs))
        .route("/api/devices/:dev_eui/events", get(stream_event_logs))
        .route("/api/multicast-groups", post(create_group))
        .route(
            "/api/multicast-groups/:id",
            get(get_group).put(update_group).delete(delete_group),
        )
        .route(
            "/api/multicast-groups/:id/devices",
            get(list_group_devices).post(add_group_device),
        )
        .route(
            "/api/multicast-groups/:id/devices/:dev_eui",
            delete(remove_group_device),
        )
        .route(
            "/api/multicast-groups/:id/queue",
            post(enqueue_multicast)
                .get(list_multicast_queue)
                .delete(flush_multicast_queue),
        )
        .route("/api/internal/metrics", get(metrics))
        .with_state(state)
}

fn empty() -> Json<Value> {
    Json(json!({}))
}

/// POST /api/devices
async fn create_device(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Json(body): Json<DeviceBody>,
) -> ApiResult<Device> {
    let identity = state.identify(&headers)?;
    let dev_eui = body
        .dev_eui
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "devEui is required"))?;
    let device = state
        .operator
        .create_device(&identity, body.into_device(dev_eui))
        .await?;
    Ok(Json(device))
}

/// GET /api/devices/:dev_eui
async fn get_device(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
) -> ApiResult<Device> {
    let identity = state.identify(&headers)?;
    Ok(Json(state.operator.get_device(&identity, dev_eui).await?))
}

/// PUT /api/devices/:dev_eui
async fn update_device(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
    Json(body): Json<DeviceBody>,
) -> ApiResult<Device> {
    let identity = state.identify(&headers)?;
    let device = state
        .operator
        .update_device(&identity, body.into_device(dev_eui))
        .await?;
    Ok(Json(device))
}

/// DELETE /api/devices/:dev_eui
async fn delete_device(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
) -> ApiResult<Value> {
    let identity = state.identify(&headers)?;
    state.operator.delete_device(&identity, dev_eui).await?;
    Ok(empty())
}

/// POST /api/devices/:dev_eui/activate
async fn activate_device(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
    Json(mut body): Json<ActivateDevice>,
) -> ApiResult<DeviceActivation> {
    let identity = state.identify(&headers)?;
    body.dev_eui = dev_eui;
    Ok(Json(state.operator.activate_device(&identity, body).await?))
}

/// GET /api/devices/:dev_eui/activation
async fn get_activation(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
) -> ApiResult<DeviceActivation> {
    let identity = state.identify(&headers)?;
    Ok(Json(state.operator.get_activation(&identity, dev_eui).await?))
}

/// GET /api/devices/:dev_eui/keys
async fn get_keys(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
) -> ApiResult<DeviceKeys> {
    let identity = state.identify(&headers)?;
    Ok(Json(state.operator.get_keys(&identity, dev_eui).await?))
}

/// PUT /api/devices/:dev_eui/keys
async fn update_keys(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
    Json(body): Json<KeysBody>,
) -> ApiResult<Value> {
    let identity = state.identify(&headers)?;
    state
        .operator
        .update_keys(&identity, DeviceKeys::new(dev_eui, body.nwk_key, body.app_key))
        .await?;
    Ok(empty())
}

/// POST /api/devices/:dev_eui/queue
async fn enqueue(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<EnqueueResponse> {
    let identity = state.identify(&headers)?;
    let payload = match (body.data, body.object) {
        (Some(data), None) => Payload::Bytes(STANDARD.decode(data.as_bytes()).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("data is not base64: {}", e))
        })?),
        (None, Some(object)) => Payload::Object(object),
        _ => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "exactly one of data or object is required",
            ))
        }
    };
    let f_cnt = state
        .operator
        .enqueue(
            &identity,
            Enqueue {
                dev_eui,
                f_port: body.f_port,
                confirmed: body.confirmed,
                payload,
                reference: body.reference,
            },
        )
        .await?;
    Ok(Json(EnqueueResponse { f_cnt }))
}

/// GET /api/devices/:dev_eui/queue
async fn list_queue(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
) -> ApiResult<Vec<QueueItem>> {
    let identity = state.identify(&headers)?;
    Ok(Json(state.operator.list_queue(&identity, dev_eui).await?))
}

/// DELETE /api/devices/:dev_eui/queue
async fn flush_queue(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
) -> ApiResult<Value> {
    let identity = state.identify(&headers)?;
    let flushed = state.operator.flush_queue(&identity, dev_eui).await?;
    Ok(Json(json!({ "flushed": flushed })))
}

fn sse_events<T: Serialize + Send + 'static>(
    entries: impl Stream<Item = T> + Send + 'static,
    name: fn(&T) -> String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = entries
        .filter_map(move |entry| {
            let event = serde_json::to_string(&entry)
                .ok()
                .map(|data| Event::default().event(name(&entry)).data(data));
            futures::future::ready(event)
        })
        .map(Ok::<Event, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("keep-alive"))
}

/// GET /api/devices/:dev_eui/frames
async fn stream_frame_logs(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let identity = state.identify(&headers)?;
    let frames = state.operator.stream_frame_logs(&identity, dev_eui).await?;
    Ok(sse_events(frames, |_| "frame".to_string()))
}

/// GET /api/devices/:dev_eui/events
async fn stream_event_logs(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(dev_eui): Path<Eui64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let identity = state.identify(&headers)?;
    let events = state.operator.stream_event_logs(&identity, dev_eui).await?;
    Ok(sse_events(events, |e| e.event_type.clone()))
}

/// POST /api/multicast-groups
async fn create_group(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Json(body): Json<GroupBody>,
) -> ApiResult<MulticastGroup> {
    let identity = state.identify(&headers)?;
    let group = state
        .operator
        .create_multicast_group(&identity, body.into_group(Uuid::nil()))
        .await?;
    Ok(Json(group))
}

/// GET /api/multicast-groups/:id
async fn get_group(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<MulticastGroup> {
    let identity = state.identify(&headers)?;
    Ok(Json(state.operator.get_multicast_group(&identity, id).await?))
}

/// PUT /api/multicast-groups/:id
async fn update_group(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<GroupBody>,
) -> ApiResult<MulticastGroup> {
    let identity = state.identify(&headers)?;
    let group = state
        .operator
        .update_multicast_group(&identity, body.into_group(id))
        .await?;
    Ok(Json(group))
}

/// DELETE /api/multicast-groups/:id
async fn delete_group(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    let identity = state.identify(&headers)?;
    state.operator.delete_multicast_group(&identity, id).await?;
    Ok(empty())
}

/// GET /api/multicast-groups/:id/devices
async fn list_group_devices(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Eui64>> {
    let identity = state.identify(&headers)?;
    Ok(Json(
        state
            .operator
            .list_multicast_group_devices(&identity, id)
            .await?,
    ))
}

/// POST /api/multicast-groups/:id/devices
async fn add_group_device(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<MemberBody>,
) -> ApiResult<Value> {
    let identity = state.identify(&headers)?;
    state
        .operator
        .add_device_to_multicast_group(&identity, id, body.dev_eui)
        .await?;
    Ok(empty())
}

/// DELETE /api/multicast-groups/:id/devices/:dev_eui
async fn remove_group_device(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path((id, dev_eui)): Path<(Uuid, Eui64)>,
) -> ApiResult<Value> {
    let identity = state.identify(&headers)?;
    state
        .operator
        .remove_device_from_multicast_group(&identity, id, dev_eui)
        .await?;
    Ok(empty())
}

/// POST /api/multicast-groups/:id/queue
async fn enqueue_multicast(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<MulticastEnqueueBody>,
) -> ApiResult<EnqueueResponse> {
    let identity = state.identify(&headers)?;
    let f_cnt = state
        .operator
        .enqueue_multicast(&identity, id, body.f_port, &body.data)
        .await?;
    Ok(Json(EnqueueResponse { f_cnt }))
}

/// GET /api/multicast-groups/:id/queue
async fn list_multicast_queue(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<MulticastQueueEntry>> {
    let identity = state.identify(&headers)?;
    Ok(Json(state.operator.list_multicast_queue(&identity, id).await?))
}

/// DELETE /api/multicast-groups/:id/queue
async fn flush_multicast_queue(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    let identity = state.identify(&headers)?;
    state.operator.flush_multicast_queue(&identity, id).await?;
    Ok(empty())
}

/// GET /api/internal/metrics
async fn metrics(
    State(state): State<Arc<OperatorState>>,
    headers: HeaderMap,
) -> ApiResult<MetricsSnapshot> {
    let identity = state.identify(&headers)?;
    Ok(Json(state.operator.metrics(&identity).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::spawn_test_server;
    use crate::auth::PolicyAuthorizer;
    use crate::codec::PayloadCodec;
    use crate::context::fixtures::{fixture, Fixture, DEV_EUI};
    use crate::framelog::EventEntry;
    use crate::lorawan::MacVersion;

    const ADMIN: &str = "admin-token";
    const USER: &str = "user-token";

    async fn server() -> (Fixture, String) {
        let fx = fixture(MacVersion::V1_0_3, PayloadCodec::None).await;
        let tokens = TokenTable::new([
            (ADMIN.to_string(), Identity::admin("root")),
            (
                USER.to_string(),
                Identity {
                    subject: "user".into(),
                    applications: vec![2],
                    ..Default::default()
                },
            ),
        ]);
        let mut ctx = fx.ctx.clone();
        ctx.authorizer = Arc::new(PolicyAuthorizer::new(
            fx.store.clone(),
            fx.store.clone(),
            fx.store.clone(),
        ));
        let state = Arc::new(OperatorState {
            operator: Operator::new(ctx),
            tokens,
        });
        let base = spawn_test_server(routes(state)).await;
        (fx, base)
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let (_fx, base) = server().await;
        let resp = reqwest::get(format!("{}/api/devices/{}", base, DEV_EUI))
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn test_device_lifecycle() {
        let (fx, base) = server().await;
        let client = reqwest::Client::new();
        let dev_eui = "0909090909090909";

        let resp = client
            .post(format!("{}/api/devices", base))
            .bearer_auth(ADMIN)
            .json(&json!({
                "devEui": dev_eui,
                "applicationId": 1,
                "deviceProfileId": fx.device_profile_id,
                "name": "sensor"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let device: Device = resp.json().await.unwrap();
        assert_eq!(device.name, "sensor");

        let resp = client
            .get(format!("{}/api/devices/{}", base, dev_eui))
            .bearer_auth(ADMIN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .get(format!("{}/api/devices/{}/activation", base, dev_eui))
            .bearer_auth(ADMIN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .delete(format!("{}/api/devices/{}", base, dev_eui))
            .bearer_auth(ADMIN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(fx.ns.device(dev_eui.parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_activate_then_enqueue() {
        let (fx, base) = server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/devices/{}/activate", base, DEV_EUI))
            .bearer_auth(ADMIN)
            .json(&json!({
                "devAddr": "01020304",
                "fNwkSIntKey": "01020304050607080102030405060708",
                "sNwkSIntKey": "01020304050607080102030405060708",
                "nwkSEncKey": "01020304050607080102030405060708",
                "appSKey": "01020304050607080102030405060708",
                "nFCntDown": 12
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("{}/api/devices/{}/queue", base, DEV_EUI))
            .bearer_auth(ADMIN)
            .json(&json!({"fPort": 10, "data": "AQIDBA==", "reference": "r1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let enqueued: EnqueueResponse = resp.json().await.unwrap();
        assert_eq!(enqueued.f_cnt, 12);
        assert_eq!(fx.ns.device_queue(DEV_EUI)[0].frm_payload, vec![0xa6, 0x9d, 0x43, 0xcf]);

        let resp = client
            .post(format!("{}/api/devices/{}/queue", base, DEV_EUI))
            .bearer_auth(ADMIN)
            .json(&json!({"fPort": 10}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{}/api/devices/{}/queue", base, DEV_EUI))
            .bearer_auth(USER)
            .json(&json!({"fPort": 10, "data": "AQ=="}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
    }

    #[tokio::test]
    async fn test_event_stream() {
        let (fx, base) = server().await;
        let mut resp = reqwest::Client::new()
            .get(format!("{}/api/devices/{}/events", base, DEV_EUI))
            .bearer_auth(ADMIN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        fx.ctx.event_log().publish(
            DEV_EUI,
            EventEntry {
                dev_eui: DEV_EUI,
                event_type: "up".into(),
                payload: json!({"fCnt": 12}),
                published_at: Utc::now(),
            },
        );

        let chunk = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event:"));
        assert!(text.contains("up"));
        assert!(text.contains("\"fCnt\":12"));
    }

    #[tokio::test]
    async fn test_metrics_admin_only() {
        let (_fx, base) = server().await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{}/api/internal/metrics", base))
            .bearer_auth(ADMIN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let resp = client
            .get(format!("{}/api/internal/metrics", base))
            .bearer_auth(USER)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
    }
}
