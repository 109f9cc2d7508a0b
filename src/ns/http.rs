//! JSON/HTTP network-server client
//!
//! Every call carries the inventory deadline; the frame-log stream only bounds its
//! establishment. Transport failures and deadlines surface as
//! `NetworkServerUnavailable`; the core never retries on its own.

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::pool::Connector;
use super::*;
use crate::error::Error;
use crate::storage::NetworkServerProfile;

const FRAME_LOG_BUFFER: usize = 64;

/// Per-request deadlines.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub inventory: Duration,
    pub stream: Duration,
}

pub struct HttpConnector {
    timeouts: Timeouts,
}

impl HttpConnector {
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }
}

impl Connector for HttpConnector {
    fn connect(&self, profile: &NetworkServerProfile) -> Result<Arc<dyn NetworkServer>> {
        Ok(Arc::new(HttpNetworkServer::new(profile, self.timeouts)?))
    }
}

pub struct HttpNetworkServer {
    base_url: String,
    http: Client,
    stream_http: Client,
    stream_timeout: Duration,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevAddrResponse {
    dev_addr: DevAddr,
}

fn client_builder(profile: &NetworkServerProfile) -> Result<reqwest::ClientBuilder> {
    let mut builder = Client::builder().use_rustls_tls();
    if !profile.ca_cert.is_empty() {
        let ca = Certificate::from_pem(profile.ca_cert.as_bytes())
            .map_err(|e| Error::Internal(format!("invalid network-server CA certificate: {}", e)))?;
        builder = builder.add_root_certificate(ca);
    }
    if !profile.tls_cert.is_empty() && !profile.tls_key.is_empty() {
        let pem = format!("{}\n{}", profile.tls_cert, profile.tls_key);
        let identity = Identity::from_pem(pem.as_bytes())
            .map_err(|e| Error::Internal(format!("invalid network-server client identity: {}", e)))?;
        builder = builder.identity(identity);
    }
    Ok(builder)
}

fn unavailable(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::NetworkServerUnavailable(format!("deadline exceeded: {}", e))
    } else {
        Error::NetworkServerUnavailable(e.to_string())
    }
}

impl HttpNetworkServer {
    pub fn new(profile: &NetworkServerProfile, timeouts: Timeouts) -> Result<Self> {
        let http = client_builder(profile)?
            .timeout(timeouts.inventory)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build network-server client: {}", e)))?;
        let stream_http = client_builder(profile)?
            .connect_timeout(timeouts.stream)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build network-server client: {}", e)))?;

        let base_url = profile.server.trim_end_matches('/').to_string();
        debug!("network-server client for {}", base_url);

        Ok(Self {
            base_url,
            http,
            stream_http,
            stream_timeout: timeouts.stream,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/api{}", self.base_url, path))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await.map_err(unavailable)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => Error::NotFound(body),
            StatusCode::CONFLICT => Error::AlreadyExists(body),
            StatusCode::BAD_REQUEST => Error::InvalidArgument(body),
            _ => Error::NetworkServerUnavailable(format!("status {}: {}", status, body)),
        })
    }

    async fn call(&self, req: RequestBuilder) -> Result<()> {
        self.send(req).await.map(|_| ())
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| Error::NetworkServerUnavailable(format!("invalid response: {}", e)))
    }
}

#[async_trait]
impl NetworkServer for HttpNetworkServer {
    async fn create_device(&self, device: &NsDevice) -> Result<()> {
        self.call(self.request(Method::POST, "/devices").json(device))
            .await
    }

    async fn update_device(&self, device: &NsDevice) -> Result<()> {
        let path = format!("/devices/{}", device.dev_eui);
        self.call(self.request(Method::PUT, &path).json(device)).await
    }

    async fn delete_device(&self, dev_eui: Eui64) -> Result<()> {
        let path = format!("/devices/{}", dev_eui);
        self.call(self.request(Method::DELETE, &path)).await
    }

    async fn activate_device(&self, activation: &NsActivation) -> Result<()> {
        let path = format!("/devices/{}/activation", activation.dev_eui);
        self.call(self.request(Method::POST, &path).json(activation))
            .await
    }

    async fn deactivate_device(&self, dev_eui: Eui64) -> Result<()> {
        let path = format!("/devices/{}/activation", dev_eui);
        self.call(self.request(Method::DELETE, &path)).await
    }

    async fn get_device_activation(&self, dev_eui: Eui64) -> Result<Option<NsActivation>> {
        let path = format!("/devices/{}/activation", dev_eui);
        match self.fetch(self.request(Method::GET, &path)).await {
            Ok(a) => Ok(Some(a)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_device_queue_item(&self, item: &DeviceQueueItem) -> Result<()> {
        let path = format!("/devices/{}/queue", item.dev_eui);
        self.call(self.request(Method::POST, &path).json(item)).await
    }

    async fn flush_device_queue(&self, dev_eui: Eui64) -> Result<()> {
        let path = format!("/devices/{}/queue", dev_eui);
        self.call(self.request(Method::DELETE, &path)).await
    }

    async fn get_device_queue_items(&self, dev_eui: Eui64) -> Result<Vec<DeviceQueueItem>> {
        let path = format!("/devices/{}/queue", dev_eui);
        self.fetch(self.request(Method::GET, &path)).await
    }

    async fn create_multicast_group(&self, group: &NsMulticastGroup) -> Result<()> {
        self.call(self.request(Method::POST, "/multicast-groups").json(group))
            .await
    }

    async fn update_multicast_group(&self, group: &NsMulticastGroup) -> Result<()> {
        let path = format!("/multicast-groups/{}", group.id);
        self.call(self.request(Method::PUT, &path).json(group)).await
    }

    async fn delete_multicast_group(&self, id: Uuid) -> Result<()> {
        let path = format!("/multicast-groups/{}", id);
        self.call(self.request(Method::DELETE, &path)).await
    }

    async fn add_device_to_multicast_group(&self, id: Uuid, dev_eui: Eui64) -> Result<()> {
        let path = format!("/multicast-groups/{}/devices/{}", id, dev_eui);
        self.call(self.request(Method::POST, &path)).await
    }

    async fn remove_device_from_multicast_group(&self, id: Uuid, dev_eui: Eui64) -> Result<()> {
        let path = format!("/multicast-groups/{}/devices/{}", id, dev_eui);
        self.call(self.request(Method::DELETE, &path)).await
    }

    async fn enqueue_multicast_queue_item(&self, item: &MulticastQueueItem) -> Result<()> {
        let path = format!("/multicast-groups/{}/queue", item.multicast_group_id);
        self.call(self.request(Method::POST, &path).json(item)).await
    }

    async fn flush_multicast_queue(&self, id: Uuid) -> Result<()> {
        let path = format!("/multicast-groups/{}/queue", id);
        self.call(self.request(Method::DELETE, &path)).await
    }

    async fn get_multicast_queue_items(&self, id: Uuid) -> Result<Vec<MulticastQueueItem>> {
        let path = format!("/multicast-groups/{}/queue", id);
        self.fetch(self.request(Method::GET, &path)).await
    }

    async fn get_random_dev_addr(&self) -> Result<DevAddr> {
        let resp: DevAddrResponse = self
            .fetch(self.request(Method::POST, "/random-dev-addr"))
            .await?;
        Ok(resp.dev_addr)
    }

    async fn stream_frame_logs(&self, dev_eui: Eui64) -> Result<mpsc::Receiver<FrameLog>> {
        let url = format!("{}/api/devices/{}/frames", self.base_url, dev_eui);
        let req = self.stream_http.get(url);

        let mut resp = match tokio::time::timeout(self.stream_timeout, self.send(req)).await {
            Ok(resp) => resp?,
            Err(_) => {
                return Err(Error::NetworkServerUnavailable(
                    "deadline exceeded establishing frame-log stream".into(),
                ))
            }
        };

        // newline-delimited JSON, one FrameLog per line
        let (tx, rx) = mpsc::channel(FRAME_LOG_BUFFER);
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            loop {
                let chunk = match resp.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(dev_eui = %dev_eui, "frame-log stream ended: {}", e);
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<FrameLog>(&line) {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                // subscriber gone
                                return;
                            }
                        }
                        Err(e) => warn!(dev_eui = %dev_eui, "invalid frame-log line: {}", e),
                    }
                }
            }
            debug!(dev_eui = %dev_eui, "frame-log stream closed");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> NetworkServerProfile {
        NetworkServerProfile {
            id: 1,
            name: "ns".into(),
            server: "http://127.0.0.1:9/".into(),
            ca_cert: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            inventory: Duration::from_millis(200),
            stream: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_base_url_trimmed() {
        let ns = HttpNetworkServer::new(&profile(), timeouts()).unwrap();
        assert_eq!(ns.base_url, "http://127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let ns = HttpNetworkServer::new(&profile(), timeouts()).unwrap();
        let err = ns.flush_device_queue(Eui64::default()).await.unwrap_err();
        assert!(matches!(err, Error::NetworkServerUnavailable(_)));
    }
}
