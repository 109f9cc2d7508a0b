//! Integration events and the sink they are delivered to
//!
//! The pipelines hand every event to [`IntegrationHub::emit`], which appends it to
//! the device event log and pushes it to each configured [`Integration`]. A failed
//! push is kept for [`IntegrationHub::retry_pending`]; it never fails the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::codec::Location;
use crate::encoding::base64_bytes;
use crate::error::Result;
use crate::framelog::{EventEntry, EventLogBus};
use crate::lorawan::{DevAddr, Eui64, JoinType};

/// Failed deliveries kept for retry before the oldest is dropped.
pub const MAX_PENDING: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkEvent {
    pub application_id: i64,
    pub application_name: String,
    pub device_name: String,
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub f_cnt: u32,
    pub f_port: u8,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub object: Option<serde_json::Value>,
    pub tx_info: serde_json::Value,
    pub rx_info: Vec<serde_json::Value>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEvent {
    pub application_id: i64,
    pub application_name: String,
    pub device_name: String,
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub join_type: JoinType,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckEvent {
    pub application_id: i64,
    pub application_name: String,
    pub device_name: String,
    pub dev_eui: Eui64,
    pub reference: String,
    pub acknowledged: bool,
    pub f_cnt: u32,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub application_id: i64,
    pub application_name: String,
    pub device_name: String,
    pub dev_eui: Eui64,
    #[serde(rename = "type")]
    pub error_type: String,
    pub error: String,
    pub f_cnt: u32,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub application_id: i64,
    pub application_name: String,
    pub device_name: String,
    pub dev_eui: Eui64,
    pub margin: Option<i32>,
    pub external_power_source: bool,
    pub battery_level_unavailable: bool,
    /// Percent, when the device reports a level.
    pub battery_level: Option<f32>,
    pub published_at: DateTime<Utc>,
}

impl StatusEvent {
    /// Battery byte as reported by the device: 0 external power, 1..=254 level,
    /// 255 not measurable.
    pub fn battery_fields(battery: Option<u32>) -> (bool, bool, Option<f32>) {
        match battery {
            Some(0) => (true, false, None),
            Some(255) | None => (false, true, None),
            Some(b) => {
                let pct = (b as f32 / 254.0 * 100.0 * 100.0).round() / 100.0;
                (false, false, Some(pct))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationEvent {
    pub application_id: i64,
    pub application_name: String,
    pub device_name: String,
    pub dev_eui: Eui64,
    pub location: Location,
    pub f_cnt: u32,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "event", rename_all = "lowercase")]
pub enum Event {
    #[serde(rename = "up")]
    Uplink(UplinkEvent),
    Join(JoinEvent),
    Ack(AckEvent),
    Error(ErrorEvent),
    Status(StatusEvent),
    Location(LocationEvent),
}

impl Event {
    pub fn dev_eui(&self) -> Eui64 {
        match self {
            Event::Uplink(e) => e.dev_eui,
            Event::Join(e) => e.dev_eui,
            Event::Ack(e) => e.dev_eui,
            Event::Error(e) => e.dev_eui,
            Event::Status(e) => e.dev_eui,
            Event::Location(e) => e.dev_eui,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Uplink(_) => "up",
            Event::Join(_) => "join",
            Event::Ack(_) => "ack",
            Event::Error(_) => "error",
            Event::Status(_) => "status",
            Event::Location(_) => "location",
        }
    }

    fn published_at(&self) -> DateTime<Utc> {
        match self {
            Event::Uplink(e) => e.published_at,
            Event::Join(e) => e.published_at,
            Event::Ack(e) => e.published_at,
            Event::Error(e) => e.published_at,
            Event::Status(e) => e.published_at,
            Event::Location(e) => e.published_at,
        }
    }

    fn payload(&self) -> serde_json::Value {
        let v = match self {
            Event::Uplink(e) => serde_json::to_value(e),
            Event::Join(e) => serde_json::to_value(e),
            Event::Ack(e) => serde_json::to_value(e),
            Event::Error(e) => serde_json::to_value(e),
            Event::Status(e) => serde_json::to_value(e),
            Event::Location(e) => serde_json::to_value(e),
        };
        v.unwrap_or(serde_json::Value::Null)
    }

    pub fn to_log_entry(&self) -> EventEntry {
        EventEntry {
            dev_eui: self.dev_eui(),
            event_type: self.event_type().to_string(),
            payload: self.payload(),
            published_at: self.published_at(),
        }
    }
}

/// An event sink (HTTP webhook, MQTT, ...).
#[async_trait]
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;
    async fn publish(&self, event: &Event) -> Result<()>;
}

/// Writes every event to the log.
pub struct LogIntegration;

#[async_trait]
impl Integration for LogIntegration {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        match event {
            Event::Uplink(e) => info!(
                dev_eui = %e.dev_eui,
                f_cnt = e.f_cnt,
                f_port = e.f_port,
                "uplink {} ({} bytes)",
                hex::encode(&e.data),
                e.data.len()
            ),
            Event::Ack(e) => info!(
                dev_eui = %e.dev_eui,
                reference = %e.reference,
                acknowledged = e.acknowledged,
                "downlink ack"
            ),
            other => info!(dev_eui = %other.dev_eui(), "{} event", other.event_type()),
        }
        Ok(())
    }
}

/// Broadcasts events in-process; embedders and tests subscribe to it.
pub struct ChannelIntegration {
    tx: broadcast::Sender<Event>,
}

impl ChannelIntegration {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Integration for ChannelIntegration {
    fn name(&self) -> &str {
        "channel"
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

pub struct IntegrationHub {
    sinks: Vec<Arc<dyn Integration>>,
    event_log: Arc<EventLogBus>,
    pending: Mutex<VecDeque<(usize, Event)>>,
}

impl IntegrationHub {
    pub fn new(sinks: Vec<Arc<dyn Integration>>, event_log: Arc<EventLogBus>) -> Self {
        Self {
            sinks,
            event_log,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn event_log(&self) -> &Arc<EventLogBus> {
        &self.event_log
    }

    /// Log the event and deliver it to every sink. Never fails.
    pub async fn emit(&self, event: Event) {
        self.event_log.publish(event.dev_eui(), event.to_log_entry());

        for (idx, sink) in self.sinks.iter().enumerate() {
            if let Err(e) = sink.publish(&event).await {
                warn!(
                    integration = sink.name(),
                    dev_eui = %event.dev_eui(),
                    "{} event delivery failed, queued for retry: {}",
                    event.event_type(),
                    e
                );
                self.queue_retry(idx, event.clone());
            }
        }
    }

    fn queue_retry(&self, idx: usize, event: Event) {
        let mut pending = self.pending.lock();
        if pending.len() >= MAX_PENDING {
            if let Some((_, dropped)) = pending.pop_front() {
                warn!(dev_eui = %dropped.dev_eui(), "retry buffer full, dropping oldest event");
            }
        }
        pending.push_back((idx, event));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Redeliver queued events once. Returns how many succeeded.
    pub async fn retry_pending(&self) -> usize {
        let batch: Vec<(usize, Event)> = self.pending.lock().drain(..).collect();
        let mut delivered = 0;
        for (idx, event) in batch {
            let Some(sink) = self.sinks.get(idx) else {
                continue;
            };
            match sink.publish(&event).await {
                Ok(()) => delivered += 1,
                Err(_) => self.queue_retry(idx, event),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flaky {
        failing: AtomicBool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Integration for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn publish(&self, event: &Event) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Internal("webhook down".into()));
            }
            self.seen.lock().push(event.event_type().to_string());
            Ok(())
        }
    }

    fn ack() -> Event {
        Event::Ack(AckEvent {
            application_id: 1,
            application_name: "app".into(),
            device_name: "dev".into(),
            dev_eui: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
            reference: "r1".into(),
            acknowledged: true,
            f_cnt: 12,
            published_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let flaky = Arc::new(Flaky {
            failing: AtomicBool::new(true),
            seen: Mutex::new(vec![]),
        });
        let log = Arc::new(EventLogBus::new(10));
        let hub = IntegrationHub::new(vec![flaky.clone()], log.clone());

        hub.emit(ack()).await;
        assert_eq!(hub.pending_len(), 1);
        // the event log is fed regardless of sink failures
        assert_eq!(log.recent(Eui64([1, 2, 3, 4, 5, 6, 7, 8])).len(), 1);

        flaky.failing.store(false, Ordering::SeqCst);
        assert_eq!(hub.retry_pending().await, 1);
        assert_eq!(hub.pending_len(), 0);
        assert_eq!(*flaky.seen.lock(), vec!["ack".to_string()]);
    }

    #[tokio::test]
    async fn test_channel_integration() {
        let chan = Arc::new(ChannelIntegration::new(8));
        let mut rx = chan.subscribe();
        let hub = IntegrationHub::new(vec![chan], Arc::new(EventLogBus::new(10)));
        let event = ack();
        hub.emit(event.clone()).await;
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_log_entry_shape() {
        let entry = ack().to_log_entry();
        assert_eq!(entry.event_type, "ack");
        assert_eq!(entry.payload["reference"], "r1");
        assert_eq!(entry.payload["acknowledged"], true);
    }

    #[test]
    fn test_battery_fields() {
        assert_eq!(StatusEvent::battery_fields(Some(0)), (true, false, None));
        assert_eq!(StatusEvent::battery_fields(Some(255)), (false, true, None));
        assert_eq!(StatusEvent::battery_fields(None), (false, true, None));
        assert_eq!(StatusEvent::battery_fields(Some(254)), (false, false, Some(100.0)));
    }
}
