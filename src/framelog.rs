//! Per-device frame and event logs
//!
//! A bounded ring of recent entries per device plus a broadcast channel for live
//! subscribers. Delivery is lossy: a subscriber that falls behind skips entries.
//! Nothing is persisted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::encoding::base64_bytes;
use crate::lorawan::{DevAddr, Eui64};
use crate::ns::{FrameDirection, FrameLog};

pub const DEFAULT_LOG_SIZE: usize = 100;

/// A frame seen by the pipelines or reported by the network-server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameEntry {
    pub dev_eui: Eui64,
    pub direction: FrameDirection,
    pub dev_addr: Option<DevAddr>,
    pub f_cnt: Option<u32>,
    pub f_port: Option<u8>,
    /// FRMPayload as seen on air, or the full PHYPayload for network-server frames.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub tx_info: serde_json::Value,
    #[serde(default)]
    pub rx_info: Vec<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl From<FrameLog> for FrameEntry {
    fn from(f: FrameLog) -> Self {
        Self {
            dev_eui: f.dev_eui,
            direction: f.direction,
            dev_addr: None,
            f_cnt: None,
            f_port: None,
            payload: f.phy_payload,
            tx_info: f.tx_info,
            rx_info: f.rx_info,
            at: f.observed_at,
        }
    }
}

/// An integration event, as shown on the device event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEntry {
    pub dev_eui: Eui64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

struct DeviceLog<T> {
    recent: Mutex<VecDeque<T>>,
    tx: broadcast::Sender<T>,
}

pub struct LogBus<T> {
    capacity: usize,
    devices: DashMap<Eui64, DeviceLog<T>>,
}

pub type FrameLogBus = LogBus<FrameEntry>;
pub type EventLogBus = LogBus<EventEntry>;

/// Recent entries at subscription time followed by live ones.
pub struct Subscription<T> {
    pub backlog: Vec<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Next live entry; `None` once the device log is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("log subscriber lagged, skipped {} entries", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Backlog then live entries. Dropping the stream unsubscribes.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        let live = BroadcastStream::new(self.rx)
            .filter_map(|item| futures::future::ready(item.ok()));
        futures::stream::iter(self.backlog).chain(live)
    }
}

impl<T: Clone + Send + 'static> LogBus<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            devices: DashMap::new(),
        }
    }

    fn with_log<R>(&self, dev_eui: Eui64, f: impl FnOnce(&DeviceLog<T>) -> R) -> R {
        let entry = self.devices.entry(dev_eui).or_insert_with(|| DeviceLog {
            recent: Mutex::new(VecDeque::with_capacity(self.capacity)),
            tx: broadcast::channel(self.capacity).0,
        });
        f(entry.value())
    }

    /// Append an entry and hand it to live subscribers.
    pub fn publish(&self, dev_eui: Eui64, item: T) {
        let capacity = self.capacity;
        self.with_log(dev_eui, |log| {
            let mut recent = log.recent.lock();
            if recent.len() == capacity {
                recent.pop_front();
            }
            recent.push_back(item.clone());
            // no receivers is fine
            let _ = log.tx.send(item);
        });
    }

    pub fn recent(&self, dev_eui: Eui64) -> Vec<T> {
        self.devices
            .get(&dev_eui)
            .map(|log| log.recent.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self, dev_eui: Eui64) -> Subscription<T> {
        self.with_log(dev_eui, |log| {
            // snapshot and subscribe under the ring lock so no entry is missed or doubled
            let recent = log.recent.lock();
            Subscription {
                backlog: recent.iter().cloned().collect(),
                rx: log.tx.subscribe(),
            }
        })
    }

    pub fn subscriber_count(&self, dev_eui: Eui64) -> usize {
        self.devices
            .get(&dev_eui)
            .map(|log| log.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Forget a device; live subscriptions end.
    pub fn remove(&self, dev_eui: Eui64) {
        self.devices.remove(&dev_eui);
    }
}
