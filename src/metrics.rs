//! Process counters
//!
//! Plain atomics bumped by the pipelines; [`Metrics::snapshot`] is what
//! `GET /api/internal/metrics` returns.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Error;

pub struct Metrics {
    pub joins_accepted: AtomicU64,
    pub joins_rejected: AtomicU64,
    pub uplinks_delivered: AtomicU64,
    pub uplinks_dropped: AtomicU64,
    pub proprietary_uplinks: AtomicU64,
    pub downlinks_enqueued: AtomicU64,
    pub downlink_acks: AtomicU64,
    pub multicast_enqueued: AtomicU64,
    pub codec_errors: AtomicU64,
    pub network_server_errors: AtomicU64,

    // security failures, for alerting
    pub mic_failures: AtomicU64,
    pub dev_nonce_replays: AtomicU64,
    pub rejoin_replays: AtomicU64,
    pub fcnt_replays: AtomicU64,
    pub duplicate_frames: AtomicU64,

    started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub joins_accepted: u64,
    pub joins_rejected: u64,
    pub uplinks_delivered: u64,
    pub uplinks_dropped: u64,
    pub proprietary_uplinks: u64,
    pub downlinks_enqueued: u64,
    pub downlink_acks: u64,
    pub multicast_enqueued: u64,
    pub codec_errors: u64,
    pub network_server_errors: u64,
    pub mic_failures: u64,
    pub dev_nonce_replays: u64,
    pub rejoin_replays: u64,
    pub fcnt_replays: u64,
    pub duplicate_frames: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    pub fn security_failures(&self) -> u64 {
        self.mic_failures
            + self.dev_nonce_replays
            + self.rejoin_replays
            + self.fcnt_replays
            + self.duplicate_frames
    }
}

fn inc(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            joins_accepted: AtomicU64::new(0),
            joins_rejected: AtomicU64::new(0),
            uplinks_delivered: AtomicU64::new(0),
            uplinks_dropped: AtomicU64::new(0),
            proprietary_uplinks: AtomicU64::new(0),
            downlinks_enqueued: AtomicU64::new(0),
            downlink_acks: AtomicU64::new(0),
            multicast_enqueued: AtomicU64::new(0),
            codec_errors: AtomicU64::new(0),
            network_server_errors: AtomicU64::new(0),
            mic_failures: AtomicU64::new(0),
            dev_nonce_replays: AtomicU64::new(0),
            rejoin_replays: AtomicU64::new(0),
            fcnt_replays: AtomicU64::new(0),
            duplicate_frames: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn incr(&self, counter: impl Fn(&Metrics) -> &AtomicU64) {
        inc(counter(self));
    }

    /// Count an error against the matching failure counter, if any.
    pub fn record_error(&self, err: &Error) {
        match err {
            Error::MicFailed => inc(&self.mic_failures),
            Error::DevNonceReused { .. } => inc(&self.dev_nonce_replays),
            Error::RejoinCounterReplay { .. } => inc(&self.rejoin_replays),
            Error::FCntReplay { .. } => inc(&self.fcnt_replays),
            Error::DuplicateFrame { .. } => inc(&self.duplicate_frames),
            Error::NetworkServerUnavailable(_) => inc(&self.network_server_errors),
            Error::CodecFailed(_) => inc(&self.codec_errors),
            _ => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            joins_accepted: load(&self.joins_accepted),
            joins_rejected: load(&self.joins_rejected),
            uplinks_delivered: load(&self.uplinks_delivered),
            uplinks_dropped: load(&self.uplinks_dropped),
            proprietary_uplinks: load(&self.proprietary_uplinks),
            downlinks_enqueued: load(&self.downlinks_enqueued),
            downlink_acks: load(&self.downlink_acks),
            multicast_enqueued: load(&self.multicast_enqueued),
            codec_errors: load(&self.codec_errors),
            network_server_errors: load(&self.network_server_errors),
            mic_failures: load(&self.mic_failures),
            dev_nonce_replays: load(&self.dev_nonce_replays),
            rejoin_replays: load(&self.rejoin_replays),
            fcnt_replays: load(&self.fcnt_replays),
            duplicate_frames: load(&self.duplicate_frames),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
