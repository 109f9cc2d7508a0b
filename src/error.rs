//! Error taxonomy shared by every core operation.

use thiserror::Error;

use crate::lorawan::{DevAddr, Eui64};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown device {0}")]
    UnknownDevice(Eui64),

    #[error("device {0} has no activation")]
    NoActivation(Eui64),

    #[error("device {0} has no keys")]
    NoDeviceKeys(Eui64),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("dev-nonce {dev_nonce} already used by device {dev_eui}")]
    DevNonceReused { dev_eui: Eui64, dev_nonce: u16 },

    #[error("join-nonce exhausted for device {0}")]
    JoinNonceExhausted(Eui64),

    #[error("rejoin counter {counter} replayed by device {dev_eui}")]
    RejoinCounterReplay { dev_eui: Eui64, counter: u16 },

    #[error("invalid MIC")]
    MicFailed,

    #[error("frame-counter replay for {dev_addr}: received {received}, expected > {last}")]
    FCntReplay {
        dev_addr: DevAddr,
        received: u32,
        last: u32,
    },

    #[error("duplicate frame for {dev_addr}: frame-counter {fcnt}")]
    DuplicateFrame { dev_addr: DevAddr, fcnt: u32 },

    #[error("frame-counter exhausted")]
    CounterExhausted,

    #[error("codec error: {0}")]
    CodecFailed(String),

    #[error("service-profile mismatch between device {dev_eui} and multicast-group {group}")]
    ServiceProfileMismatch { dev_eui: Eui64, group: String },

    #[error("network-server unavailable: {0}")]
    NetworkServerUnavailable(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Replay and cryptographic failures, counted for operator alerting.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Error::MicFailed
                | Error::DevNonceReused { .. }
                | Error::RejoinCounterReplay { .. }
                | Error::FCntReplay { .. }
                | Error::DuplicateFrame { .. }
        )
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}
