//! LoRaWAN application-server core
//!
//! Owns device root keys and application session keys, answers join requests
//! on behalf of network-servers, decrypts and decodes uplinks, and encrypts
//! downlinks before queueing them on the owning network-server.

pub mod api;
pub mod auth;
pub mod codec;
pub mod config;
pub mod context;
pub mod devkeys;
pub mod downlink;
pub mod encoding;
pub mod error;
pub mod fcnt;
pub mod framelog;
pub mod integration;
pub mod join;
pub mod lock;
pub mod lorawan;
pub mod metrics;
pub mod multicast;
pub mod ns;
pub mod operator;
pub mod storage;
pub mod uplink;

pub use context::AppContext;
pub use error::{Error, Result};
