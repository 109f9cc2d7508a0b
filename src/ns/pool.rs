//! Network-server client pool
//!
//! One client per `(server, caCert, tlsCert, tlsKey)`. Clients unused for longer than
//! the idle window are dropped by [`NetworkServerPool::close_idle`], which `main` runs
//! periodically.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::NetworkServer;
use crate::error::Result;
use crate::storage::NetworkServerProfile;

/// Builds a client for a network-server profile.
pub trait Connector: Send + Sync {
    fn connect(&self, profile: &NetworkServerProfile) -> Result<Arc<dyn NetworkServer>>;
}

/// Hands out the same client for every profile.
pub struct StaticConnector(pub Arc<dyn NetworkServer>);

impl Connector for StaticConnector {
    fn connect(&self, _profile: &NetworkServerProfile) -> Result<Arc<dyn NetworkServer>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    server: String,
    ca_cert: String,
    tls_cert: String,
    tls_key: String,
}

impl From<&NetworkServerProfile> for PoolKey {
    fn from(p: &NetworkServerProfile) -> Self {
        Self {
            server: p.server.clone(),
            ca_cert: p.ca_cert.clone(),
            tls_cert: p.tls_cert.clone(),
            tls_key: p.tls_key.clone(),
        }
    }
}

struct PoolEntry {
    client: Arc<dyn NetworkServer>,
    last_used: Mutex<Instant>,
}

pub struct NetworkServerPool {
    connector: Arc<dyn Connector>,
    clients: DashMap<PoolKey, PoolEntry>,
    idle_timeout: Duration,
}

impl NetworkServerPool {
    pub fn new(connector: Arc<dyn Connector>, idle_timeout: Duration) -> Self {
        Self {
            connector,
            clients: DashMap::new(),
            idle_timeout,
        }
    }

    /// Client for `profile`, connecting on first use.
    pub fn get(&self, profile: &NetworkServerProfile) -> Result<Arc<dyn NetworkServer>> {
        let key = PoolKey::from(profile);
        if let Some(entry) = self.clients.get(&key) {
            *entry.last_used.lock() = Instant::now();
            return Ok(entry.client.clone());
        }

        let client = self.connector.connect(profile)?;
        debug!(server = %profile.server, "network-server client created");
        // a concurrent get may have connected first; keep whichever landed
        let entry = self.clients.entry(key).or_insert(PoolEntry {
            client,
            last_used: Mutex::new(Instant::now()),
        });
        Ok(entry.client.clone())
    }

    /// Drop clients idle for longer than the idle window. Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        let before = self.clients.len();
        let timeout = self.idle_timeout;
        self.clients
            .retain(|_, e| e.last_used.lock().elapsed() < timeout);
        let closed = before.saturating_sub(self.clients.len());
        if closed > 0 {
            info!(closed, "closed idle network-server clients");
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
