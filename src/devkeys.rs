//! Device-keys store
//!
//! Root keys and nonce state are only mutated inside a [`KeysTxn`], which holds the
//! per-device lock from load to commit. Dropping a transaction (error or cancellation)
//! releases the lock and discards every change made to it.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock::{KeyedGuard, KeyedLocks};
use crate::lorawan::{Eui64, JoinType, MacVersion};
use crate::storage::{DeviceActivation, DeviceKeys, KeysRepo, UsedDevNonce};

/// JoinNonce is a 24-bit counter.
pub const JOIN_NONCE_LIMIT: u32 = 1 << 24;

/// Smallest accepted dev-nonce recent-set.
pub const MIN_DEV_NONCE_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevNoncePolicy {
    /// How many `(JoinEUI, DevNonce)` pairs are remembered per device.
    pub window: usize,
    /// Require 1.1 devices to present increasing dev-nonces.
    pub strict: bool,
}

impl Default for DevNoncePolicy {
    fn default() -> Self {
        Self {
            window: MIN_DEV_NONCE_WINDOW,
            strict: false,
        }
    }
}

impl DevNoncePolicy {
    pub fn new(window: usize, strict: bool) -> Self {
        Self {
            window: window.max(MIN_DEV_NONCE_WINDOW),
            strict,
        }
    }
}

pub struct DeviceKeysStore {
    repo: Arc<dyn KeysRepo>,
    locks: Arc<KeyedLocks<Eui64>>,
    policy: DevNoncePolicy,
}

impl DeviceKeysStore {
    pub fn new(
        repo: Arc<dyn KeysRepo>,
        locks: Arc<KeyedLocks<Eui64>>,
        policy: DevNoncePolicy,
    ) -> Self {
        Self {
            repo,
            locks,
            policy,
        }
    }

    /// Read the keys and nonce state without taking the device lock.
    pub async fn load(&self, dev_eui: Eui64) -> Result<DeviceKeys> {
        self.repo.load(dev_eui).await
    }

    /// Lock the device and load its keys.
    pub async fn begin(&self, dev_eui: Eui64) -> Result<KeysTxn> {
        let guard = self.locks.lock(&dev_eui).await;
        let keys = self.repo.load(dev_eui).await?;
        Ok(KeysTxn {
            _guard: guard,
            keys,
            repo: self.repo.clone(),
            policy: self.policy,
        })
    }

    /// Reject a reused dev-nonce, otherwise remember it and persist.
    pub async fn check_and_consume_dev_nonce(
        &self,
        dev_eui: Eui64,
        join_eui: Eui64,
        dev_nonce: u16,
        mac_version: MacVersion,
    ) -> Result<()> {
        let mut txn = self.begin(dev_eui).await?;
        txn.check_dev_nonce(join_eui, dev_nonce, mac_version)?;
        txn.consume_dev_nonce(join_eui, dev_nonce);
        txn.commit_nonces().await
    }

    /// Create or replace the root keys of a device.
    ///
    /// Nonce state of existing keys is carried over so JoinNonce never goes back and
    /// consumed dev-nonces stay consumed.
    pub async fn provision(&self, mut keys: DeviceKeys) -> Result<()> {
        let _guard = self.locks.lock(&keys.dev_eui).await;
        match self.repo.load(keys.dev_eui).await {
            Ok(existing) => {
                keys.join_nonce = keys.join_nonce.max(existing.join_nonce);
                keys.dev_nonces = existing.dev_nonces;
                keys.rj_count0 = existing.rj_count0;
                keys.rj_count1 = existing.rj_count1;
            }
            Err(Error::NoDeviceKeys(_)) => {}
            Err(e) => return Err(e),
        }
        keys.updated_at = Utc::now();
        self.repo.store(keys).await
    }

    /// Allocate and persist the next JoinNonce.
    pub async fn next_join_nonce(&self, dev_eui: Eui64) -> Result<u32> {
        let mut txn = self.begin(dev_eui).await?;
        let join_nonce = txn.next_join_nonce()?;
        txn.commit_nonces().await?;
        Ok(join_nonce)
    }
}

/// Exclusive, uncommitted view of one device's keys.
pub struct KeysTxn {
    _guard: KeyedGuard,
    keys: DeviceKeys,
    repo: Arc<dyn KeysRepo>,
    policy: DevNoncePolicy,
}

impl KeysTxn {
    pub fn keys(&self) -> &DeviceKeys {
        &self.keys
    }

    /// Fails with `DevNonceReused` if the nonce was already used with this JoinEUI.
    ///
    /// Nothing is recorded; call [`KeysTxn::consume_dev_nonce`] once the request is
    /// authenticated.
    pub fn check_dev_nonce(
        &self,
        join_eui: Eui64,
        dev_nonce: u16,
        mac_version: MacVersion,
    ) -> Result<()> {
        let reused = || Error::DevNonceReused {
            dev_eui: self.keys.dev_eui,
            dev_nonce,
        };

        let mut seen = self
            .keys
            .dev_nonces
            .iter()
            .filter(|n| n.join_eui == join_eui);
        if self.policy.strict && !mac_version.is_legacy() {
            if seen.any(|n| n.dev_nonce >= dev_nonce) {
                return Err(reused());
            }
        } else if seen.any(|n| n.dev_nonce == dev_nonce) {
            return Err(reused());
        }
        Ok(())
    }

    pub fn consume_dev_nonce(&mut self, join_eui: Eui64, dev_nonce: u16) {
        self.keys.dev_nonces.push_back(UsedDevNonce {
            join_eui,
            dev_nonce,
        });
        while self.keys.dev_nonces.len() > self.policy.window {
            self.keys.dev_nonces.pop_front();
        }
    }

    /// Increment the JoinNonce and return the value the accept must carry.
    pub fn next_join_nonce(&mut self) -> Result<u32> {
        let next = self.keys.join_nonce + 1;
        if next >= JOIN_NONCE_LIMIT {
            return Err(Error::JoinNonceExhausted(self.keys.dev_eui));
        }
        self.keys.join_nonce = next;
        Ok(next)
    }

    /// Rejoin counters must strictly increase per rejoin type.
    pub fn check_rejoin_counter(&self, join_type: JoinType, rj_count: u16) -> Result<()> {
        let last = match join_type {
            JoinType::RejoinType1 => self.keys.rj_count1,
            JoinType::RejoinType0 | JoinType::RejoinType2 => self.keys.rj_count0,
            JoinType::Join => return Ok(()),
        };
        match last {
            Some(last) if rj_count <= last => Err(Error::RejoinCounterReplay {
                dev_eui: self.keys.dev_eui,
                counter: rj_count,
            }),
            _ => Ok(()),
        }
    }

    pub fn record_rejoin_counter(&mut self, join_type: JoinType, rj_count: u16) {
        match join_type {
            JoinType::RejoinType1 => self.keys.rj_count1 = Some(rj_count),
            JoinType::RejoinType0 | JoinType::RejoinType2 => self.keys.rj_count0 = Some(rj_count),
            JoinType::Join => {}
        }
    }

    /// Persist nonce state only.
    pub async fn commit_nonces(mut self) -> Result<()> {
        self.keys.updated_at = Utc::now();
        self.repo.update_nonces(&self.keys).await?;
        debug!(
            dev_eui = %self.keys.dev_eui,
            join_nonce = self.keys.join_nonce,
            "device nonces committed"
        );
        Ok(())
    }

    /// Persist nonce state together with the new activation.
    pub async fn commit(mut self, activation: DeviceActivation) -> Result<DeviceActivation> {
        self.keys.updated_at = Utc::now();
        let stored = self.repo.commit_join(&self.keys, activation).await?;
        debug!(
            dev_eui = %self.keys.dev_eui,
            join_nonce = self.keys.join_nonce,
            activation_id = stored.id,
            "join committed"
        );
        Ok(stored)
    }
}
