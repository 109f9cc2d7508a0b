//! Authorization port
//!
//! Handlers describe what they are about to do as an [`Action`] on a [`Target`] and
//! ask the [`Authorizer`]. Grants are plain data on the [`Identity`]; device and
//! multicast-group targets are resolved to their owners through the repositories.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lorawan::Eui64;
use crate::storage::{DeviceRepo, InventoryRepo, MulticastRepo};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub organizations: Vec<i64>,
    #[serde(default)]
    pub applications: Vec<i64>,
    #[serde(default)]
    pub read_only: bool,
}

impl Identity {
    pub fn admin(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            admin: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Activate,
    ReadKeys,
    UpdateKeys,
    Enqueue,
    Flush,
    StreamLogs,
}

impl Action {
    pub fn is_write(self) -> bool {
        !matches!(self, Action::Read | Action::ReadKeys | Action::StreamLogs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Organization(i64),
    Application(i64),
    Device(Eui64),
    MulticastGroup(Uuid),
    /// Process internals (metrics, network-server ingress).
    Internal,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(false)` is a deny; `Err` when the target could not be resolved.
    async fn check(&self, identity: &Identity, action: Action, target: Target) -> Result<bool>;
}

/// Fails with `PermissionDenied` unless the authorizer allows.
pub async fn require(
    authorizer: &dyn Authorizer,
    identity: &Identity,
    action: Action,
    target: Target,
) -> Result<()> {
    if authorizer.check(identity, action, target).await? {
        Ok(())
    } else {
        debug!(subject = %identity.subject, ?action, ?target, "permission denied");
        Err(Error::PermissionDenied)
    }
}

/// Allows everything; used behind the trusted network-server ingress.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn check(&self, _: &Identity, _: Action, _: Target) -> Result<bool> {
        Ok(true)
    }
}

pub struct PolicyAuthorizer {
    devices: Arc<dyn DeviceRepo>,
    groups: Arc<dyn MulticastRepo>,
    inventory: Arc<dyn InventoryRepo>,
}

impl PolicyAuthorizer {
    pub fn new(
        devices: Arc<dyn DeviceRepo>,
        groups: Arc<dyn MulticastRepo>,
        inventory: Arc<dyn InventoryRepo>,
    ) -> Self {
        Self {
            devices,
            groups,
            inventory,
        }
    }

    async fn application_allowed(&self, identity: &Identity, id: i64) -> Result<bool> {
        if identity.applications.contains(&id) {
            return Ok(true);
        }
        if identity.organizations.is_empty() {
            return Ok(false);
        }
        let app = self.inventory.application(id).await?;
        Ok(identity.organizations.contains(&app.organization_id))
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn check(&self, identity: &Identity, action: Action, target: Target) -> Result<bool> {
        if identity.admin {
            return Ok(true);
        }
        if identity.read_only && action.is_write() {
            return Ok(false);
        }

        match target {
            Target::Internal => Ok(false),
            Target::Organization(id) => Ok(identity.organizations.contains(&id)),
            Target::Application(id) => self.application_allowed(identity, id).await,
            Target::Device(dev_eui) => {
                let device = self.devices.get(dev_eui).await?;
                self.application_allowed(identity, device.application_id)
                    .await
            }
            Target::MulticastGroup(id) => {
                let group = self.groups.get(id).await?;
                let sp = self.inventory.service_profile(group.service_profile_id).await?;
                Ok(identity.organizations.contains(&sp.organization_id))
            }
        }
    }
}
