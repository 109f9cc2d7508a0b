use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::api::TokenTable;
use crate::auth::Identity;
use crate::context::CoreSettings;
use crate::devkeys::{DevNoncePolicy, MIN_DEV_NONCE_WINDOW};
use crate::framelog::DEFAULT_LOG_SIZE;
use crate::lorawan::{Eui64, NetId};
use crate::storage::memory::MemoryStore;
use crate::storage::{Application, DeviceProfile, NetworkServerProfile, ServiceProfile};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub application_server: ApplicationServerConfig,
    pub join_server: JoinServerConfig,
    pub external_api: ExternalApiConfig,
    pub network_server: NetworkServerConfig,
    pub core: CoreConfig,
    pub inventory: InventoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Ingress from network-servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationServerConfig {
    pub bind: String,
}

impl Default for ApplicationServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8001".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JoinServerConfig {
    pub bind: String,
    /// Used when a request carries no usable SenderID.
    pub net_id: NetId,
    /// JoinEUIs answered here; empty answers all.
    pub join_eui_filter: Vec<Eui64>,
}

impl Default for JoinServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8003".to_string(),
            net_id: NetId::default(),
            join_eui_filter: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExternalApiConfig {
    pub bind: String,
    pub tokens: Vec<ApiTokenConfig>,
}

impl Default for ExternalApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTokenConfig {
    pub token: String,
    pub subject: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub organizations: Vec<i64>,
    #[serde(default)]
    pub applications: Vec<i64>,
}

impl ExternalApiConfig {
    pub fn token_table(&self) -> TokenTable {
        TokenTable::new(self.tokens.iter().map(|t| {
            (
                t.token.clone(),
                Identity {
                    subject: t.subject.clone(),
                    admin: t.admin,
                    organizations: t.organizations.clone(),
                    applications: t.applications.clone(),
                    read_only: t.read_only,
                },
            )
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkServerConfig {
    pub inventory_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub idle_timeout_secs: u64,
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self {
            inventory_timeout_ms: 1000,
            stream_timeout_ms: 5000,
            idle_timeout_secs: 300,
        }
    }
}

#[cfg(feature = "ns-http")]
impl NetworkServerConfig {
    pub fn timeouts(&self) -> crate::ns::http::Timeouts {
        crate::ns::http::Timeouts {
            inventory: Duration::from_millis(self.inventory_timeout_ms),
            stream: Duration::from_millis(self.stream_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub dev_nonce_window: usize,
    /// Require increasing dev-nonces from 1.1 devices.
    pub strict_dev_nonce: bool,
    pub frame_log_size: usize,
    pub lock_sweep_secs: u64,
    pub integration_retry_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dev_nonce_window: MIN_DEV_NONCE_WINDOW,
            strict_dev_nonce: false,
            frame_log_size: DEFAULT_LOG_SIZE,
            lock_sweep_secs: 60,
            integration_retry_secs: 30,
        }
    }
}

/// Inventory seeded into the in-memory store at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub network_servers: Vec<NetworkServerProfile>,
    pub service_profiles: Vec<ServiceProfile>,
    pub device_profiles: Vec<DeviceProfile>,
    pub applications: Vec<Application>,
}

impl InventoryConfig {
    pub fn seed(&self, store: &MemoryStore) {
        for ns in &self.network_servers {
            store.insert_network_server(ns.clone());
        }
        for sp in &self.service_profiles {
            store.insert_service_profile(sp.clone());
        }
        for dp in &self.device_profiles {
            store.insert_device_profile(dp.clone());
        }
        for app in &self.applications {
            store.insert_application(app.clone());
        }
    }

    /// Every profile must point at something that exists.
    fn validate(&self) -> anyhow::Result<()> {
        let ns_known = |id: i64| self.network_servers.iter().any(|ns| ns.id == id);
        for sp in &self.service_profiles {
            anyhow::ensure!(
                ns_known(sp.network_server_id),
                "service-profile {} references unknown network-server {}",
                sp.id,
                sp.network_server_id
            );
        }
        for dp in &self.device_profiles {
            anyhow::ensure!(
                ns_known(dp.network_server_id),
                "device-profile {} references unknown network-server {}",
                dp.id,
                dp.network_server_id
            );
        }
        for app in &self.applications {
            anyhow::ensure!(
                self.service_profiles
                    .iter()
                    .any(|sp| sp.id == app.service_profile_id),
                "application {} references unknown service-profile {}",
                app.id,
                app.service_profile_id
            );
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, bind) in [
            ("application_server", &self.application_server.bind),
            ("join_server", &self.join_server.bind),
            ("external_api", &self.external_api.bind),
        ] {
            bind.parse::<SocketAddr>()
                .with_context(|| format!("[{}] bind '{}' is not a socket address", name, bind))?;
        }
        self.inventory.validate()
    }

    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            dev_nonce: DevNoncePolicy::new(self.core.dev_nonce_window, self.core.strict_dev_nonce),
            frame_log_size: self.core.frame_log_size,
            ns_idle_timeout: Duration::from_secs(self.network_server.idle_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[logging]
level = "debug"

[application_server]
bind = "127.0.0.1:8001"

[join_server]
bind = "127.0.0.1:8003"
net_id = "010203"
join_eui_filter = ["0807060504030201"]

[external_api]
bind = "127.0.0.1:8080"

[[external_api.tokens]]
token = "s3cret"
subject = "ops"
admin = true

[core]
dev_nonce_window = 16
strict_dev_nonce = true

[[inventory.network_servers]]
id = 1
name = "ns"
server = "http://localhost:8000"

[[inventory.service_profiles]]
id = "6f1d1a8c-3a5b-4d5e-9c1f-2b7a8e9d0c11"
name = "default"
organizationId = 1
networkServerId = 1

[[inventory.device_profiles]]
id = "0b9b1b4e-8c39-4b55-a0f5-3c4e5d6f7a81"
name = "class-a"
networkServerId = 1
macVersion = "1.0.3"

[[inventory.applications]]
id = 1
name = "sensors"
organizationId = 1
serviceProfileId = "6f1d1a8c-3a5b-4d5e-9c1f-2b7a8e9d0c11"
"#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.join_server.net_id.to_string(), "010203");
        assert_eq!(config.join_server.join_eui_filter.len(), 1);
        assert_eq!(config.external_api.token_table().len(), 1);
        assert!(config.inventory.device_profiles[0].supports_join);
        // unset sections fall back to defaults
        assert_eq!(config.network_server.inventory_timeout_ms, 1000);
        assert_eq!(config.core.frame_log_size, DEFAULT_LOG_SIZE);

        let settings = config.core_settings();
        assert_eq!(settings.dev_nonce.window, MIN_DEV_NONCE_WINDOW);
        assert!(settings.dev_nonce.strict);
    }

    #[tokio::test]
    async fn test_seed_inventory() {
        use crate::storage::InventoryRepo;

        let config: Config = toml::from_str(EXAMPLE).unwrap();
        let store = MemoryStore::new();
        config.inventory.seed(&store);
        let app = store.application(1).await.unwrap();
        assert_eq!(app.name, "sensors");
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.inventory.network_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_bind_rejected() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.external_api.bind = "localhost".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/lora-appserver.toml")).is_err());
    }
}
