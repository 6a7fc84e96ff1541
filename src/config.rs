use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use mac_address::MacAddress;
use serde_derive::Deserialize;

pub const DEFAULT_DISCONNECT_DELAY_SECONDS: u64 = 120;
const DEFAULT_STORAGE_PATH: &str = "unifi_presence_data.json";

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub presence: Option<PresenceConfig>,
    pub storage: Option<StorageConfig>,
    pub devices: Option<Vec<KnownDevice>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub discovery_prefix: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PresenceConfig {
    pub disconnect_delay_seconds: Option<u64>,
    pub webhook_id: Option<String>,
    /// Static token checked by whatever relays the controller's webhook to us.
    pub secret: Option<String>,
    pub name_prefix: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

/// The part of the config file the store maintenance commands need.
/// Everything else, `[mqtt]` included, is ignored.
#[derive(Deserialize, Debug, Default)]
struct StorageOnly {
    storage: Option<StorageConfig>,
}

fn storage_path_or_default(storage: Option<&StorageConfig>) -> PathBuf {
    storage
        .and_then(|s| s.path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH))
}

/// Resolve the discovery store path without requiring a complete config.
pub fn storage_path_from(path: &Path) -> anyhow::Result<PathBuf> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    storage_path_from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))
}

fn storage_path_from_str(contents: &str) -> anyhow::Result<PathBuf> {
    let config: StorageOnly = toml::de::from_str(contents)?;
    Ok(storage_path_or_default(config.storage.as_ref()))
}

/// A MAC the user has given a friendly name to.
#[derive(Deserialize, Debug, Clone)]
pub struct KnownDevice {
    pub address: MacAddress,
    pub name: String,
}

impl KnownDevice {
    /// Lowercase, colon separated form used as the registry key.
    pub fn mac(&self) -> String {
        self.address.to_string().to_lowercase()
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn presence(&self) -> PresenceConfig {
        self.presence.clone().unwrap_or_default()
    }

    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_secs(
            self.presence
                .as_ref()
                .and_then(|p| p.disconnect_delay_seconds)
                .unwrap_or(DEFAULT_DISCONNECT_DELAY_SECONDS),
        )
    }

    pub fn storage_path(&self) -> PathBuf {
        storage_path_or_default(self.storage.as_ref())
    }

    pub fn known_devices(&self) -> &[KnownDevice] {
        self.devices.as_deref().unwrap_or_default()
    }
}

impl PresenceConfig {
    pub fn webhook_id(&self) -> &str {
        self.webhook_id.as_deref().unwrap_or("default")
    }

    pub fn name_prefix(&self) -> &str {
        self.name_prefix.as_deref().unwrap_or("uwp_")
    }

    /// Empty strings count as "no secret", same as leaving the key out.
    pub fn secret(&self) -> Option<&str> {
        self.secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
