//! Configuration management for the VBox agent
//!
//! Handles:
//! - Physical network mappings and the local network name
//! - VBoxManage invocation (path, retries, NIC hardware, bridged vs host-only)
//! - MQTT broker settings for the control plane
//! - Cross-platform config file location

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "VBOX_AGENT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentOptions,
    pub virtualbox: VirtualBoxConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    pub host: String,
    /// `<physical_network>:<interface>`, physical network may use `*` wildcards
    pub physical_network_mappings: Vec<String>,
    pub local_network: String,
    pub polling_interval_secs: u64,
    pub report_interval_secs: u64,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualBoxConfig {
    pub vboxmanage_cmd: String,
    pub retry_count: u32,
    pub retry_interval_secs: u64,
    /// Network hardware presented to the guest
    pub nic_type: String,
    /// Host-only adapters instead of bridged ones
    pub use_local_network: bool,
    pub offline_fallback: OfflineFallback,
}

/// Which offline reconfiguration failures fall through to the live path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineFallback {
    AnyError,
    InvalidState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u64,
    pub rpc_timeout_secs: u64,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            host: gethostname::gethostname().to_string_lossy().to_string(),
            physical_network_mappings: Vec::new(),
            local_network: "intnet".to_string(),
            polling_interval_secs: 2,
            report_interval_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl Default for VirtualBoxConfig {
    fn default() -> Self {
        Self {
            vboxmanage_cmd: "VBoxManage".to_string(),
            retry_count: 3,
            retry_interval_secs: 1,
            nic_type: "82540EM".to_string(), // Intel PRO/1000 MT Desktop
            use_local_network: false,
            offline_fallback: OfflineFallback::AnyError,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            keep_alive_secs: 30,
            rpc_timeout_secs: 10,
        }
    }
}

impl AgentConfig {
    /// Load config from `VBOX_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = match std::env::var(CONFIG_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };
        Self::load_from(&config_path).await
    }

    /// Load config from an explicit path, defaults when the file is absent
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("vbox-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn log_level(&self) -> tracing::Level {
        self.agent
            .log_level
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }
}

impl AgentOptions {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}

impl VirtualBoxConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl MqttConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Compiled physical network → host interface mappings
#[derive(Debug, Clone, Default)]
pub struct NetworkMappings {
    entries: Vec<MappingEntry>,
}

#[derive(Debug, Clone)]
struct MappingEntry {
    pattern: String,
    regex: Regex,
    interface: String,
}

impl NetworkMappings {
    pub fn parse(mappings: &[String]) -> Self {
        let mut entries = Vec::new();

        for mapping in mappings {
            let parts: Vec<&str> = mapping.split(':').collect();
            let [pattern, interface] = parts.as_slice() else {
                debug!("Invalid physical network mapping: {}", mapping);
                continue;
            };

            let pattern = pattern.trim();
            let wildcard = regex::escape(pattern).replace(r"\*", ".*");
            match Regex::new(&format!("^{}", wildcard)) {
                Ok(regex) => entries.push(MappingEntry {
                    pattern: pattern.to_string(),
                    regex,
                    interface: interface.trim().to_string(),
                }),
                Err(e) => debug!("Invalid physical network pattern {}: {}", pattern, e),
            }
        }

        Self { entries }
    }

    /// First matching mapping wins; unmapped names are used verbatim
    pub fn interface_for(&self, physical_network: Option<&str>) -> String {
        let name = physical_network.unwrap_or_default();
        self.entries
            .iter()
            .find(|entry| entry.regex.is_match(name))
            .map(|entry| entry.interface.clone())
            .unwrap_or_else(|| name.to_string())
    }

    /// Pattern → interface, as reported in the agent state
    pub fn to_report(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|entry| (entry.pattern.clone(), entry.interface.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
