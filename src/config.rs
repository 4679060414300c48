//! WolfGroup Configuration
//!
//! This module provides configuration structures for a WolfGroup node:
//! node identity, group configuration keys, transport settings and logging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main WolfGroup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfGroupConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Group configuration
    #[serde(default)]
    pub groups: GroupsConfig,

    /// Group transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (generated when empty)
    #[serde(default)]
    pub id: String,

    /// Address advertised to other nodes
    pub address: String,

    /// Data directory for the local configuration database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// PID under which the group configuration is stored locally
    #[serde(default = "default_pid")]
    pub pid: String,

    /// PID holding this node's own memberships
    #[serde(default = "default_node_pid")]
    pub node_pid: String,

    /// Reserved property holding the comma-separated group names
    #[serde(default = "default_groups_key")]
    pub groups_key: String,

    /// Name of the implicit group every node can see
    #[serde(default = "default_group_name")]
    pub default_group: String,

    /// Local-only property prefixes that are never replicated
    #[serde(default = "default_reserved_prefixes")]
    pub reserved_prefixes: Vec<String>,

    /// Groups joined at startup
    #[serde(default)]
    pub auto_join: Vec<String>,
}

/// Group transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Request exclusive producers/consumers per group channel
    #[serde(default = "default_true")]
    pub exclusive: bool,

    /// Buffered events per channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfgroup")
}

fn default_pid() -> String {
    crate::group::GROUPS_PID.to_string()
}

fn default_node_pid() -> String {
    crate::group::NODE_PID.to_string()
}

fn default_groups_key() -> String {
    crate::group::GROUPS_KEY.to_string()
}

fn default_group_name() -> String {
    crate::group::DEFAULT_GROUP.to_string()
}

fn default_reserved_prefixes() -> Vec<String> {
    crate::group::RESERVED_PREFIXES
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            pid: default_pid(),
            node_pid: default_node_pid(),
            groups_key: default_groups_key(),
            default_group: default_group_name(),
            reserved_prefixes: default_reserved_prefixes(),
            auto_join: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            exclusive: true,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfGroupConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let mut config: WolfGroupConfig = toml::from_str(content)?;
        if config.node.id.is_empty() {
            config.node.id = uuid::Uuid::new_v4().to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.address.is_empty() {
            return Err(crate::Error::Config("node.address cannot be empty".into()));
        }

        if self.groups.pid.is_empty() || self.groups.node_pid.is_empty() {
            return Err(crate::Error::Config("groups.pid and groups.node_pid cannot be empty".into()));
        }

        if self.groups.pid == self.groups.node_pid {
            return Err(crate::Error::Config("groups.pid and groups.node_pid must differ".into()));
        }

        if self.groups.groups_key.is_empty() || self.groups.groups_key.contains('.') {
            return Err(crate::Error::Config(
                "groups.groups_key must be a non-empty name without '.'".into(),
            ));
        }

        crate::group::validate_group_name(&self.groups.default_group)?;
        for name in &self.groups.auto_join {
            crate::group::validate_group_name(name)?;
        }

        if self.transport.channel_capacity == 0 {
            return Err(crate::Error::Config("transport.channel_capacity must be > 0".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the local configuration database path
    pub fn config_db_path(&self) -> PathBuf {
        self.node.data_dir.join("config.db")
    }

    /// Settings for the group manager
    pub fn group_settings(&self) -> crate::group::GroupSettings {
        crate::group::GroupSettings {
            pid: self.groups.pid.clone(),
            node_pid: self.groups.node_pid.clone(),
            groups_key: self.groups.groups_key.clone(),
            default_group: self.groups.default_group.clone(),
            reserved_prefixes: self.groups.reserved_prefixes.clone(),
            exclusive_transport: self.transport.exclusive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
address = "10.0.0.1:5701"
data_dir = "/var/lib/wolfgroup"

[groups]
auto_join = ["ops"]

[transport]
channel_capacity = 64
"#;

        let config = WolfGroupConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.groups.pid, "wolfgroup.groups");
        assert_eq!(config.groups.groups_key, "groups");
        assert_eq!(config.groups.default_group, "default");
        assert_eq!(config.groups.reserved_prefixes, vec!["felix.", "service."]);
        assert_eq!(config.groups.auto_join, vec!["ops"]);
        assert!(config.transport.exclusive);
        assert_eq!(config.transport.channel_capacity, 64);
        assert_eq!(config.logging.level, "info");

        let settings = config.group_settings();
        assert_eq!(settings.node_pid, "wolfgroup.node");
        assert_eq!(settings, crate::group::GroupSettings::default());
    }

    #[test]
    fn test_generated_node_id() {
        let toml = r#"
[node]
address = "10.0.0.1:5701"
"#;

        let config = WolfGroupConfig::from_str(toml).unwrap();
        assert!(!config.node.id.is_empty());
        assert_eq!(config.config_db_path(), PathBuf::from("/var/lib/wolfgroup/config.db"));
    }

    #[test]
    fn test_invalid_groups_key() {
        let toml = r#"
[node]
id = "node-1"
address = "10.0.0.1:5701"

[groups]
groups_key = "cluster.groups"
"#;

        assert!(WolfGroupConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_invalid_auto_join() {
        let toml = r#"
[node]
id = "node-1"
address = "10.0.0.1:5701"

[groups]
auto_join = ["ops", "web,db"]
"#;

        assert!(matches!(
            WolfGroupConfig::from_str(toml),
            Err(crate::Error::InvalidGroupName(_))
        ));
    }
}
