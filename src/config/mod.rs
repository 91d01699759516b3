//! Configuration management for the mesh gateway

pub mod file;

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::Result;
use file::{ConfigFile, NodeFileConfig};

/// Name of the configuration file inside the base directory
pub const CONFIG_FILE: &str = "config.yaml";

/// Name of the store file inside the base directory
pub const STORE_FILE: &str = "store.yaml";

/// Mesh gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory holding `config.yaml` and `store.yaml`
    pub basedir: PathBuf,

    /// Broker configuration
    pub mqtt: MqttConfig,

    /// Configured nodes
    pub nodes: Vec<NodeConfig>,

    /// Bulk provisioning configuration
    pub provisioning: ProvisioningConfig,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host (from `MESH_GATEWAY_MQTT_BROKER` env)
    pub broker: String,

    /// Broker port (from `MESH_GATEWAY_MQTT_PORT` env)
    pub port: u16,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Node id segment of discovery topics (from `MESH_GATEWAY_MQTT_TOPIC` env)
    pub topic: String,

    /// Discovery prefix
    pub discovery_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            topic: "mqtt_mesh".to_string(),
            discovery_prefix: "homeassistant".to_string(),
        }
    }
}

/// Per-node configuration resolved by identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Display id used in bus topics
    pub id: Option<String>,

    pub uuid: Option<Uuid>,

    /// Friendly name
    pub name: Option<String>,

    /// Node class tag overriding the stored one
    pub device_type: Option<String>,

    /// Enable the relay feature during configuration
    pub relay: bool,

    pub brightness_min: u32,

    /// Lightness that maps to 100% brightness on the bus
    pub brightness_max: u32,

    pub min_mireds: u32,
    pub max_mireds: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            uuid: None,
            name: None,
            device_type: None,
            relay: false,
            brightness_min: 0,
            brightness_max: 100,
            min_mireds: 238,
            max_mireds: 454,
        }
    }
}

impl NodeConfig {
    fn from_file(id: &str, entry: &NodeFileConfig) -> Self {
        let defaults = Self::default();
        Self {
            id: Some(id.to_string()),
            uuid: Some(entry.uuid),
            name: entry.name.clone(),
            device_type: entry.device_type.clone(),
            relay: entry.relay,
            brightness_min: entry.brightness_min.unwrap_or(defaults.brightness_min),
            brightness_max: entry
                .brightness_max
                .filter(|max| *max > 0)
                .unwrap_or(defaults.brightness_max),
            min_mireds: entry.min_mireds.unwrap_or(defaults.min_mireds),
            max_mireds: entry.max_mireds.unwrap_or(defaults.max_mireds),
        }
    }

    /// Whether the node has an entry in the configuration file
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.uuid.is_some()
    }
}

/// Bulk provisioning configuration
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Delay between consecutive provisioning requests
    pub pace: std::time::Duration,

    /// Duration of an unprovisioned scan in seconds
    pub scan_seconds: u16,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            pace: std::time::Duration::from_secs(1),
            scan_seconds: 10,
        }
    }
}

/// Default base directory: `<config_dir>/mesh-gateway`
#[must_use]
pub fn default_basedir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".mesh-gateway"),
        |d| d.config_dir().join("mesh-gateway"),
    )
}

impl GatewayConfig {
    /// Load configuration from `<basedir>/config.yaml` with env overrides
    ///
    /// # Errors
    ///
    /// Returns error if the configuration file exists but is invalid
    pub fn load(basedir: &Path) -> Result<Self> {
        let fc = file::load_config_file(&basedir.join(CONFIG_FILE))?;
        Ok(Self::from_file(basedir, fc))
    }

    /// Resolve a parsed file (env > file > default)
    #[must_use]
    pub fn from_file(basedir: &Path, fc: ConfigFile) -> Self {
        let defaults = MqttConfig::default();

        let mqtt = MqttConfig {
            broker: std::env::var("MESH_GATEWAY_MQTT_BROKER")
                .ok()
                .or(fc.mqtt.broker)
                .unwrap_or(defaults.broker),
            port: std::env::var("MESH_GATEWAY_MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(fc.mqtt.port)
                .unwrap_or(defaults.port),
            username: std::env::var("MESH_GATEWAY_MQTT_USERNAME")
                .ok()
                .or(fc.mqtt.username),
            password: std::env::var("MESH_GATEWAY_MQTT_PASSWORD")
                .ok()
                .or(fc.mqtt.password),
            topic: std::env::var("MESH_GATEWAY_MQTT_TOPIC")
                .ok()
                .or(fc.mqtt.topic)
                .unwrap_or(defaults.topic),
            discovery_prefix: fc
                .mqtt
                .discovery_prefix
                .unwrap_or(defaults.discovery_prefix),
        };

        let nodes = fc
            .mesh
            .iter()
            .map(|(id, entry)| NodeConfig::from_file(id, entry))
            .collect();

        let prov_defaults = ProvisioningConfig::default();
        let provisioning = ProvisioningConfig {
            pace: fc
                .provisioning
                .pace_ms
                .map_or(prov_defaults.pace, std::time::Duration::from_millis),
            scan_seconds: fc
                .provisioning
                .scan_seconds
                .unwrap_or(prov_defaults.scan_seconds),
        };

        Self {
            basedir: basedir.to_path_buf(),
            mqtt,
            nodes,
            provisioning,
        }
    }

    /// Configuration with defaults only
    #[must_use]
    pub fn empty(basedir: &Path) -> Self {
        Self::from_file(basedir, ConfigFile::default())
    }

    /// Path of the store file
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.basedir.join(STORE_FILE)
    }

    /// Configuration for the node with the given identity
    ///
    /// A node without an entry gets the default configuration.
    #[must_use]
    pub fn node_config(&self, uuid: Uuid) -> NodeConfig {
        if let Some(config) = self.nodes.iter().find(|n| n.uuid == Some(uuid)) {
            return config.clone();
        }
        tracing::warn!(%uuid, "missing configuration for node");
        NodeConfig::default()
    }

    /// Identities of all configured nodes
    pub fn configured_uuids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.nodes.iter().filter_map(|n| n.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "ecce3aa9-26d5-4c76-9a0b-3a1c2f7d9e10";

    fn parse(yaml: &str) -> GatewayConfig {
        let fc: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        GatewayConfig::from_file(Path::new("/tmp/gw"), fc)
    }

    #[test]
    fn defaults_apply_for_empty_file() {
        let config = GatewayConfig::empty(Path::new("/tmp/gw"));
        assert_eq!(config.mqtt.topic, "mqtt_mesh");
        assert_eq!(config.mqtt.discovery_prefix, "homeassistant");
        assert_eq!(config.provisioning.scan_seconds, 10);
        assert_eq!(config.store_path(), Path::new("/tmp/gw/store.yaml"));
    }

    #[test]
    fn node_config_is_found_by_uuid() {
        let config = parse(&format!(
            "mesh:\n  desk:\n    uuid: {UUID}\n    type: light\n    brightness_max: 255\n"
        ));

        let node = config.node_config(UUID.parse().unwrap());
        assert_eq!(node.id.as_deref(), Some("desk"));
        assert_eq!(node.device_type.as_deref(), Some("light"));
        assert_eq!(node.brightness_max, 255);
        assert_eq!(node.min_mireds, 238);
        assert!(node.is_configured());
    }

    #[test]
    fn unknown_node_gets_default_config() {
        let config = parse("mesh: {}\n");
        let node = config.node_config(Uuid::new_v4());
        assert_eq!(node, NodeConfig::default());
        assert!(!node.is_configured());
    }

    #[test]
    fn zero_brightness_max_falls_back_to_default() {
        let config = parse(&format!(
            "mesh:\n  desk:\n    uuid: {UUID}\n    brightness_max: 0\n"
        ));
        assert_eq!(config.node_config(UUID.parse().unwrap()).brightness_max, 100);
    }
}
