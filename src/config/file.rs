//! YAML configuration file loading
//!
//! Supports `<basedir>/config.yaml` as the persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use uuid::Uuid;

use crate::{Error, Result};

/// Top-level YAML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Broker and discovery settings
    #[serde(default)]
    pub mqtt: MqttFileConfig,

    /// Per-node settings keyed by display id
    #[serde(default)]
    pub mesh: BTreeMap<String, NodeFileConfig>,

    /// Bulk provisioning settings
    #[serde(default)]
    pub provisioning: ProvisioningFileConfig,
}

/// Broker configuration
#[derive(Debug, Default, Deserialize)]
pub struct MqttFileConfig {
    pub broker: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Node id segment of discovery topics
    pub topic: Option<String>,

    /// Discovery prefix (e.g. "homeassistant")
    pub discovery_prefix: Option<String>,
}

/// One entry of the `mesh` section
#[derive(Debug, Clone, Deserialize)]
pub struct NodeFileConfig {
    pub uuid: Uuid,
    pub name: Option<String>,

    /// Node class tag applied when the node is configured
    #[serde(rename = "type")]
    pub device_type: Option<String>,

    #[serde(default)]
    pub relay: bool,

    pub brightness_min: Option<u32>,
    pub brightness_max: Option<u32>,
    pub min_mireds: Option<u32>,
    pub max_mireds: Option<u32>,
}

/// Bulk provisioning configuration
#[derive(Debug, Default, Deserialize)]
pub struct ProvisioningFileConfig {
    /// Delay between consecutive provisioning requests
    pub pace_ms: Option<u64>,

    /// Duration of an unprovisioned scan
    pub scan_seconds: Option<u16>,
}

/// Load the YAML config file at `path`
///
/// Returns `ConfigFile::default()` if the file doesn't exist.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or parsed
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(ConfigFile::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    if content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }

    let config = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;

    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_schema() {
        let yaml = r"
mqtt:
  broker: broker.local
  port: 8883
  topic: kitchen
mesh:
  ceiling:
    uuid: ecce3aa9-26d5-4c76-9a0b-3a1c2f7d9e10
    name: Ceiling
    type: light
    relay: true
    brightness_max: 255
provisioning:
  pace_ms: 250
";
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(file.mqtt.broker.as_deref(), Some("broker.local"));
        assert_eq!(file.mqtt.port, Some(8883));
        assert_eq!(file.provisioning.pace_ms, Some(250));

        let ceiling = &file.mesh["ceiling"];
        assert_eq!(ceiling.device_type.as_deref(), Some("light"));
        assert!(ceiling.relay);
        assert_eq!(ceiling.brightness_max, Some(255));
        assert_eq!(ceiling.min_mireds, None);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_config_file(&dir.path().join("config.yaml")).unwrap();
        assert!(file.mesh.is_empty());
        assert!(file.mqtt.broker.is_none());
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "mesh: [unterminated").unwrap();

        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }
}
