//! Persistent gateway state
//!
//! A single YAML document (`store.yaml`) holds the keychain, local
//! application parameters, the node collection and the provisioning
//! address watermark. Every [`Store::persist`] rewrites the whole document.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::nodes::NodeRecord;

/// First unicast address handed out to provisioned nodes
pub const DEFAULT_BASE_ADDRESS: u16 = 4;

/// Hex-encoded key material
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeychainRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
}

/// Parameters of the gateway's own mesh application node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    #[serde(default = "default_local_address")]
    pub address: u16,
    #[serde(default = "default_iv_index")]
    pub iv_index: u32,
}

impl Default for LocalRecord {
    fn default() -> Self {
        Self {
            address: default_local_address(),
            iv_index: default_iv_index(),
        }
    }
}

const fn default_local_address() -> u16 {
    1
}

const fn default_iv_index() -> u32 {
    5
}

/// Provisioner state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerRecord {
    /// Next unicast address to hand out
    #[serde(default = "default_base_address")]
    pub base_address: u16,
}

impl Default for ProvisionerRecord {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
        }
    }
}

const fn default_base_address() -> u16 {
    DEFAULT_BASE_ADDRESS
}

/// The complete on-disk document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub keychain: KeychainRecord,
    #[serde(default)]
    pub local: LocalRecord,
    /// Node records keyed by identity string
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeRecord>,
    #[serde(default)]
    pub prov: ProvisionerRecord,
}

/// Durable store backed by a YAML file (or memory only)
#[derive(Debug)]
pub struct Store {
    path: Option<PathBuf>,
    document: Mutex<StoreDocument>,
}

impl Store {
    /// Open the store at `path`, starting from an empty document if the
    /// file does not exist yet
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let document = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                StoreDocument::default()
            } else {
                serde_yaml::from_str(&content)?
            }
        } else {
            tracing::info!(path = %path.display(), "creating new store");
            StoreDocument::default()
        };

        Ok(Self {
            path: Some(path),
            document: Mutex::new(document),
        })
    }

    /// Store that is never written to disk
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Mutex::new(StoreDocument::default()),
        }
    }

    /// Location of the backing file
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read from the current document
    pub fn read<R>(&self, f: impl FnOnce(&StoreDocument) -> R) -> R {
        let document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        f(&document)
    }

    /// Mutate the current document; changes are in memory until
    /// [`Store::persist`]
    pub fn update<R>(&self, f: impl FnOnce(&mut StoreDocument) -> R) -> R {
        let mut document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut document)
    }

    /// Rewrite the whole document to disk
    ///
    /// The document is written to a temporary file next to the target and
    /// renamed over it, so readers never observe a partial write.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the file write fails
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = self.read(serde_yaml::to_string)?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(content.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path)?;

        tracing::debug!(path = %path.display(), "store persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.yaml")).unwrap();

        store.read(|doc| {
            assert_eq!(doc.local.address, 1);
            assert_eq!(doc.local.iv_index, 5);
            assert_eq!(doc.prov.base_address, DEFAULT_BASE_ADDRESS);
            assert!(doc.nodes.is_empty());
        });
    }

    #[test]
    fn persist_round_trips_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.yaml");

        let store = Store::open(&path).unwrap();
        store.update(|doc| {
            doc.keychain.app_key = Some("00112233445566778899aabbccddeeff".to_string());
            doc.prov.base_address = 42;
        });
        store.persist().unwrap();

        let reopened = Store::open(&path).unwrap();
        reopened.read(|doc| {
            assert_eq!(doc.prov.base_address, 42);
            assert_eq!(
                doc.keychain.app_key.as_deref(),
                Some("00112233445566778899aabbccddeeff")
            );
        });
    }

    #[test]
    fn persist_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.yaml");

        let store = Store::open(&path).unwrap();
        store.update(|doc| {
            doc.nodes.insert(
                "a".to_string(),
                NodeRecord::new("generic", 4, 1),
            );
        });
        store.persist().unwrap();

        store.update(|doc| doc.nodes.clear());
        store.persist().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("generic"));
    }

    #[test]
    fn in_memory_store_never_touches_disk() {
        let store = Store::in_memory();
        assert!(store.path().is_none());
        store.persist().unwrap();
    }
}
