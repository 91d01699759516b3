//! Mesh key material
//!
//! Keys are stored hex-encoded in the store's `keychain` section. Missing
//! keys are generated on first start and remembered as new so they can be
//! imported into the mesh stack.

use std::collections::BTreeSet;

use rand::RngCore;

use crate::store::KeychainRecord;
use crate::{Error, Result};

/// Application key index used for all client and server models
pub const APP_KEY_INDEX: u16 = 0;

/// Primary network key index
pub const PRIMARY_NET_INDEX: u16 = 0;

/// 128-bit mesh key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MeshKey([u8; 16]);

impl MeshKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a random key
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub const fn bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex encoding
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn from_hex(name: &'static str, value: &str) -> Result<Self> {
        let bytes = hex::decode(value.trim()).map_err(|e| Error::InvalidKey {
            name,
            reason: e.to_string(),
        })?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|v: Vec<u8>| Error::InvalidKey {
            name,
            reason: format!("expected 16 bytes, got {}", v.len()),
        })?;
        Ok(Self(bytes))
    }
}

// Keys never end up in logs
impl std::fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MeshKey(..)")
    }
}

/// Application key with its indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppKey {
    pub index: u16,
    pub net_index: u16,
    pub key: MeshKey,
}

/// Keychain entry names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyKind {
    Device,
    Network,
    Application,
}

impl KeyKind {
    const fn field(self) -> &'static str {
        match self {
            Self::Device => "device_key",
            Self::Network => "network_key",
            Self::Application => "app_key",
        }
    }
}

/// Loaded key material
#[derive(Debug, Clone)]
pub struct Keychain {
    device_key: MeshKey,
    network_key: MeshKey,
    app_key: AppKey,
    new_keys: BTreeSet<KeyKind>,
}

impl Keychain {
    /// Load keys from the record, generating and writing back missing ones
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if a stored key is not 16 hex-encoded bytes
    pub fn load_or_generate(record: &mut KeychainRecord) -> Result<Self> {
        let mut new_keys = BTreeSet::new();

        let device_key = load_key(&mut record.device_key, KeyKind::Device, &mut new_keys)?;
        let network_key = load_key(&mut record.network_key, KeyKind::Network, &mut new_keys)?;
        let app_key = load_key(&mut record.app_key, KeyKind::Application, &mut new_keys)?;

        Ok(Self {
            device_key,
            network_key,
            app_key: AppKey {
                index: APP_KEY_INDEX,
                net_index: PRIMARY_NET_INDEX,
                key: app_key,
            },
            new_keys,
        })
    }

    #[must_use]
    pub const fn device_key(&self) -> &MeshKey {
        &self.device_key
    }

    /// Primary network key and its index
    #[must_use]
    pub const fn primary_net_key(&self) -> (u16, &MeshKey) {
        (PRIMARY_NET_INDEX, &self.network_key)
    }

    #[must_use]
    pub const fn app_key(&self) -> &AppKey {
        &self.app_key
    }

    /// Whether the key was generated during this start
    #[must_use]
    pub fn is_new(&self, kind: KeyKind) -> bool {
        self.new_keys.contains(&kind)
    }

    /// Treat network and application keys as new so they are re-imported
    pub fn force_reload(&mut self) {
        self.new_keys.insert(KeyKind::Network);
        self.new_keys.insert(KeyKind::Application);
    }
}

fn load_key(
    slot: &mut Option<String>,
    kind: KeyKind,
    new_keys: &mut BTreeSet<KeyKind>,
) -> Result<MeshKey> {
    if let Some(value) = slot.as_deref() {
        return MeshKey::from_hex(kind.field(), value);
    }

    tracing::info!(key = kind.field(), "generating key");
    let key = MeshKey::generate();
    *slot = Some(key.to_hex());
    new_keys.insert(kind);
    Ok(key)
}
