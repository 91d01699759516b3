//! Mesh stack collaborator
//!
//! The mesh protocol stack (key management, transport, provisioning
//! handshake) is external. The gateway talks to it through
//! [`MeshInterface`] and receives its callbacks through [`MeshApplication`].

mod composition;
mod sim;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

pub use composition::{Composition, Element};
pub use sim::{SimDevice, SimulatedMesh};

use crate::keychain::{AppKey, MeshKey};
use crate::{Error, Result};

/// Per-address results of a model RPC
///
/// Each answering address maps to its own result; an address that did not
/// answer is absent.
pub type AddressResults<T> = BTreeMap<u16, std::result::Result<T, String>>;

/// Extra scan result information
pub type ScanOptions = HashMap<String, String>;

/// SIG model identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u32);

impl ModelId {
    pub const CONFIG_SERVER: Self = Self(0x0000);
    pub const CONFIG_CLIENT: Self = Self(0x0001);
    pub const HEALTH_SERVER: Self = Self(0x0002);
    pub const HEALTH_CLIENT: Self = Self(0x0003);
    pub const GENERIC_ONOFF_SERVER: Self = Self(0x1000);
    pub const GENERIC_ONOFF_CLIENT: Self = Self(0x1001);
    pub const LIGHT_LIGHTNESS_SERVER: Self = Self(0x1300);
    pub const LIGHT_LIGHTNESS_CLIENT: Self = Self(0x1302);
    pub const LIGHT_CTL_SERVER: Self = Self(0x1303);
    pub const LIGHT_CTL_CLIENT: Self = Self(0x1305);

    /// Client models of the gateway's main element that need the app key
    pub const BOUND_CLIENTS: [Self; 3] = [
        Self::GENERIC_ONOFF_CLIENT,
        Self::LIGHT_LIGHTNESS_CLIENT,
        Self::LIGHT_CTL_CLIENT,
    ];
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::CONFIG_SERVER => "ConfigServer",
            Self::CONFIG_CLIENT => "ConfigClient",
            Self::HEALTH_SERVER => "HealthServer",
            Self::HEALTH_CLIENT => "HealthClient",
            Self::GENERIC_ONOFF_SERVER => "GenericOnOffServer",
            Self::GENERIC_ONOFF_CLIENT => "GenericOnOffClient",
            Self::LIGHT_LIGHTNESS_SERVER => "LightLightnessServer",
            Self::LIGHT_LIGHTNESS_CLIENT => "LightLightnessClient",
            Self::LIGHT_CTL_SERVER => "LightCTLServer",
            Self::LIGHT_CTL_CLIENT => "LightCTLClient",
            Self(id) => return write!(f, "Model({id:#06x})"),
        };
        f.write_str(name)
    }
}

/// Light CTL status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtlStatus {
    pub lightness: u16,
    /// Kelvin
    pub temperature: u16,
}

/// Operations offered by the mesh stack
#[async_trait]
pub trait MeshInterface: Send + Sync {
    /// Attach to the mesh daemon
    async fn connect(&self) -> Result<()>;

    /// Detach from the mesh daemon
    async fn disconnect(&self) -> Result<()>;

    /// Leave the network, dropping the local node
    async fn leave(&self) -> Result<()>;

    /// Register a network key as subnet key
    async fn import_subnet(&self, net_index: u16, key: &MeshKey) -> Result<()>;

    /// Import an application key into the daemon's key database
    async fn import_app_key(&self, key: &AppKey) -> Result<()>;

    /// Add an application key to the local node
    async fn add_app_key(&self, key: &AppKey) -> Result<()>;

    /// Remove an application key from the local node
    async fn delete_app_key(&self, key: &AppKey) -> Result<()>;

    /// Bind a local client model to an application key
    async fn bind_client_model(&self, model: ModelId, app_key_index: u16) -> Result<()>;

    /// Start provisioning the device with the given identity
    ///
    /// Completion is reported through [`MeshApplication::add_node_complete`]
    /// or [`MeshApplication::add_node_failed`].
    async fn add_node(&self, uuid: Uuid) -> Result<()>;

    /// Scan for unprovisioned devices; results arrive via
    /// [`MeshApplication::scan_result`]
    async fn unprovisioned_scan(&self, seconds: u16) -> Result<()>;

    /// Config client: read composition data page zero
    async fn get_composition_data(
        &self,
        addresses: &[u16],
        net_index: u16,
    ) -> Result<AddressResults<Composition>>;

    /// Config client: read default TTL
    async fn get_default_ttl(&self, addresses: &[u16], net_index: u16)
    -> Result<AddressResults<u8>>;

    /// Config client: bind a remote model to an application key
    async fn bind_app_key(
        &self,
        destination: u16,
        net_index: u16,
        element_address: u16,
        app_key_index: u16,
        model: ModelId,
    ) -> Result<()>;

    /// Config client: add an application key to a remote node
    async fn add_node_app_key(&self, destination: u16, key: &AppKey) -> Result<()>;

    /// Config client: delete an application key from a remote node
    async fn delete_node_app_key(&self, destination: u16, key: &AppKey) -> Result<()>;

    /// Config client: set the relay feature
    async fn set_relay(
        &self,
        destination: u16,
        net_index: u16,
        relay: bool,
        retransmit_count: u8,
    ) -> Result<()>;

    /// Config client: factory-reset a remote node
    async fn node_reset(&self, destination: u16, net_index: u16) -> Result<()>;

    /// Generic on/off client: read present state
    async fn get_onoff(&self, addresses: &[u16], app_key_index: u16)
    -> Result<AddressResults<bool>>;

    /// Generic on/off client: set without acknowledgement
    async fn set_onoff_unack(
        &self,
        destination: u16,
        app_key_index: u16,
        onoff: bool,
        transition_time: Duration,
    ) -> Result<()>;

    /// Light lightness client: read present lightness
    async fn get_lightness(
        &self,
        addresses: &[u16],
        app_key_index: u16,
    ) -> Result<AddressResults<u16>>;

    /// Light lightness client: set without acknowledgement
    async fn set_lightness_unack(
        &self,
        destination: u16,
        app_key_index: u16,
        lightness: u16,
        transition_time: Duration,
    ) -> Result<()>;

    /// Light CTL client: read present lightness and temperature
    async fn get_ctl(&self, addresses: &[u16], app_key_index: u16)
    -> Result<AddressResults<CtlStatus>>;

    /// Light CTL client: set without acknowledgement
    async fn set_ctl_unack(
        &self,
        destination: u16,
        app_key_index: u16,
        temperature: u16,
        lightness: u16,
        transition_time: Duration,
    ) -> Result<()>;
}

/// Callbacks the mesh stack invokes on the gateway
///
/// All callbacks are synchronous; [`MeshApplication::request_prov_data`]
/// must answer before the handshake can continue.
pub trait MeshApplication: Send + Sync {
    /// An unprovisioned device was seen
    fn scan_result(&self, rssi: i16, data: &[u8], options: &ScanOptions);

    /// Assign `count` consecutive addresses; returns `(net_index, first_address)`
    ///
    /// # Errors
    ///
    /// Returns error if no addresses can be allocated
    fn request_prov_data(&self, count: u16) -> Result<(u16, u16)>;

    /// Provisioning of `uuid` finished
    fn add_node_complete(&self, uuid: &[u8], unicast: u16, count: u16);

    /// Provisioning of `uuid` failed
    fn add_node_failed(&self, uuid: &[u8], reason: &str);
}

/// Shared mesh handle with the gateway's application key
#[derive(Clone)]
pub struct MeshClient {
    interface: Arc<dyn MeshInterface>,
    app_key: AppKey,
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("app_key_index", &self.app_key.index)
            .finish_non_exhaustive()
    }
}

impl MeshClient {
    #[must_use]
    pub fn new(interface: Arc<dyn MeshInterface>, app_key: AppKey) -> Self {
        Self { interface, app_key }
    }

    #[must_use]
    pub fn interface(&self) -> &dyn MeshInterface {
        self.interface.as_ref()
    }

    #[must_use]
    pub const fn app_key(&self) -> &AppKey {
        &self.app_key
    }

    #[must_use]
    pub const fn app_key_index(&self) -> u16 {
        self.app_key.index
    }

    #[must_use]
    pub const fn net_index(&self) -> u16 {
        self.app_key.net_index
    }

    /// Add the application key to the local node
    ///
    /// A stale key with the same index is deleted and the add retried once.
    ///
    /// # Errors
    ///
    /// Returns error if the retry fails as well
    pub async fn add_app_key(&self) -> Result<()> {
        if let Err(e) = self.interface.add_app_key(&self.app_key).await {
            tracing::warn!(
                key_index = self.app_key.index,
                error = %e,
                "failed to add app key, re-adding"
            );
            self.interface.delete_app_key(&self.app_key).await?;
            self.interface.add_app_key(&self.app_key).await?;
        }
        Ok(())
    }

    /// Add the application key to a remote node, deleting and re-adding
    /// once on failure
    ///
    /// # Errors
    ///
    /// Returns error if the retry fails as well
    pub async fn add_node_app_key(&self, destination: u16) -> Result<()> {
        if let Err(e) = self
            .interface
            .add_node_app_key(destination, &self.app_key)
            .await
        {
            tracing::warn!(
                destination,
                error = %e,
                "failed to add app key to node, re-adding"
            );
            self.interface
                .delete_node_app_key(destination, &self.app_key)
                .await?;
            self.interface
                .add_node_app_key(destination, &self.app_key)
                .await?;
        }
        Ok(())
    }
}

/// Pick the result for `address` out of a per-address answer
///
/// Missing answers and per-address errors are logged and yield `None`.
pub fn address_result<T: std::fmt::Debug>(
    call: &'static str,
    mut results: AddressResults<T>,
    address: u16,
) -> Option<T> {
    match results.remove(&address) {
        Some(Ok(value)) => {
            tracing::debug!(call, address, ?value, "mesh call result");
            Some(value)
        }
        Some(Err(reason)) => {
            tracing::warn!(call, address, error = %Error::mesh(call, reason), "mesh call failed for address");
            None
        }
        None => {
            tracing::warn!(call, address, "no result for address");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_display_names() {
        assert_eq!(ModelId::LIGHT_CTL_SERVER.to_string(), "LightCTLServer");
        assert_eq!(ModelId(0x1234).to_string(), "Model(0x1234)");
    }

    #[test]
    fn address_result_picks_matching_entry() {
        let mut results: AddressResults<u16> = BTreeMap::new();
        results.insert(4, Ok(100));
        results.insert(5, Err("timeout".to_string()));

        assert_eq!(address_result("get_lightness", results.clone(), 4), Some(100));
        assert_eq!(address_result("get_lightness", results.clone(), 5), None);
        assert_eq!(address_result("get_lightness", results, 6), None);
    }
}
