//! Shared gateway state
//!
//! Everything the provisioner, the management commands and the run loop
//! need: configuration, the store, key material, the node registry, the
//! address allocator and the mesh handle.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::Result;
use crate::allocator::AddressAllocator;
use crate::config::GatewayConfig;
use crate::keychain::Keychain;
use crate::mesh::{MeshClient, MeshInterface};
use crate::nodes::{Node, NodeTypes, Registry};
use crate::store::Store;

/// Gateway state shared between components
#[derive(Debug)]
pub struct Context {
    config: Arc<GatewayConfig>,
    store: Arc<Store>,
    keychain: Keychain,
    registry: Mutex<Registry>,
    allocator: AddressAllocator,
    mesh: MeshClient,
}

impl Context {
    /// Load configuration and store from `basedir`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration, the store or the keys are invalid
    pub fn load(basedir: &Path, interface: Arc<dyn MeshInterface>) -> Result<Self> {
        let config = GatewayConfig::load(basedir)?;
        let store = Store::open(config.store_path())?;
        Self::new(config, store, interface, NodeTypes::default())
    }

    /// Build the context from loaded parts
    ///
    /// Missing keys are generated and the store is persisted before any
    /// node is constructed.
    ///
    /// # Errors
    ///
    /// Returns error if stored keys or nodes are invalid, or the store
    /// cannot be written
    pub fn new(
        config: GatewayConfig,
        store: Store,
        interface: Arc<dyn MeshInterface>,
        types: NodeTypes,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(store);

        let keychain = store.update(|doc| Keychain::load_or_generate(&mut doc.keychain))?;
        store.persist()?;

        let registry = Registry::load(Arc::clone(&store), Arc::clone(&config), types)?;
        let allocator = AddressAllocator::new(Arc::clone(&store));
        let mesh = MeshClient::new(interface, *keychain.app_key());

        tracing::info!(
            basedir = %config.basedir.display(),
            nodes = registry.len(),
            next_address = allocator.watermark(),
            "gateway context loaded"
        );

        Ok(Self {
            config,
            store,
            keychain,
            registry: Mutex::new(registry),
            allocator,
            mesh,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<Store> {
        &self.store
    }

    #[must_use]
    pub const fn keychain(&self) -> &Keychain {
        &self.keychain
    }

    #[must_use]
    pub const fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    #[must_use]
    pub const fn mesh(&self) -> &MeshClient {
        &self.mesh
    }

    /// Lock the registry
    ///
    /// Never hold the guard across an await point.
    pub fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of all nodes
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.registry().all()
    }

    #[must_use]
    pub fn node(&self, uuid: uuid::Uuid) -> Option<Arc<Node>> {
        self.registry().get(uuid)
    }
}
