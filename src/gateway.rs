//! Gateway - the mesh application and its run loop
//!
//! The gateway is the [`MeshApplication`] the mesh stack calls back into.
//! Its run loop binds every node, then bridges them to the bus under one
//! supervisor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::bridge::BridgeSet;
use crate::bus::{BusClient, Messenger};
use crate::context::Context;
use crate::keychain::KeyKind;
use crate::manager::Manager;
use crate::mesh::{MeshApplication, ModelId, ScanOptions};
use crate::provisioner::Provisioner;
use crate::scanner::Scanner;
use crate::supervisor::Supervisor;

/// The mesh gateway application
pub struct Gateway {
    context: Arc<Context>,
    provisioner: Provisioner,
    scanner: Scanner,
    manager: Manager,
    bus: Arc<dyn BusClient>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("context", &self.context)
            .field("scanner", &self.scanner)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    #[must_use]
    pub fn new(context: Arc<Context>, bus: Arc<dyn BusClient>) -> Self {
        Self {
            provisioner: Provisioner::new(Arc::clone(&context)),
            manager: Manager::new(Arc::clone(&context)),
            scanner: Scanner::new(),
            context,
            bus,
        }
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<Context> {
        &self.context
    }

    #[must_use]
    pub const fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    #[must_use]
    pub const fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    #[must_use]
    pub const fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Attach to the mesh stack and bring the local keys in place
    ///
    /// Adds the application key to the local node (re-adding a stale one
    /// once), imports keys generated during this start (all keys with
    /// `reload`), and binds the client models to the application key.
    ///
    /// # Errors
    ///
    /// Returns error if a mesh call fails
    pub async fn start(&self, reload: bool) -> Result<()> {
        self.connect().await?;

        let mesh = self.context.mesh();
        mesh.add_app_key().await?;

        let mut keychain = self.context.keychain().clone();
        if reload {
            keychain.force_reload();
        }

        if keychain.is_new(KeyKind::Network) {
            let (net_index, key) = keychain.primary_net_key();
            mesh.interface().import_subnet(net_index, key).await?;
            tracing::info!(net_index, "imported primary net key as subnet key");
        }

        if keychain.is_new(KeyKind::Application) {
            mesh.interface().import_app_key(keychain.app_key()).await?;
            tracing::info!(key_index = keychain.app_key().index, "imported app key");
        }

        for model in ModelId::BOUND_CLIENTS {
            mesh.interface()
                .bind_client_model(model, mesh.app_key_index())
                .await?;
            tracing::debug!(%model, "client model bound");
        }

        Ok(())
    }

    /// Attach to the mesh stack
    ///
    /// # Errors
    ///
    /// Returns error if the mesh call fails
    pub async fn connect(&self) -> Result<()> {
        self.context.mesh().interface().connect().await?;
        tracing::info!("attached to mesh");
        Ok(())
    }

    /// Detach from the mesh stack
    ///
    /// # Errors
    ///
    /// Returns error if the mesh call fails
    pub async fn stop(&self) -> Result<()> {
        self.context.mesh().interface().disconnect().await
    }

    /// Leave the mesh and forget every node
    ///
    /// # Errors
    ///
    /// Returns error if leaving fails or the store cannot be written
    pub async fn leave(&self) -> Result<()> {
        self.context.mesh().interface().leave().await?;

        let mut registry = self.context.registry();
        registry.reset();
        registry.persist()?;
        tracing::info!("left mesh network");
        Ok(())
    }

    /// Bind all nodes and bridge them to the bus until cancelled
    ///
    /// Each node is bound in its own task; a node that fails to bind is
    /// logged and never becomes ready. A failing bridge ends the run.
    ///
    /// # Errors
    ///
    /// Returns the first escalated task failure
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut tasks = Supervisor::with_token("gateway", token);
        let nodes = self.context.nodes();

        for node in &nodes {
            let node = Arc::clone(node);
            let mesh = self.context.mesh().clone();
            tasks.spawn(format!("bind {node}"), async move {
                if let Err(e) = node.bind(&mesh).await {
                    tracing::error!(node = %node, error = %e, "failed to bind node");
                }
                Ok(())
            })?;
        }

        let messenger = Arc::new(Messenger::new(
            Arc::clone(&self.bus),
            &self.context.config().mqtt,
        ));
        let bridges = BridgeSet::with_defaults(&messenger, self.context.mesh());
        let count = nodes.len();
        let child = tasks.child_token();
        tasks.spawn("run messenger", messenger.run(nodes, bridges, child))?;

        tracing::info!(nodes = count, "gateway running");
        let result = tasks.gather().await;

        // A cancelled messenger never reaches its own disconnect
        if let Err(e) = self.bus.disconnect().await {
            tracing::warn!(error = %e, "failed to disconnect from bus");
        }
        result
    }
}

impl MeshApplication for Gateway {
    fn scan_result(&self, rssi: i16, data: &[u8], options: &ScanOptions) {
        self.scanner.scan_result(rssi, data, options);
    }

    fn request_prov_data(&self, count: u16) -> Result<(u16, u16)> {
        self.provisioner.request_prov_data(count)
    }

    fn add_node_complete(&self, uuid: &[u8], unicast: u16, count: u16) {
        self.provisioner.add_node_complete(uuid, unicast, count);
    }

    fn add_node_failed(&self, uuid: &[u8], reason: &str) {
        self.provisioner.add_node_failed(uuid, reason);
    }
}
