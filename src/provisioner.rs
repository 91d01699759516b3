//! Provisioning, key configuration and reset of nodes
//!
//! Provisioning is split between a request ([`Provisioner::provision`]) and
//! the mesh stack's callbacks, which arrive on the gateway's
//! [`MeshApplication`](crate::mesh::MeshApplication) implementation and are
//! forwarded here. A one-shot waiter per device connects the two.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::context::Context;
use crate::nodes::Node;
use crate::{Error, Result};

/// Type tag of freshly provisioned nodes
pub const PROVISIONED_TYPE: &str = "generic";

/// Network retransmissions when enabling the relay feature
const RELAY_RETRANSMIT_COUNT: u8 = 2;

type Waiter = oneshot::Sender<Result<()>>;

/// Provisions, configures and resets nodes
#[derive(Debug)]
pub struct Provisioner {
    context: Arc<Context>,
    waiters: Mutex<HashMap<Uuid, Waiter>>,
}

impl Provisioner {
    #[must_use]
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            context,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Provision the device with identity `uuid` and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProvisioningFailed`] if the mesh stack reports a
    /// failure, or the error of the `add_node` request itself
    pub async fn provision(&self, uuid: Uuid) -> Result<Arc<Node>> {
        tracing::info!(%uuid, "provisioning node");

        let (tx, rx) = oneshot::channel();
        if self.waiters().insert(uuid, tx).is_some() {
            tracing::warn!(%uuid, "replacing pending provisioning waiter");
        }

        if let Err(e) = self.context.mesh().interface().add_node(uuid).await {
            self.waiters().remove(&uuid);
            return Err(e);
        }

        rx.await.map_err(|_| Error::ProvisioningFailed {
            uuid,
            reason: "provisioning abandoned".to_string(),
        })??;

        self.context.node(uuid).ok_or(Error::NodeNotFound(uuid))
    }

    /// Provision every configured node that is not in the registry yet
    ///
    /// Requests are paced by the configured delay. A device that fails to
    /// provision is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns error if a request cannot be issued at all
    pub async fn provision_configured(&self) -> Result<Vec<Uuid>> {
        let config = self.context.config();
        let pending: Vec<Uuid> = config
            .configured_uuids()
            .filter(|uuid| !self.context.registry().has(*uuid))
            .collect();

        let mut provisioned = Vec::new();
        for (index, uuid) in pending.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(config.provisioning.pace).await;
            }
            match self.provision(uuid).await {
                Ok(_) => provisioned.push(uuid),
                Err(e @ Error::ProvisioningFailed { .. }) => {
                    tracing::warn!(%uuid, error = %e, "skipping node");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(provisioned)
    }

    /// Answer the stack's request for `count` unicast addresses
    ///
    /// # Errors
    ///
    /// Returns error if the address space is exhausted or the store cannot
    /// be written
    pub fn request_prov_data(&self, count: u16) -> Result<(u16, u16)> {
        tracing::info!(count, "provisioning new address(es)");
        self.context.allocator().allocate(count)
    }

    /// Record a provisioned device and release its waiter
    pub fn add_node_complete(&self, uuid: &[u8], unicast: u16, count: u16) {
        let Ok(uuid) = Uuid::from_slice(uuid) else {
            tracing::error!(uuid = %hex::encode(uuid), "provisioned device has malformed identity");
            return;
        };

        let result = {
            let mut registry = self.context.registry();
            registry
                .create(uuid, PROVISIONED_TYPE, unicast, count)
                .and_then(|_| registry.persist())
        };

        match &result {
            Ok(()) => tracing::info!(%uuid, unicast, count, "provisioned node"),
            Err(e) => tracing::error!(%uuid, error = %e, "failed to record provisioned node"),
        }
        self.resolve(uuid, result);
    }

    /// Release the waiter of a device whose provisioning failed
    pub fn add_node_failed(&self, uuid: &[u8], reason: &str) {
        let Ok(uuid) = Uuid::from_slice(uuid) else {
            tracing::error!(uuid = %hex::encode(uuid), reason, "provisioning failed");
            return;
        };

        tracing::error!(%uuid, reason, "provisioning failed");
        self.resolve(
            uuid,
            Err(Error::ProvisioningFailed {
                uuid,
                reason: reason.to_string(),
            }),
        );
    }

    fn resolve(&self, uuid: Uuid, result: Result<()>) {
        match self.waiters().remove(&uuid) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => tracing::debug!(%uuid, "no one waiting for provisioning result"),
        }
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the application key to `node` and apply its configuration
    ///
    /// Enables the relay feature when configured and takes over the
    /// configured type, which selects the node class on the next start.
    ///
    /// # Errors
    ///
    /// Returns error if a mesh call fails or the store cannot be written
    pub async fn configure(&self, node: &Node) -> Result<()> {
        tracing::info!(node = %node, "configuring node");

        let mesh = self.context.mesh();
        mesh.add_node_app_key(node.unicast()).await?;

        if node.config().relay {
            mesh.interface()
                .set_relay(node.unicast(), mesh.net_index(), true, RELAY_RETRANSMIT_COUNT)
                .await?;
            tracing::info!(node = %node, "relay enabled");
        }

        if let Some(tag) = &node.config().device_type {
            node.set_device_type(tag);
        }
        node.set_configured(true);

        self.context.registry().persist()
    }

    /// Configure every node that has not been configured yet
    ///
    /// # Errors
    ///
    /// Returns the first configuration failure
    pub async fn configure_pending(&self) -> Result<()> {
        for node in self.context.nodes() {
            if !node.is_configured() {
                self.configure(&node).await?;
            }
        }
        Ok(())
    }

    /// Factory-reset `node` and forget it
    ///
    /// # Errors
    ///
    /// Returns error if the reset call fails or the store cannot be written
    pub async fn reset(&self, node: &Node) -> Result<()> {
        tracing::info!(node = %node, "resetting node");

        let mesh = self.context.mesh();
        mesh.interface()
            .node_reset(node.unicast(), mesh.net_index())
            .await?;

        let mut registry = self.context.registry();
        registry.delete(node.uuid())?;
        registry.persist()
    }

    /// Reset every node without a configuration entry
    ///
    /// # Errors
    ///
    /// Returns the first reset failure
    pub async fn reset_unconfigured(&self) -> Result<()> {
        for node in self.context.nodes() {
            if !node.config().is_configured() {
                self.reset(&node).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::config::file::ConfigFile;
    use crate::mesh::{SimDevice, SimulatedMesh};
    use crate::nodes::NodeTypes;
    use crate::store::Store;

    fn context(sim: &Arc<SimulatedMesh>, yaml: &str) -> Arc<Context> {
        let fc: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let config = GatewayConfig::from_file(Path::new("/tmp"), fc);
        Arc::new(
            Context::new(config, Store::in_memory(), sim.clone(), NodeTypes::default()).unwrap(),
        )
    }

    #[tokio::test]
    async fn completion_records_generic_node_and_wakes_waiter() {
        let sim = Arc::new(SimulatedMesh::new());
        let provisioner = Provisioner::new(context(&sim, "{}"));
        let uuid = Uuid::new_v4();

        let (tx, rx) = oneshot::channel();
        provisioner.waiters().insert(uuid, tx);

        let (net, first) = provisioner.request_prov_data(1).unwrap();
        provisioner.add_node_complete(uuid.as_bytes(), first, 1);

        rx.await.unwrap().unwrap();
        assert_eq!((net, first), (0, 4));

        let node = provisioner.context.node(uuid).unwrap();
        assert_eq!(node.device_type(), "generic");
        assert_eq!(node.unicast(), 4);
        assert!(!node.is_configured());
    }

    #[tokio::test]
    async fn failure_reaches_waiter() {
        let sim = Arc::new(SimulatedMesh::new());
        let provisioner = Provisioner::new(context(&sim, "{}"));
        let uuid = Uuid::new_v4();

        let (tx, rx) = oneshot::channel();
        provisioner.waiters().insert(uuid, tx);
        provisioner.add_node_failed(uuid.as_bytes(), "timeout");

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ProvisioningFailed { reason, .. } if reason == "timeout"));
        assert!(provisioner.context.node(uuid).is_none());
    }

    #[tokio::test]
    async fn configure_applies_relay_and_type() {
        let uuid = Uuid::new_v4();
        let sim = Arc::new(SimulatedMesh::new());
        sim.adopt_device(SimDevice::light(uuid), 4);

        let context = context(
            &sim,
            &format!("mesh:\n  desk:\n    uuid: {uuid}\n    type: light\n    relay: true\n"),
        );
        let node = context.registry().create(uuid, "generic", 4, 1).unwrap();

        // A stale key on the device forces the delete-and-readd path
        sim.fail_next("add_node_app_key", 1);

        let provisioner = Provisioner::new(Arc::clone(&context));
        provisioner.configure(&node).await.unwrap();

        let device = sim.device(uuid).unwrap();
        assert!(device.relay);
        assert!(device.app_keys.contains(&0));
        assert!(sim.calls().contains(&"delete_node_app_key"));

        let stored = context.store().read(|doc| doc.nodes[&uuid.to_string()].clone());
        assert!(stored.configured);
        assert_eq!(stored.device_type, "light");
    }

    #[tokio::test]
    async fn reset_unconfigured_keeps_configured_nodes() {
        let keep = Uuid::new_v4();
        let stray = Uuid::new_v4();
        let sim = Arc::new(SimulatedMesh::new());
        sim.adopt_device(SimDevice::switch(keep), 4);
        sim.adopt_device(SimDevice::switch(stray), 5);

        let context = context(&sim, &format!("mesh:\n  keep:\n    uuid: {keep}\n"));
        context.registry().create(keep, "generic", 4, 1).unwrap();
        context.registry().create(stray, "generic", 5, 1).unwrap();

        let provisioner = Provisioner::new(Arc::clone(&context));
        provisioner.reset_unconfigured().await.unwrap();

        assert!(context.node(keep).is_some());
        assert!(context.node(stray).is_none());
        assert_eq!(sim.device(stray).unwrap().unicast, None);
        assert_eq!(context.store().read(|doc| doc.nodes.len()), 1);
    }
}
