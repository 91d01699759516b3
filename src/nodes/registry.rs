//! Persistent node registry
//!
//! Owns the runtime nodes keyed by identity. The in-memory collection is
//! authoritative; [`Registry::persist`] rewrites the store's node section
//! from it in full so deletions are reflected on disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use super::{Node, NodeRecord, NodeTypes};
use crate::config::{GatewayConfig, NodeConfig};
use crate::store::Store;
use crate::{Error, Result};

/// Registry of provisioned nodes
#[derive(Debug)]
pub struct Registry {
    store: Arc<Store>,
    config: Arc<GatewayConfig>,
    types: NodeTypes,
    nodes: BTreeMap<Uuid, Arc<Node>>,
}

impl Registry {
    /// Construct every node recorded in the store
    ///
    /// A node type set in the configuration takes precedence over the
    /// stored one.
    ///
    /// # Errors
    ///
    /// Returns error if a stored key is not a UUID or a type tag is unknown
    pub fn load(store: Arc<Store>, config: Arc<GatewayConfig>, types: NodeTypes) -> Result<Self> {
        let records = store.read(|doc| doc.nodes.clone());

        let mut registry = Self {
            store,
            config,
            types,
            nodes: BTreeMap::new(),
        };

        for (key, mut record) in records {
            let uuid = Uuid::parse_str(&key)
                .map_err(|e| Error::Config(format!("invalid node identity \"{key}\": {e}")))?;

            let node_config = registry.config.node_config(uuid);
            if let Some(tag) = &node_config.device_type
                && *tag != record.device_type
            {
                tracing::warn!(
                    %uuid,
                    from = %record.device_type,
                    to = %tag,
                    "node type changed by configuration"
                );
                record.device_type.clone_from(tag);
            }

            let node = registry.make_node(uuid, record, node_config)?;
            registry.nodes.insert(uuid, node);
        }

        tracing::debug!(nodes = registry.nodes.len(), "registry loaded");
        Ok(registry)
    }

    fn make_node(&self, uuid: Uuid, record: NodeRecord, config: NodeConfig) -> Result<Arc<Node>> {
        let class = self
            .types
            .get(&record.device_type)
            .ok_or_else(|| Error::UnknownNodeType {
                uuid,
                tag: record.device_type.clone(),
            })?;
        Ok(Arc::new(Node::new(uuid, record, config, class)))
    }

    /// Construct a node of class `tag` and add it
    ///
    /// An existing node with the same identity is replaced with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownNodeType`] if no class is registered for `tag`,
    /// or [`Error::AddressOverlap`] if another node holds any of the addresses
    pub fn create(&mut self, uuid: Uuid, tag: &str, unicast: u16, count: u16) -> Result<Arc<Node>> {
        let record = NodeRecord::new(tag, unicast, count);

        if let Some(other) = self
            .nodes
            .values()
            .find(|n| n.uuid() != uuid && n.record().overlaps(&record))
        {
            tracing::error!(%uuid, unicast, count, other = %other, "address range overlaps existing node");
            return Err(Error::AddressOverlap {
                uuid,
                unicast,
                other: other.uuid(),
            });
        }

        let node = self.make_node(uuid, record, self.config.node_config(uuid))?;

        if let Some(existing) = self.nodes.get(&uuid) {
            tracing::warn!(node = %existing, "node already exists, replacing");
        }

        self.nodes.insert(uuid, Arc::clone(&node));
        tracing::info!(node = %node, tag, "node created");
        Ok(node)
    }

    #[must_use]
    pub fn get(&self, uuid: Uuid) -> Option<Arc<Node>> {
        self.nodes.get(&uuid).cloned()
    }

    #[must_use]
    pub fn has(&self, uuid: Uuid) -> bool {
        self.nodes.contains_key(&uuid)
    }

    /// Remove a node; addresses are not reclaimed
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if no node has this identity
    pub fn delete(&mut self, uuid: Uuid) -> Result<Arc<Node>> {
        let node = self.nodes.remove(&uuid).ok_or(Error::NodeNotFound(uuid))?;
        tracing::info!(node = %node, "node deleted");
        Ok(node)
    }

    /// Rewrite the store's node section from the registry and persist
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    pub fn persist(&self) -> Result<()> {
        self.store.update(|doc| {
            doc.nodes.clear();
            for node in self.nodes.values() {
                doc.nodes.insert(node.uuid().to_string(), node.record());
            }
        });
        self.store.persist()
    }

    /// Snapshot of all nodes at call time
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.values().cloned().collect()
    }

    /// Durable records keyed by identity
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<Uuid, NodeRecord> {
        self.nodes
            .iter()
            .map(|(uuid, node)| (*uuid, node.record()))
            .collect()
    }

    /// Drop all nodes from memory
    pub fn reset(&mut self) {
        self.nodes.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }
}
