//! Runtime node

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use super::{NodeClass, NodeRecord, Property, PropertyValue};
use crate::config::NodeConfig;
use crate::mesh::{Composition, MeshClient, ModelId};
use crate::properties::PropertyBus;
use crate::{Error, Result};

/// A provisioned mesh node with its runtime state
pub struct Node {
    uuid: Uuid,
    record: Mutex<NodeRecord>,
    config: NodeConfig,
    class: Arc<dyn NodeClass>,
    properties: PropertyBus,
    ready: watch::Sender<bool>,
    composition: Mutex<Option<Composition>>,
    bound_models: Mutex<HashSet<ModelId>>,
    features: Mutex<HashSet<Property>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("uuid", &self.uuid)
            .field("record", &self.record())
            .field("class", &self.class.name())
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unicast = self.unicast();
        match &self.config.id {
            Some(id) => write!(f, "{id} ({}, {unicast:04x})", self.uuid),
            None => write!(f, "{} ({unicast:04x})", self.uuid),
        }
    }
}

impl Node {
    #[must_use]
    pub fn new(
        uuid: Uuid,
        record: NodeRecord,
        config: NodeConfig,
        class: Arc<dyn NodeClass>,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            uuid,
            record: Mutex::new(record),
            config,
            class,
            properties: PropertyBus::new(),
            ready,
            composition: Mutex::new(None),
            bound_models: Mutex::new(HashSet::new()),
            features: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Copy of the durable record
    #[must_use]
    pub fn record(&self) -> NodeRecord {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn unicast(&self) -> u16 {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unicast
    }

    #[must_use]
    pub fn device_type(&self) -> String {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .device_type
            .clone()
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .configured
    }

    pub fn set_configured(&self, configured: bool) {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .configured = configured;
    }

    /// Change the stored type tag; the class takes effect on the next load
    pub fn set_device_type(&self, tag: &str) {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        if record.device_type != tag {
            tracing::info!(node = %self.uuid, from = %record.device_type, to = tag, "node type changed");
            record.device_type = tag.to_string();
        }
    }

    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Display id used in bus topics, falling back to the identity
    #[must_use]
    pub fn display_id(&self) -> String {
        self.config
            .id
            .clone()
            .unwrap_or_else(|| self.uuid.to_string())
    }

    /// The class this node was constructed with
    #[must_use]
    pub fn class(&self) -> &dyn NodeClass {
        self.class.as_ref()
    }

    #[must_use]
    pub const fn properties(&self) -> &PropertyBus {
        &self.properties
    }

    /// Shorthand for [`PropertyBus::notify`]
    pub fn notify(&self, property: Property, value: impl Into<PropertyValue>) -> bool {
        self.properties.notify(property, value)
    }

    /// Last value of `property`, or `fallback`
    #[must_use]
    pub fn retained(&self, property: Property, fallback: u32) -> u32 {
        self.properties
            .retained(property)
            .map_or(fallback, PropertyValue::as_level)
    }

    /// Run the class binding, then signal readiness
    ///
    /// # Errors
    ///
    /// Returns error if binding fails; the node then never becomes ready
    pub async fn bind(&self, mesh: &MeshClient) -> Result<()> {
        self.class.bind(self, mesh).await?;
        self.mark_ready();
        tracing::info!(node = %self, class = self.class.name(), "node bound");
        Ok(())
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the node has been bound
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] if the readiness signal is gone
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::NotReady(self.to_string()))?;
        Ok(())
    }

    /// Read composition data page zero from the node
    ///
    /// # Errors
    ///
    /// Returns error if the config client call fails
    pub async fn fetch_composition(&self, mesh: &MeshClient) -> Result<()> {
        let unicast = self.unicast();
        let results = mesh
            .interface()
            .get_composition_data(&[unicast], mesh.net_index())
            .await?;

        let composition = crate::mesh::address_result("get_composition_data", results, unicast);
        match &composition {
            Some(c) => tracing::debug!(node = %self, composition = %c, "fetched composition"),
            None => tracing::warn!(node = %self, "no composition data"),
        }

        *self
            .composition
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = composition;
        Ok(())
    }

    #[must_use]
    pub fn composition(&self) -> Option<Composition> {
        self.composition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bind `model` on the primary element to the application key
    ///
    /// Models missing from the composition are skipped. Returns whether the
    /// model was bound.
    ///
    /// # Errors
    ///
    /// Returns error if the bind call fails
    pub async fn bind_model(&self, mesh: &MeshClient, model: ModelId) -> Result<bool> {
        let supported = self
            .composition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|c| c.element(0).map(|e| e.supports(model)));

        match supported {
            None => {
                tracing::info!(node = %self, %model, "no composition data, not binding");
                return Ok(false);
            }
            Some(false) => {
                tracing::info!(node = %self, %model, "model not supported");
                return Ok(false);
            }
            Some(true) => {}
        }

        let unicast = self.unicast();
        mesh.interface()
            .bind_app_key(unicast, mesh.net_index(), unicast, mesh.app_key_index(), model)
            .await?;

        self.bound_models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model);
        tracing::info!(node = %self, %model, "model bound");
        Ok(true)
    }

    #[must_use]
    pub fn is_model_bound(&self, model: ModelId) -> bool {
        self.bound_models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&model)
    }

    pub fn add_feature(&self, property: Property) {
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(property);
    }

    /// Whether the node exposes `property`
    #[must_use]
    pub fn supports(&self, property: Property) -> bool {
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&property)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::nodes::GenericClass;

    fn node() -> Node {
        Node::new(
            Uuid::new_v4(),
            NodeRecord::new("generic", 0x10, 1),
            NodeConfig {
                id: Some("hall".to_string()),
                ..NodeConfig::default()
            },
            Arc::new(GenericClass),
        )
    }

    #[test]
    fn display_includes_id_and_address() {
        let node = node();
        let text = node.to_string();
        assert!(text.starts_with("hall ("));
        assert!(text.ends_with(", 0010)"));
        assert_eq!(node.display_id(), "hall");
    }

    #[tokio::test]
    async fn wait_ready_resolves_after_mark() {
        let node = Arc::new(node());
        let waiter = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.wait_ready().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        node.mark_ready();
        waiter.await.unwrap().unwrap();
        assert!(node.is_ready());
    }

    #[test]
    fn record_mutations() {
        let node = node();
        node.set_configured(true);
        node.set_device_type("light");

        let record = node.record();
        assert!(record.configured);
        assert_eq!(record.device_type, "light");
        assert_eq!(node.class().name(), "generic");
    }

    #[test]
    fn retained_falls_back() {
        let node = node();
        assert_eq!(node.retained(Property::Brightness, 7), 7);
        node.notify(Property::Brightness, 9_u16);
        assert_eq!(node.retained(Property::Brightness, 7), 9);
    }
}
