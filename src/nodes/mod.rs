//! Mesh nodes
//!
//! Each node class implements the `NodeClass` trait; the registry picks the
//! class by the node's type tag through the [`NodeTypes`] table.

mod generic;
mod light;
mod node;
pub mod registry;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use generic::GenericClass;
pub use light::{LightClass, MAX_LIGHTNESS, MAX_TEMPERATURE, MIN_TEMPERATURE};
pub use node::Node;
pub use registry::Registry;
pub use types::{NodeRecord, Property, PropertyValue};

use crate::Result;
use crate::mesh::MeshClient;

/// Behavior of one node class
#[async_trait]
pub trait NodeClass: Send + Sync {
    /// Type tag stored in the node record
    fn name(&self) -> &'static str;

    /// Configure mesh models on the remote node and read initial state
    ///
    /// # Errors
    ///
    /// Returns error if a mesh call fails
    async fn bind(&self, node: &Node, mesh: &MeshClient) -> Result<()>;
}

/// Registration table mapping type tags to node classes
#[derive(Clone)]
pub struct NodeTypes {
    classes: BTreeMap<&'static str, Arc<dyn NodeClass>>,
}

impl std::fmt::Debug for NodeTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.classes.keys()).finish()
    }
}

impl Default for NodeTypes {
    fn default() -> Self {
        let mut types = Self::empty();
        types.register(Arc::new(GenericClass));
        types.register(Arc::new(LightClass));
        types
    }
}

impl NodeTypes {
    /// Table without any classes
    #[must_use]
    pub fn empty() -> Self {
        Self {
            classes: BTreeMap::new(),
        }
    }

    /// Add a class, replacing any class with the same tag
    pub fn register(&mut self, class: Arc<dyn NodeClass>) {
        self.classes.insert(class.name(), class);
    }

    #[must_use]
    pub fn get(&self, tag: &str) -> Option<Arc<dyn NodeClass>> {
        self.classes.get(tag).cloned()
    }

    /// Registered tags in sorted order
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.classes.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_generic_and_light() {
        let types = NodeTypes::default();
        assert_eq!(types.tags().collect::<Vec<_>>(), vec!["generic", "light"]);
        assert_eq!(types.get("light").map(|c| c.name()), Some("light"));
        assert!(types.get("sensor").is_none());
    }
}
