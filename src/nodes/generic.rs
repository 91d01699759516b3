//! Generic node class
//!
//! Freshly provisioned nodes start out as generic: no models are bound, the
//! composition is read for inspection only.

use async_trait::async_trait;

use super::{Node, NodeClass, Property};
use crate::Result;
use crate::mesh::MeshClient;

/// Node without mesh-side model bindings
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericClass;

#[async_trait]
impl NodeClass for GenericClass {
    fn name(&self) -> &'static str {
        "generic"
    }

    async fn bind(&self, node: &Node, mesh: &MeshClient) -> Result<()> {
        node.fetch_composition(mesh).await?;
        node.notify(Property::Online, node.composition().is_some());
        Ok(())
    }
}
