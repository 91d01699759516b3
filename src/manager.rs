//! Node management queries

use std::sync::Arc;

use uuid::Uuid;

use crate::context::Context;
use crate::mesh::{Composition, address_result};
use crate::{Error, Result};

/// Readable node field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Default TTL
    Ttl,
    /// Composition data page zero
    Composition,
}

impl std::str::FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ttl" => Ok(Self::Ttl),
            "composition" => Ok(Self::Composition),
            other => Err(Error::Config(format!(
                "unknown field \"{other}\", expected ttl or composition"
            ))),
        }
    }
}

/// Value read from a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Ttl(u8),
    Composition(Composition),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ttl(ttl) => write!(f, "default_ttl={ttl}"),
            Self::Composition(composition) => write!(f, "{composition}"),
        }
    }
}

/// Reads configuration state from provisioned nodes
#[derive(Debug)]
pub struct Manager {
    context: Arc<Context>,
}

impl Manager {
    #[must_use]
    pub const fn new(context: Arc<Context>) -> Self {
        Self { context }
    }

    /// Read `field` from the node with identity `uuid`
    ///
    /// Returns `None` if the node did not answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] for an unknown node, or the error of
    /// the config client call
    pub async fn get(&self, uuid: Uuid, field: Field) -> Result<Option<FieldValue>> {
        let node = self.context.node(uuid).ok_or(Error::NodeNotFound(uuid))?;
        let unicast = node.unicast();
        let mesh = self.context.mesh();

        tracing::info!(node = %node, ?field, "reading node field");

        let value = match field {
            Field::Ttl => {
                let results = mesh
                    .interface()
                    .get_default_ttl(&[unicast], mesh.net_index())
                    .await?;
                address_result("get_default_ttl", results, unicast).map(FieldValue::Ttl)
            }
            Field::Composition => {
                let results = mesh
                    .interface()
                    .get_composition_data(&[unicast], mesh.net_index())
                    .await?;
                address_result("get_composition_data", results, unicast)
                    .map(FieldValue::Composition)
            }
        };
        Ok(value)
    }
}
