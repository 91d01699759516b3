//! Node composition data (page zero)

use serde::{Deserialize, Serialize};

use super::ModelId;

/// One element of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    #[serde(default)]
    pub location: u16,
    #[serde(default)]
    pub sig_models: Vec<u32>,
    #[serde(default)]
    pub vendor_models: Vec<u32>,
}

impl Element {
    /// Whether the element contains the given model
    #[must_use]
    pub fn supports(&self, model: ModelId) -> bool {
        self.sig_models
            .iter()
            .chain(&self.vendor_models)
            .any(|id| *id == model.0)
    }
}

/// Composition data page zero
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    #[serde(default)]
    pub cid: u16,
    #[serde(default)]
    pub pid: u16,
    #[serde(default)]
    pub vid: u16,
    #[serde(default)]
    pub elements: Vec<Element>,
}

impl Composition {
    #[must_use]
    pub fn element(&self, index: usize) -> Option<&Element> {
        self.elements.get(index)
    }
}

impl std::fmt::Display for Composition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cid={:#06x} pid={:#06x} vid={:#06x}",
            self.cid, self.pid, self.vid
        )?;
        for (index, element) in self.elements.iter().enumerate() {
            write!(f, " [{index}:")?;
            for model in &element.sig_models {
                write!(f, " {model:#06x}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}
