//! Node record and property types

use serde::{Deserialize, Serialize};

/// Durable subset of a node, as written to the store
///
/// The identity is the key of the store entry and is not repeated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node class tag (e.g. "generic", "light")
    #[serde(rename = "type")]
    pub device_type: String,
    /// Primary unicast address
    pub unicast: u16,
    /// Number of consecutive unicast addresses owned by the node
    pub count: u16,
    /// Whether key configuration completed
    #[serde(default)]
    pub configured: bool,
}

impl NodeRecord {
    /// Record for a freshly provisioned, unconfigured node
    #[must_use]
    pub fn new(device_type: impl Into<String>, unicast: u16, count: u16) -> Self {
        Self {
            device_type: device_type.into(),
            unicast,
            count: count.max(1),
            configured: false,
        }
    }

    /// Last unicast address owned by the node
    #[must_use]
    pub const fn last_address(&self) -> u16 {
        self.unicast.saturating_add(self.count.saturating_sub(1))
    }

    /// Whether the address ranges of two records intersect
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.unicast <= other.last_address() && other.unicast <= self.last_address()
    }
}

/// Observable node property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    /// Node reachable
    Online,
    /// Generic on/off state
    Onoff,
    /// Lightness (0..=65535)
    Brightness,
    /// Color temperature in Kelvin
    Temperature,
}

impl Property {
    /// Property name as used in handler tables and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Onoff => "onoff",
            Self::Brightness => "brightness",
            Self::Temperature => "temperature",
        }
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retained property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Level(u32),
}

impl PropertyValue {
    /// Truthiness: `true`, or a non-zero level
    #[must_use]
    pub const fn as_bool(self) -> bool {
        match self {
            Self::Bool(b) => b,
            Self::Level(l) => l > 0,
        }
    }

    /// Numeric value; booleans map to 0 and 1
    #[must_use]
    pub const fn as_level(self) -> u32 {
        match self {
            Self::Bool(true) => 1,
            Self::Bool(false) => 0,
            Self::Level(l) => l,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        Self::Level(u32::from(value))
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Level(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_type_key() {
        let record = NodeRecord::new("light", 4, 2);
        let yaml = serde_yaml::to_string(&record).unwrap();
        assert!(yaml.contains("type: light"));
        assert!(yaml.contains("configured: false"));
    }

    #[test]
    fn overlapping_ranges() {
        let a = NodeRecord::new("generic", 4, 2);
        let b = NodeRecord::new("generic", 5, 1);
        let c = NodeRecord::new("generic", 6, 3);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(c.last_address(), 8);
    }

    #[test]
    fn zero_count_is_raised_to_one() {
        assert_eq!(NodeRecord::new("generic", 10, 0).count, 1);
    }

    #[test]
    fn value_conversions() {
        assert!(PropertyValue::from(true).as_bool());
        assert!(!PropertyValue::Level(0).as_bool());
        assert_eq!(PropertyValue::from(300_u16).as_level(), 300);
        assert_eq!(PropertyValue::Bool(true).as_level(), 1);
    }
}
