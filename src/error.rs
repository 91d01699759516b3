//! Error types for the mesh gateway

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the mesh gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Node type tag without a registered node class
    #[error("unknown node type \"{tag}\" for {uuid}")]
    UnknownNodeType {
        /// Node identity
        uuid: Uuid,
        /// Offending type tag
        tag: String,
    },

    /// Spawn attempted on a supervisor that is shutting down or closed
    #[error("supervisor closed, cannot spawn \"{0}\"")]
    SupervisorClosed(String),

    /// Unicast address space exhausted
    #[error("address space exhausted: {requested} address(es) requested at {next:#06x}")]
    AddressExhaustion {
        /// Current watermark
        next: u16,
        /// Number of addresses requested
        requested: u16,
    },

    /// Provisioning reported as failed by the mesh stack
    #[error("provisioning of {uuid} failed: {reason}")]
    ProvisioningFailed {
        /// Device identity
        uuid: Uuid,
        /// Reason reported by the mesh stack
        reason: String,
    },

    /// No bridge handler for a command or property
    #[error("no {kind} handler for \"{name}\"")]
    BridgeHandlerMissing {
        /// "command" or "property"
        kind: &'static str,
        /// Command or property name
        name: String,
    },

    /// Mesh RPC failed
    #[error("mesh call {call} failed: {reason}")]
    MeshCallFailed {
        /// RPC name
        call: &'static str,
        /// Failure reason
        reason: String,
    },

    /// Supervised task failed, escalated out of the supervisor
    #[error("task \"{task}\" failed: {source}")]
    TaskFailed {
        /// Task name
        task: String,
        /// Task error
        #[source]
        source: Box<Self>,
    },

    /// Supervised task panicked
    #[error("task \"{0}\" panicked")]
    TaskPanicked(String),

    /// New node's address range intersects another node's
    #[error("addresses of {uuid} at {unicast:#06x} overlap node {other}")]
    AddressOverlap {
        /// Node being created
        uuid: Uuid,
        /// First address of the new range
        unicast: u16,
        /// Node already holding part of the range
        other: Uuid,
    },

    /// Node not present in the registry
    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    /// A component was used before it was initialized
    #[error("not ready: {0}")]
    NotReady(String),

    /// Malformed key material
    #[error("invalid key \"{name}\": {reason}")]
    InvalidKey {
        /// Keychain entry name
        name: &'static str,
        /// Parse failure
        reason: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Bus transport error
    #[error("bus error: {0}")]
    Bus(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Atomic store rewrite failed
    #[error("persist error: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl Error {
    /// Build a [`Error::MeshCallFailed`] from any displayable reason
    pub fn mesh(call: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::MeshCallFailed {
            call,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failure_names_task_and_cause() {
        let err = Error::TaskFailed {
            task: "bridge kitchen".to_string(),
            source: Box::new(Error::mesh("set_onoff_unack", "timeout")),
        };
        let msg = err.to_string();
        assert!(msg.contains("bridge kitchen"));
        assert!(msg.contains("set_onoff_unack"));
    }

    #[test]
    fn exhaustion_formats_hex_watermark() {
        let err = Error::AddressExhaustion {
            next: 0x7fff,
            requested: 2,
        };
        assert!(err.to_string().contains("0x7fff"));
    }
}
