//! Mesh Gateway - bridges a wireless mesh network to Home Assistant
//!
//! This library provides the core functionality of the gateway:
//! - Persistent node registry with typed node classes
//! - Unicast address allocation for provisioning
//! - Per-node retained property notification
//! - Supervised tasks with fail-fast escalation
//! - Bridges publishing node state to a pub/sub bus and routing commands
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Home Assistant (bus)                 │
//! └────────────────────┬────────────────────────────────┘
//!                      │  discovery / state / commands
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Mesh Gateway                      │
//! │  Messenger │ Bridges │ Registry │ Provisioner │ ...  │
//! └────────────────────┬────────────────────────────────┘
//!                      │  model RPCs / callbacks
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Mesh stack (daemon)                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod allocator;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod keychain;
pub mod manager;
pub mod mesh;
pub mod nodes;
pub mod properties;
pub mod provisioner;
pub mod scanner;
pub mod store;
pub mod supervisor;

pub use allocator::AddressAllocator;
pub use bridge::{Bridge, BridgeSet};
pub use bus::{BusClient, LoopbackBus, Messenger, MqttBus};
pub use config::GatewayConfig;
pub use context::Context;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use mesh::{MeshApplication, MeshClient, MeshInterface, SimulatedMesh};
pub use nodes::{Node, Property, PropertyValue, Registry};
pub use properties::PropertyBus;
pub use store::Store;
pub use supervisor::Supervisor;
