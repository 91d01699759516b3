//! Bridges between node classes and Home Assistant components
//!
//! A bridge describes a node to the bus (discovery), republishes its state
//! on every property change, and routes inbound commands to the node. The
//! last segment of an inbound topic selects the command handler, the
//! property name selects the property handler.

mod light;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

pub use light::LightBridge;

use crate::bus::{BusMessage, Messenger};
use crate::mesh::MeshClient;
use crate::nodes::{Node, Property, PropertyValue};
use crate::properties::SubscriptionId;
use crate::{Error, Result};

/// Handler for an inbound command payload
pub type CommandHandler = Arc<dyn Fn(Arc<Node>, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handler for a property change
pub type PropertyHandler =
    Arc<dyn Fn(Arc<Node>, PropertyValue) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Command and property handler tables of a bridge
#[derive(Default, Clone)]
pub struct Handlers {
    commands: HashMap<String, CommandHandler>,
    properties: HashMap<Property, PropertyHandler>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Handlers {
    /// Register the handler for command `name`
    pub fn command<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Arc<Node>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.commands.insert(
            name.to_string(),
            Arc::new(move |node, payload| Box::pin(handler(node, payload))),
        );
    }

    /// Register the handler for changes of `property`
    pub fn property<F, Fut>(&mut self, property: Property, handler: F)
    where
        F: Fn(Arc<Node>, PropertyValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.properties.insert(
            property,
            Arc::new(move |node, value| Box::pin(handler(node, value))),
        );
    }

    /// Handler for command `name`
    ///
    /// # Errors
    ///
    /// Returns [`Error::BridgeHandlerMissing`] if none is registered
    pub fn command_handler(&self, name: &str) -> Result<CommandHandler> {
        self.commands
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BridgeHandlerMissing {
                kind: "command",
                name: name.to_string(),
            })
    }

    /// Handler for changes of `property`
    ///
    /// # Errors
    ///
    /// Returns [`Error::BridgeHandlerMissing`] if none is registered
    pub fn property_handler(&self, property: Property) -> Result<PropertyHandler> {
        self.properties
            .get(&property)
            .cloned()
            .ok_or_else(|| Error::BridgeHandlerMissing {
                kind: "property",
                name: property.to_string(),
            })
    }
}

/// Adapter between one node class and one Home Assistant component
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Home Assistant component (e.g. "light")
    fn component(&self) -> &'static str;

    fn handlers(&self) -> &Handlers;

    /// Publish the discovery message for `node`
    ///
    /// # Errors
    ///
    /// Returns error if the publish fails
    async fn config(&self, node: &Node) -> Result<()>;
}

/// Bridges keyed by node class tag
#[derive(Clone, Default)]
pub struct BridgeSet {
    bridges: HashMap<&'static str, Arc<dyn Bridge>>,
}

impl std::fmt::Debug for BridgeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.bridges.keys()).finish()
    }
}

impl BridgeSet {
    /// The built-in bridges
    #[must_use]
    pub fn with_defaults(messenger: &Arc<Messenger>, mesh: &MeshClient) -> Self {
        let mut set = Self::default();
        set.insert("light", Arc::new(LightBridge::new(Arc::clone(messenger), mesh.clone())));
        set
    }

    /// Bridge nodes of class `tag` with `bridge`
    pub fn insert(&mut self, tag: &'static str, bridge: Arc<dyn Bridge>) {
        self.bridges.insert(tag, bridge);
    }

    #[must_use]
    pub fn get(&self, tag: &str) -> Option<Arc<dyn Bridge>> {
        self.bridges.get(tag).cloned()
    }
}

/// Removes the property subscription when the listener ends
struct Unsubscribe {
    node: Arc<Node>,
    id: SubscriptionId,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.node.properties().unsubscribe(self.id);
    }
}

/// Bridge one node until its message stream ends
///
/// Waits for the node to become ready, publishes discovery, then
/// subscribes to its properties (with replay) and to its bus topics.
/// Unknown commands or properties and malformed payloads are logged and
/// dropped; handler errors end the listener.
///
/// # Errors
///
/// Returns error if discovery or a handler fails
pub async fn listen(bridge: Arc<dyn Bridge>, node: Arc<Node>, messenger: Arc<Messenger>) -> Result<()> {
    node.wait_ready().await?;
    bridge.config(&node).await?;

    let mut messages = messenger.filtered_messages(bridge.component(), &node);

    let (tx, mut changes) = mpsc::unbounded_channel();
    let id = node.properties().subscribe(
        move |property, value| {
            tx.send((property, value))
                .map_err(|_| Error::Bus("bridge listener gone".to_string()))
        },
        true,
    );
    let _subscription = Unsubscribe {
        node: Arc::clone(&node),
        id,
    };

    tracing::info!(node = %node, component = bridge.component(), "bridge listening");

    loop {
        tokio::select! {
            Some((property, value)) = changes.recv() => {
                dispatch_property(bridge.handlers(), &node, property, value).await?;
            }
            message = messages.next() => {
                let Some(message) = message else {
                    tracing::info!(node = %node, "bus stream closed");
                    return Ok(());
                };
                dispatch_command(bridge.handlers(), &node, message).await?;
            }
        }
    }
}

async fn dispatch_property(
    handlers: &Handlers,
    node: &Arc<Node>,
    property: Property,
    value: PropertyValue,
) -> Result<()> {
    match handlers.property_handler(property) {
        Ok(handler) => handler(Arc::clone(node), value).await,
        Err(e) => {
            tracing::debug!(node = %node, error = %e, "dropping property change");
            Ok(())
        }
    }
}

async fn dispatch_command(handlers: &Handlers, node: &Arc<Node>, message: BusMessage) -> Result<()> {
    let command = message.topic.rsplit('/').next().unwrap_or_default();

    let handler = match handlers.command_handler(command) {
        Ok(handler) => handler,
        Err(e) => {
            tracing::warn!(node = %node, topic = %message.topic, error = %e, "dropping message");
            return Ok(());
        }
    };

    let payload: Value = match serde_json::from_slice(&message.payload) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(node = %node, topic = %message.topic, error = %e, "malformed payload");
            return Ok(());
        }
    };

    tracing::info!(node = %node, command, %payload, "received command");
    handler(Arc::clone(node), payload).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn missing_handlers_are_reported() {
        let handlers = Handlers::default();
        assert!(matches!(
            handlers.command_handler("set"),
            Err(Error::BridgeHandlerMissing { kind: "command", .. })
        ));
        assert!(matches!(
            handlers.property_handler(Property::Online),
            Err(Error::BridgeHandlerMissing { kind: "property", .. })
        ));
    }

    #[tokio::test]
    async fn registered_command_handler_runs() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut handlers = Handlers::default();
        handlers.command("set", move |_node, payload| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(payload);
                Ok(())
            }
        });

        let node = Arc::new(Node::new(
            uuid::Uuid::new_v4(),
            crate::nodes::NodeRecord::new("generic", 4, 1),
            crate::config::NodeConfig::default(),
            Arc::new(crate::nodes::GenericClass),
        ));

        let message = BusMessage::new("prefix/light/mesh/lamp/set", br#"{"state":"ON"}"#.to_vec());
        dispatch_command(&handlers, &node, message).await.unwrap();

        let garbage = BusMessage::new("prefix/light/mesh/lamp/set", b"not json".to_vec());
        dispatch_command(&handlers, &node, garbage).await.unwrap();

        let unknown = BusMessage::new("prefix/light/mesh/lamp/state", b"{}".to_vec());
        dispatch_command(&handlers, &node, unknown).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["state"], "ON");
    }
}
