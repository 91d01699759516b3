//! Home Assistant messenger
//!
//! Owns the bus connection for the bridges: topic layout, JSON publishing
//! and one supervised bridge task per node.

use std::sync::Arc;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::{BusClient, BusMessage};
use crate::Result;
use crate::bridge::{self, BridgeSet};
use crate::config::MqttConfig;
use crate::nodes::Node;
use crate::supervisor::Supervisor;

/// Topic layout and bus access for bridges
pub struct Messenger {
    client: Arc<dyn BusClient>,
    topic: String,
    prefix: String,
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("topic", &self.topic)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Messenger {
    #[must_use]
    pub fn new(client: Arc<dyn BusClient>, config: &MqttConfig) -> Self {
        Self {
            client,
            topic: config.topic.clone(),
            prefix: config.discovery_prefix.clone(),
        }
    }

    #[must_use]
    pub fn client(&self) -> &dyn BusClient {
        self.client.as_ref()
    }

    /// Base topic of a node: `<prefix>/<component>/<topic>/<node-id>`
    #[must_use]
    pub fn node_topic(&self, component: &str, node: &Node) -> String {
        format!(
            "{}/{component}/{}/{}",
            self.prefix,
            self.topic,
            node.display_id()
        )
    }

    /// Messages below the node's base topic
    pub fn filtered_messages(&self, component: &str, node: &Node) -> BoxStream<'static, BusMessage> {
        self.client
            .messages(&format!("{}/#", self.node_topic(component, node)))
    }

    /// Publish a JSON message on `<node topic>/<topic>`
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the publish fails
    pub async fn publish_json(
        &self,
        component: &str,
        node: &Node,
        topic: &str,
        message: &serde_json::Value,
        retain: bool,
    ) -> Result<()> {
        let topic = format!("{}/{topic}", self.node_topic(component, node));
        let payload = serde_json::to_vec(message)?;
        tracing::debug!(%topic, %message, "publishing");
        self.client.publish(&topic, payload, retain).await
    }

    /// Connect, bridge every node with a matching bridge, and wait
    ///
    /// Nodes whose class has no bridge are skipped. The first failing bridge
    /// task cancels the others and is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails or a bridge task fails
    pub async fn run(
        self: Arc<Self>,
        nodes: Vec<Arc<Node>>,
        bridges: BridgeSet,
        token: CancellationToken,
    ) -> Result<()> {
        self.client.connect().await?;

        let mut tasks = Supervisor::with_token("messenger", token);

        for node in nodes {
            let Some(bridge) = bridges.get(node.class().name()) else {
                tracing::warn!(node = %node, class = node.class().name(), "no bridge for node");
                continue;
            };
            tasks.spawn(
                format!("bridge {node}"),
                bridge::listen(bridge, node, Arc::clone(&self)),
            )?;
        }

        let result = match self.client.subscribe(&format!("{}/#", self.prefix)).await {
            Ok(()) => tasks.gather().await,
            Err(e) => {
                if let Err(failure) = tasks.shutdown().await {
                    tracing::warn!(error = %failure, "bridge failed before subscription");
                }
                Err(e)
            }
        };

        if let Err(e) = self.client.disconnect().await {
            tracing::warn!(error = %e, "failed to disconnect from bus");
        }
        result
    }
}
