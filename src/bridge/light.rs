//! Light bridge using the Home Assistant JSON schema

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Bridge, Handlers};
use crate::Result;
use crate::bus::Messenger;
use crate::mesh::MeshClient;
use crate::nodes::{MAX_LIGHTNESS, MAX_TEMPERATURE, Node, Property};

const COMPONENT: &str = "light";

/// Bridge for nodes of the light class
#[derive(Debug)]
pub struct LightBridge {
    messenger: Arc<Messenger>,
    handlers: Handlers,
}

impl LightBridge {
    #[must_use]
    pub fn new(messenger: Arc<Messenger>, mesh: MeshClient) -> Self {
        let mut handlers = Handlers::default();

        handlers.command("set", move |node, payload| {
            let mesh = mesh.clone();
            async move { handle_set(&node, &mesh, &payload).await }
        });

        // Either change republishes the whole retained state
        for property in [Property::Onoff, Property::Brightness] {
            let m = Arc::clone(&messenger);
            handlers.property(property, move |node, _value| {
                let messenger = Arc::clone(&m);
                async move { publish_state(&messenger, &node).await }
            });
        }

        Self {
            messenger,
            handlers,
        }
    }
}

#[async_trait]
impl Bridge for LightBridge {
    fn component(&self) -> &'static str {
        COMPONENT
    }

    fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    async fn config(&self, node: &Node) -> Result<()> {
        let message = discovery_message(&self.messenger, node);
        self.messenger
            .publish_json(COMPONENT, node, "config", &message, true)
            .await
    }
}

/// Discovery message describing the node's features
fn discovery_message(messenger: &Messenger, node: &Node) -> Value {
    let config = node.config();
    let id = node.display_id();
    let name = config.name.clone().unwrap_or_else(|| id.clone());

    let mut message = json!({
        "dev": {
            "ids": [id],
            "name": format!("{name}-{id}"),
            "sw": env!("CARGO_PKG_VERSION"),
            "mf": "BLE MESH",
            "mdl": node.device_type(),
        },
        "~": messenger.node_topic(COMPONENT, node),
        "name": name,
        "unique_id": id,
        "object_id": id,
        "command_topic": "~/set",
        "state_topic": "~/state",
        "schema": "json",
    });

    if node.supports(Property::Brightness) {
        message["brightness"] = json!(true);
        message["brightness_scale"] = json!(100);
    }

    if node.supports(Property::Temperature) {
        message["color_mode"] = json!(true);
        message["supported_color_modes"] = json!(["color_temp"]);
        message["min_mireds"] = json!(config.min_mireds);
        message["max_mireds"] = json!(config.max_mireds);
    }

    message
}

/// Full state message rebuilt from the retained properties
///
/// When off, brightness and color temperature are left out.
fn state_message(node: &Node) -> Value {
    let onoff = node.retained(Property::Onoff, 0) > 0;
    let state = if onoff { "ON" } else { "OFF" };
    let mut message = json!({ "state": state });

    if onoff && node.supports(Property::Brightness) {
        let lightness = u64::from(node.retained(Property::Brightness, MAX_LIGHTNESS));
        let scale = u64::from(node.config().brightness_max.max(1));
        message["brightness"] = json!((lightness * 100 + scale / 2) / scale);
    }

    if onoff && node.supports(Property::Temperature) {
        let kelvin = node.retained(Property::Temperature, MAX_TEMPERATURE).max(1);
        message["color_temp"] = json!(1_000_000 / kelvin);
    }

    message
}

async fn publish_state(messenger: &Messenger, node: &Node) -> Result<()> {
    let message = state_message(node);
    messenger
        .publish_json(COMPONENT, node, "state", &message, true)
        .await
}

/// `set` command: color temperature, brightness, then power state
async fn handle_set(node: &Node, mesh: &MeshClient, payload: &Value) -> Result<()> {
    if let Some(mireds) = payload.get("color_temp").and_then(Value::as_u64) {
        let mireds = u32::try_from(mireds).unwrap_or(u32::MAX);
        node.set_mireds(mesh, mireds).await?;
    }

    if let Some(brightness) = payload.get("brightness").and_then(Value::as_f64) {
        let scale = f64::from(node.config().brightness_max);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let lightness = (brightness * scale / 100.0)
            .round()
            .clamp(0.0, f64::from(MAX_LIGHTNESS)) as u32;
        node.set_brightness(mesh, lightness).await?;
    }

    match payload.get("state").and_then(Value::as_str) {
        Some("ON") => node.turn_on(mesh).await?,
        Some("OFF") => node.turn_off(mesh).await?,
        Some(other) => tracing::warn!(node = %node, state = other, "unknown light state"),
        None => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::config::{MqttConfig, NodeConfig};
    use crate::nodes::{LightClass, NodeRecord};

    fn light(config: NodeConfig) -> Node {
        Node::new(
            uuid::Uuid::new_v4(),
            NodeRecord::new("light", 4, 1),
            config,
            Arc::new(LightClass),
        )
    }

    fn messenger() -> Messenger {
        Messenger::new(Arc::new(LoopbackBus::default()), &MqttConfig::default())
    }

    #[test]
    fn discovery_lists_supported_features() {
        let node = light(NodeConfig {
            id: Some("desk".to_string()),
            name: Some("Desk".to_string()),
            ..NodeConfig::default()
        });
        node.add_feature(Property::Onoff);
        node.add_feature(Property::Brightness);

        let message = discovery_message(&messenger(), &node);
        assert_eq!(message["~"], "homeassistant/light/mqtt_mesh/desk");
        assert_eq!(message["unique_id"], "desk");
        assert_eq!(message["dev"]["name"], "Desk-desk");
        assert_eq!(message["brightness_scale"], 100);
        assert!(message.get("supported_color_modes").is_none());

        node.add_feature(Property::Temperature);
        let message = discovery_message(&messenger(), &node);
        assert_eq!(message["supported_color_modes"], json!(["color_temp"]));
        assert_eq!(message["min_mireds"], 238);
    }

    #[test]
    fn state_omits_levels_when_off() {
        let node = light(NodeConfig {
            brightness_max: 200,
            ..NodeConfig::default()
        });
        node.add_feature(Property::Brightness);
        node.add_feature(Property::Temperature);
        node.notify(Property::Brightness, 100_u16);
        node.notify(Property::Temperature, 4000_u16);

        assert_eq!(state_message(&node), json!({ "state": "OFF" }));

        node.notify(Property::Onoff, true);
        let on = state_message(&node);
        assert_eq!(on["state"], "ON");
        assert_eq!(on["brightness"], 50);
        assert_eq!(on["color_temp"], 250);
    }

    #[test]
    fn state_without_features_is_plain() {
        let node = light(NodeConfig::default());
        node.notify(Property::Onoff, true);
        assert_eq!(state_message(&node), json!({ "state": "ON" }));
    }

    #[test]
    fn state_follows_retained_onoff_not_brightness() {
        let node = light(NodeConfig::default());
        node.add_feature(Property::Brightness);
        node.notify(Property::Onoff, false);
        node.notify(Property::Brightness, 40_u16);

        assert_eq!(state_message(&node), json!({ "state": "OFF" }));
    }
}
