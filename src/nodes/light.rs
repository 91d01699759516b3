//! Light node class
//!
//! Supports a single element with any of
//! - `GenericOnOffServer`: turn on and off
//! - `LightLightnessServer`: brightness
//! - `LightCTLServer`: brightness and color temperature

use std::time::Duration;

use async_trait::async_trait;

use super::{Node, NodeClass, Property};
use crate::Result;
use crate::mesh::{MeshClient, ModelId, address_result};

/// Highest lightness level
pub const MAX_LIGHTNESS: u32 = 65535;

/// Lowest color temperature in Kelvin
pub const MIN_TEMPERATURE: u32 = 800;

/// Highest color temperature in Kelvin
pub const MAX_TEMPERATURE: u32 = 20000;

/// Light node class
#[derive(Debug, Clone, Copy, Default)]
pub struct LightClass;

#[async_trait]
impl NodeClass for LightClass {
    fn name(&self) -> &'static str {
        "light"
    }

    async fn bind(&self, node: &Node, mesh: &MeshClient) -> Result<()> {
        node.fetch_composition(mesh).await?;

        if node.bind_model(mesh, ModelId::GENERIC_ONOFF_SERVER).await? {
            node.add_feature(Property::Onoff);
            node.get_onoff(mesh).await?;
        }

        if node.bind_model(mesh, ModelId::LIGHT_LIGHTNESS_SERVER).await? {
            node.add_feature(Property::Onoff);
            node.add_feature(Property::Brightness);
            node.get_lightness(mesh).await?;
        }

        if node.bind_model(mesh, ModelId::LIGHT_CTL_SERVER).await? {
            node.add_feature(Property::Temperature);
            node.add_feature(Property::Brightness);
            node.get_ctl(mesh).await?;
        }

        Ok(())
    }
}

fn clamp_u16(value: u32, min: u32, max: u32) -> u16 {
    u16::try_from(value.clamp(min, max)).unwrap_or(u16::MAX)
}

impl Node {
    /// # Errors
    ///
    /// Returns error if the mesh call fails
    pub async fn turn_on(&self, mesh: &MeshClient) -> Result<()> {
        self.set_onoff(mesh, true).await
    }

    /// # Errors
    ///
    /// Returns error if the mesh call fails
    pub async fn turn_off(&self, mesh: &MeshClient) -> Result<()> {
        self.set_onoff(mesh, false).await
    }

    /// Set on/off state without acknowledgement
    ///
    /// # Errors
    ///
    /// Returns error if the mesh call fails
    pub async fn set_onoff(&self, mesh: &MeshClient, onoff: bool) -> Result<()> {
        self.notify(Property::Onoff, onoff);
        mesh.interface()
            .set_onoff_unack(self.unicast(), mesh.app_key_index(), onoff, Duration::ZERO)
            .await
    }

    /// Set brightness through the lightness server, else the CTL server
    ///
    /// # Errors
    ///
    /// Returns error if the mesh call fails
    pub async fn set_brightness(&self, mesh: &MeshClient, lightness: u32) -> Result<()> {
        if self.is_model_bound(ModelId::LIGHT_LIGHTNESS_SERVER) {
            self.set_lightness(mesh, lightness).await
        } else if self.is_model_bound(ModelId::LIGHT_CTL_SERVER) {
            self.set_ctl(mesh, None, Some(lightness)).await
        } else {
            tracing::debug!(node = %self, "no brightness model bound");
            Ok(())
        }
    }

    /// Set color temperature in Kelvin (CTL server only)
    ///
    /// # Errors
    ///
    /// Returns error if the mesh call fails
    pub async fn set_temperature(&self, mesh: &MeshClient, kelvin: u32) -> Result<()> {
        if self.is_model_bound(ModelId::LIGHT_CTL_SERVER) {
            self.set_ctl(mesh, Some(kelvin), None).await
        } else {
            tracing::debug!(node = %self, "no temperature model bound");
            Ok(())
        }
    }

    /// Set color temperature in mireds
    ///
    /// # Errors
    ///
    /// Returns error if the mesh call fails
    pub async fn set_mireds(&self, mesh: &MeshClient, mireds: u32) -> Result<()> {
        if mireds == 0 {
            tracing::warn!(node = %self, "ignoring color temperature of 0 mireds");
            return Ok(());
        }
        self.set_temperature(mesh, 1_000_000 / mireds).await
    }

    async fn set_lightness(&self, mesh: &MeshClient, lightness: u32) -> Result<()> {
        let lightness = clamp_u16(lightness, 0, MAX_LIGHTNESS);
        self.notify(Property::Brightness, lightness);
        self.notify(Property::Onoff, lightness > 0);
        mesh.interface()
            .set_lightness_unack(
                self.unicast(),
                mesh.app_key_index(),
                lightness,
                Duration::ZERO,
            )
            .await
    }

    /// Unset values are taken from the retained state
    async fn set_ctl(
        &self,
        mesh: &MeshClient,
        temperature: Option<u32>,
        lightness: Option<u32>,
    ) -> Result<()> {
        let temperature = match temperature {
            Some(kelvin) => {
                let kelvin = clamp_u16(kelvin, MIN_TEMPERATURE, MAX_TEMPERATURE);
                self.notify(Property::Temperature, kelvin);
                kelvin
            }
            None => clamp_u16(
                self.retained(Property::Temperature, MAX_TEMPERATURE),
                MIN_TEMPERATURE,
                MAX_TEMPERATURE,
            ),
        };

        let lightness = match lightness {
            Some(level) => {
                let level = clamp_u16(level, 0, MAX_LIGHTNESS);
                self.notify(Property::Brightness, level);
                self.notify(Property::Onoff, level > 0);
                level
            }
            None => clamp_u16(
                self.retained(Property::Brightness, MAX_LIGHTNESS),
                0,
                MAX_LIGHTNESS,
            ),
        };

        mesh.interface()
            .set_ctl_unack(
                self.unicast(),
                mesh.app_key_index(),
                temperature,
                lightness,
                Duration::ZERO,
            )
            .await
    }

    async fn get_onoff(&self, mesh: &MeshClient) -> Result<()> {
        let unicast = self.unicast();
        let results = mesh
            .interface()
            .get_onoff(&[unicast], mesh.app_key_index())
            .await?;
        if let Some(onoff) = address_result("get_onoff", results, unicast) {
            self.notify(Property::Onoff, onoff);
        }
        Ok(())
    }

    async fn get_lightness(&self, mesh: &MeshClient) -> Result<()> {
        let unicast = self.unicast();
        let results = mesh
            .interface()
            .get_lightness(&[unicast], mesh.app_key_index())
            .await?;
        if let Some(lightness) = address_result("get_lightness", results, unicast) {
            self.notify(Property::Brightness, lightness);
        }
        Ok(())
    }

    async fn get_ctl(&self, mesh: &MeshClient) -> Result<()> {
        let unicast = self.unicast();
        let results = mesh
            .interface()
            .get_ctl(&[unicast], mesh.app_key_index())
            .await?;
        if let Some(status) = address_result("get_ctl", results, unicast) {
            self.notify(Property::Temperature, status.temperature);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::config::NodeConfig;
    use crate::keychain::{AppKey, MeshKey};
    use crate::mesh::{SimDevice, SimulatedMesh};
    use crate::nodes::{NodeRecord, PropertyValue};

    fn setup(device: SimDevice) -> (Arc<SimulatedMesh>, MeshClient, Node) {
        let uuid = device.uuid;
        let sim = Arc::new(SimulatedMesh::new());
        sim.adopt_device(device, 0x20);
        let mesh = MeshClient::new(
            Arc::clone(&sim) as Arc<dyn crate::mesh::MeshInterface>,
            AppKey {
                index: 0,
                net_index: 0,
                key: MeshKey::new([7; 16]),
            },
        );
        let node = Node::new(
            uuid,
            NodeRecord::new("light", 0x20, 1),
            NodeConfig::default(),
            Arc::new(LightClass),
        );
        (sim, mesh, node)
    }

    #[tokio::test]
    async fn bind_records_features_and_initial_state() {
        let mut device = SimDevice::light(Uuid::new_v4());
        device.onoff = true;
        device.lightness = 1000;
        device.temperature = 3000;
        let (_sim, mesh, node) = setup(device);

        node.bind(&mesh).await.unwrap();

        assert!(node.is_ready());
        assert!(node.supports(Property::Onoff));
        assert!(node.supports(Property::Brightness));
        assert!(node.supports(Property::Temperature));
        assert_eq!(node.properties().retained(Property::Onoff), Some(PropertyValue::Bool(true)));
        assert_eq!(node.retained(Property::Brightness, 0), 1000);
        assert_eq!(node.retained(Property::Temperature, 0), 3000);
    }

    #[tokio::test]
    async fn switch_only_exposes_onoff() {
        let (_sim, mesh, node) = setup(SimDevice::switch(Uuid::new_v4()));
        node.bind(&mesh).await.unwrap();

        assert!(node.supports(Property::Onoff));
        assert!(!node.supports(Property::Brightness));

        // no model to carry it, nothing is notified
        node.set_brightness(&mesh, 500).await.unwrap();
        assert_eq!(node.properties().retained(Property::Brightness), None);
    }

    #[tokio::test]
    async fn setters_notify_and_send() {
        let uuid = Uuid::new_v4();
        let (sim, mesh, node) = setup(SimDevice::light(uuid));
        node.bind(&mesh).await.unwrap();

        node.turn_on(&mesh).await.unwrap();
        node.set_brightness(&mesh, 100_000).await.unwrap();
        node.set_mireds(&mesh, 250).await.unwrap();

        let device = sim.device(uuid).unwrap();
        assert!(device.onoff);
        assert_eq!(device.temperature, 4000);
        assert_eq!(u32::from(device.lightness), MAX_LIGHTNESS);
        assert_eq!(node.retained(Property::Brightness, 0), MAX_LIGHTNESS);
        assert_eq!(node.retained(Property::Temperature, 0), 4000);
    }

    #[tokio::test]
    async fn brightness_drives_retained_onoff() {
        let uuid = Uuid::new_v4();
        let (sim, mesh, node) = setup(SimDevice::light(uuid));
        node.bind(&mesh).await.unwrap();
        assert!(!node.properties().retained(Property::Onoff).unwrap().as_bool());

        node.set_brightness(&mesh, 40).await.unwrap();
        assert_eq!(node.properties().retained(Property::Onoff), Some(PropertyValue::Bool(true)));
        assert!(sim.device(uuid).unwrap().onoff);

        node.set_brightness(&mesh, 0).await.unwrap();
        assert_eq!(node.properties().retained(Property::Onoff), Some(PropertyValue::Bool(false)));
        assert!(!sim.device(uuid).unwrap().onoff);
    }

    #[tokio::test]
    async fn ctl_brightness_notifies_lightness_not_temperature() {
        let uuid = Uuid::new_v4();
        let device = SimDevice::with_models(
            uuid,
            vec![ModelId::CONFIG_SERVER, ModelId::LIGHT_CTL_SERVER],
        );
        let (sim, mesh, node) = setup(device);
        node.bind(&mesh).await.unwrap();

        node.set_brightness(&mesh, 1234).await.unwrap();

        assert_eq!(node.retained(Property::Brightness, 0), 1234);
        assert_eq!(node.retained(Property::Temperature, 0), 6500);
        assert_eq!(sim.device(uuid).unwrap().lightness, 1234);
    }

    #[tokio::test]
    async fn temperature_is_clamped() {
        let uuid = Uuid::new_v4();
        let (sim, mesh, node) = setup(SimDevice::light(uuid));
        node.bind(&mesh).await.unwrap();

        node.set_temperature(&mesh, 100).await.unwrap();
        assert_eq!(sim.device(uuid).unwrap().temperature, 800);

        node.set_temperature(&mesh, 50_000).await.unwrap();
        assert_eq!(sim.device(uuid).unwrap().temperature, 20000);

        node.set_mireds(&mesh, 0).await.unwrap();
        assert_eq!(sim.device(uuid).unwrap().temperature, 20000);
    }
}
