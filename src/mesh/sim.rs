//! In-process simulated mesh
//!
//! Stands in for the mesh daemon during development and in tests. Virtual
//! devices carry on/off, lightness and CTL server state; provisioning drives
//! the [`MeshApplication`] callbacks the way the real daemon does.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    AddressResults, Composition, CtlStatus, Element, MeshApplication, MeshInterface, ModelId,
    ScanOptions,
};
use crate::keychain::{AppKey, MeshKey};
use crate::{Error, Result};

/// Virtual device state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub uuid: Uuid,
    /// Addresses requested during provisioning
    pub element_count: u16,
    /// SIG models of the primary element
    pub models: Vec<ModelId>,
    pub unicast: Option<u16>,
    pub onoff: bool,
    pub lightness: u16,
    pub temperature: u16,
    pub relay: bool,
    pub app_keys: HashSet<u16>,
    pub bound_models: HashSet<ModelId>,
}

impl SimDevice {
    /// Dimmable light with color temperature
    #[must_use]
    pub fn light(uuid: Uuid) -> Self {
        Self::with_models(
            uuid,
            vec![
                ModelId::CONFIG_SERVER,
                ModelId::HEALTH_SERVER,
                ModelId::GENERIC_ONOFF_SERVER,
                ModelId::LIGHT_LIGHTNESS_SERVER,
                ModelId::LIGHT_CTL_SERVER,
            ],
        )
    }

    /// Plain on/off switchable device
    #[must_use]
    pub fn switch(uuid: Uuid) -> Self {
        Self::with_models(
            uuid,
            vec![ModelId::CONFIG_SERVER, ModelId::GENERIC_ONOFF_SERVER],
        )
    }

    #[must_use]
    pub fn with_models(uuid: Uuid, models: Vec<ModelId>) -> Self {
        Self {
            uuid,
            element_count: 1,
            models,
            unicast: None,
            onoff: false,
            lightness: 0,
            temperature: 6500,
            relay: false,
            app_keys: HashSet::new(),
            bound_models: HashSet::new(),
        }
    }

    fn composition(&self) -> Composition {
        Composition {
            cid: 0x05f1,
            pid: 1,
            vid: 1,
            elements: vec![Element {
                location: 0,
                sig_models: self.models.iter().map(|m| m.0).collect(),
                vendor_models: Vec::new(),
            }],
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    local_app_keys: HashSet<u16>,
    devices: HashMap<Uuid, SimDevice>,
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, u32>,
}

impl SimState {
    fn device_at(&mut self, address: u16) -> Option<&mut SimDevice> {
        self.devices.values_mut().find(|d| {
            d.unicast
                .is_some_and(|u| address >= u && address < u + d.element_count)
        })
    }

    fn per_address<T>(
        &mut self,
        addresses: &[u16],
        f: impl Fn(&SimDevice) -> std::result::Result<T, String>,
    ) -> AddressResults<T> {
        let mut results = BTreeMap::new();
        for &address in addresses {
            if let Some(device) = self.device_at(address) {
                results.insert(address, f(device));
            }
        }
        results
    }
}

/// Simulated mesh daemon
#[derive(Debug, Default)]
pub struct SimulatedMesh {
    state: Mutex<SimState>,
    application: RwLock<Option<Weak<dyn MeshApplication>>>,
}

impl SimulatedMesh {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route callbacks to `application`
    pub fn attach(&self, application: Weak<dyn MeshApplication>) {
        *self
            .application
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(application);
    }

    /// Add an unprovisioned device
    pub fn add_device(&self, device: SimDevice) {
        self.with_state(|state| state.devices.insert(device.uuid, device));
    }

    /// Mark a device as already provisioned at `unicast`
    pub fn adopt_device(&self, mut device: SimDevice, unicast: u16) {
        device.unicast = Some(unicast);
        self.add_device(device);
    }

    /// Current device state
    #[must_use]
    pub fn device(&self, uuid: Uuid) -> Option<SimDevice> {
        self.with_state(|state| state.devices.get(&uuid).cloned())
    }

    /// Names of all interface calls so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        self.with_state(|state| state.calls.clone())
    }

    /// Make the next `times` invocations of `call` fail
    pub fn fail_next(&self, call: &'static str, times: u32) {
        self.with_state(|state| state.failures.insert(call, times));
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.with_state(|state| state.connected)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Log the call and apply any injected failure
    fn record(&self, call: &'static str) -> Result<()> {
        self.with_state(|state| {
            state.calls.push(call);
            match state.failures.get_mut(call) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(Error::mesh(call, "injected failure"))
                }
                _ => Ok(()),
            }
        })
    }

    fn application(&self) -> Option<std::sync::Arc<dyn MeshApplication>> {
        self.application
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn with_device<R>(
        &self,
        call: &'static str,
        address: u16,
        f: impl FnOnce(&mut SimDevice) -> R,
    ) -> Result<R> {
        self.with_state(|state| {
            state
                .device_at(address)
                .map(f)
                .ok_or_else(|| Error::mesh(call, format!("no node at {address:#06x}")))
        })
    }
}

#[async_trait]
impl MeshInterface for SimulatedMesh {
    async fn connect(&self) -> Result<()> {
        self.record("connect")?;
        self.with_state(|state| state.connected = true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect")?;
        self.with_state(|state| state.connected = false);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.record("leave")?;
        self.with_state(|state| {
            state.local_app_keys.clear();
            for device in state.devices.values_mut() {
                device.unicast = None;
            }
        });
        Ok(())
    }

    async fn import_subnet(&self, _net_index: u16, _key: &MeshKey) -> Result<()> {
        self.record("import_subnet")
    }

    async fn import_app_key(&self, _key: &AppKey) -> Result<()> {
        self.record("import_app_key")
    }

    async fn add_app_key(&self, key: &AppKey) -> Result<()> {
        self.record("add_app_key")?;
        self.with_state(|state| {
            if state.local_app_keys.insert(key.index) {
                Ok(())
            } else {
                Err(Error::mesh("add_app_key", "key index already present"))
            }
        })
    }

    async fn delete_app_key(&self, key: &AppKey) -> Result<()> {
        self.record("delete_app_key")?;
        self.with_state(|state| state.local_app_keys.remove(&key.index));
        Ok(())
    }

    async fn bind_client_model(&self, _model: ModelId, _app_key_index: u16) -> Result<()> {
        self.record("bind_client_model")
    }

    async fn add_node(&self, uuid: Uuid) -> Result<()> {
        self.record("add_node")?;

        let count = self.with_state(|state| {
            state
                .devices
                .get(&uuid)
                .filter(|d| d.unicast.is_none())
                .map(|d| d.element_count)
        });

        // Callbacks run without the state lock held
        let Some(application) = self.application() else {
            return Err(Error::NotReady("no mesh application attached".to_string()));
        };

        let Some(count) = count else {
            application.add_node_failed(uuid.as_bytes(), "device not found");
            return Ok(());
        };

        match application.request_prov_data(count) {
            Ok((_net_index, unicast)) => {
                self.with_state(|state| {
                    if let Some(device) = state.devices.get_mut(&uuid) {
                        device.unicast = Some(unicast);
                    }
                });
                application.add_node_complete(uuid.as_bytes(), unicast, count);
            }
            Err(e) => application.add_node_failed(uuid.as_bytes(), &e.to_string()),
        }
        Ok(())
    }

    async fn unprovisioned_scan(&self, _seconds: u16) -> Result<()> {
        self.record("unprovisioned_scan")?;

        let found: Vec<Uuid> = self.with_state(|state| {
            state
                .devices
                .values()
                .filter(|d| d.unicast.is_none())
                .map(|d| d.uuid)
                .collect()
        });

        if let Some(application) = self.application() {
            let options = ScanOptions::new();
            for uuid in found {
                let mut data = uuid.as_bytes().to_vec();
                // OOB information
                data.extend_from_slice(&[0, 0]);
                application.scan_result(-60, &data, &options);
            }
        }
        Ok(())
    }

    async fn get_composition_data(
        &self,
        addresses: &[u16],
        _net_index: u16,
    ) -> Result<AddressResults<Composition>> {
        self.record("get_composition_data")?;
        Ok(self.with_state(|state| state.per_address(addresses, |d| Ok(d.composition()))))
    }

    async fn get_default_ttl(
        &self,
        addresses: &[u16],
        _net_index: u16,
    ) -> Result<AddressResults<u8>> {
        self.record("get_default_ttl")?;
        Ok(self.with_state(|state| state.per_address(addresses, |_| Ok(7))))
    }

    async fn bind_app_key(
        &self,
        destination: u16,
        _net_index: u16,
        _element_address: u16,
        app_key_index: u16,
        model: ModelId,
    ) -> Result<()> {
        self.record("bind_app_key")?;
        self.with_device("bind_app_key", destination, |device| {
            if !device.models.contains(&model) {
                return Err(Error::mesh("bind_app_key", format!("{model} not supported")));
            }
            device.app_keys.insert(app_key_index);
            device.bound_models.insert(model);
            Ok(())
        })?
    }

    async fn add_node_app_key(&self, destination: u16, key: &AppKey) -> Result<()> {
        self.record("add_node_app_key")?;
        self.with_device("add_node_app_key", destination, |device| {
            if device.app_keys.insert(key.index) {
                Ok(())
            } else {
                Err(Error::mesh("add_node_app_key", "key index already present"))
            }
        })?
    }

    async fn delete_node_app_key(&self, destination: u16, key: &AppKey) -> Result<()> {
        self.record("delete_node_app_key")?;
        self.with_device("delete_node_app_key", destination, |device| {
            device.app_keys.remove(&key.index);
        })
    }

    async fn set_relay(
        &self,
        destination: u16,
        _net_index: u16,
        relay: bool,
        _retransmit_count: u8,
    ) -> Result<()> {
        self.record("set_relay")?;
        self.with_device("set_relay", destination, |device| device.relay = relay)
    }

    async fn node_reset(&self, destination: u16, _net_index: u16) -> Result<()> {
        self.record("node_reset")?;
        self.with_device("node_reset", destination, |device| {
            device.unicast = None;
            device.app_keys.clear();
            device.bound_models.clear();
        })
    }

    async fn get_onoff(
        &self,
        addresses: &[u16],
        _app_key_index: u16,
    ) -> Result<AddressResults<bool>> {
        self.record("get_onoff")?;
        Ok(self.with_state(|state| state.per_address(addresses, |d| Ok(d.onoff))))
    }

    async fn set_onoff_unack(
        &self,
        destination: u16,
        _app_key_index: u16,
        onoff: bool,
        _transition_time: Duration,
    ) -> Result<()> {
        self.record("set_onoff_unack")?;
        self.with_device("set_onoff_unack", destination, |device| device.onoff = onoff)
    }

    async fn get_lightness(
        &self,
        addresses: &[u16],
        _app_key_index: u16,
    ) -> Result<AddressResults<u16>> {
        self.record("get_lightness")?;
        Ok(self.with_state(|state| state.per_address(addresses, |d| Ok(d.lightness))))
    }

    async fn set_lightness_unack(
        &self,
        destination: u16,
        _app_key_index: u16,
        lightness: u16,
        _transition_time: Duration,
    ) -> Result<()> {
        self.record("set_lightness_unack")?;
        self.with_device("set_lightness_unack", destination, |device| {
            device.lightness = lightness;
            device.onoff = lightness > 0;
        })
    }

    async fn get_ctl(
        &self,
        addresses: &[u16],
        _app_key_index: u16,
    ) -> Result<AddressResults<CtlStatus>> {
        self.record("get_ctl")?;
        Ok(self.with_state(|state| {
            state.per_address(addresses, |d| {
                Ok(CtlStatus {
                    lightness: d.lightness,
                    temperature: d.temperature,
                })
            })
        }))
    }

    async fn set_ctl_unack(
        &self,
        destination: u16,
        _app_key_index: u16,
        temperature: u16,
        lightness: u16,
        _transition_time: Duration,
    ) -> Result<()> {
        self.record("set_ctl_unack")?;
        self.with_device("set_ctl_unack", destination, |device| {
            device.temperature = temperature;
            device.lightness = lightness;
            device.onoff = lightness > 0;
        })
    }
}
