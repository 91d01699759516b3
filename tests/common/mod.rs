//! Shared test utilities

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use mesh_gateway::bus::PublishedMessage;
use mesh_gateway::{Context, Gateway, LoopbackBus, MeshApplication, SimulatedMesh};

/// Write `config.yaml` into `basedir`
pub fn write_config(basedir: &Path, yaml: &str) {
    std::fs::write(basedir.join("config.yaml"), yaml).expect("failed to write config");
}

/// Load a gateway from `basedir` and attach it to the simulated mesh
pub fn gateway(basedir: &Path, sim: &Arc<SimulatedMesh>, bus: &Arc<LoopbackBus>) -> Arc<Gateway> {
    let context = Context::load(basedir, sim.clone()).expect("failed to load context");
    let gateway = Arc::new(Gateway::new(Arc::new(context), bus.clone()));

    let application: Arc<dyn MeshApplication> = gateway.clone();
    sim.attach(Arc::downgrade(&application));
    gateway
}

/// Next published message, failing the test after a second
pub async fn next_published(stream: &mut BoxStream<'static, PublishedMessage>) -> PublishedMessage {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for a publish")
        .expect("publish stream closed")
}

/// Assert that nothing is published for a short while
pub async fn assert_quiet(stream: &mut BoxStream<'static, PublishedMessage>) {
    let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(next.is_err(), "unexpected publish: {next:?}");
}
