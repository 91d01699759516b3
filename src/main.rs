use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mesh_gateway::config::default_basedir;
use mesh_gateway::manager::Field;
use mesh_gateway::mesh::SimDevice;
use mesh_gateway::{
    BusClient, Context, Error, Gateway, LoopbackBus, MeshApplication, MqttBus, SimulatedMesh,
};

/// Mesh Gateway - bridge a wireless mesh network to Home Assistant
#[derive(Parser)]
#[command(name = "mesh-gateway", version, about)]
struct Cli {
    /// Directory holding config.yaml and store.yaml
    #[arg(long, env = "MESH_GATEWAY_BASEDIR")]
    basedir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Leave the mesh network and forget all nodes
    #[arg(long)]
    leave: bool,

    /// Re-import network and application keys
    #[arg(long)]
    reload: bool,

    /// Bridge to the in-process bus instead of the configured broker
    #[arg(long)]
    loopback: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Provision, configure or reset nodes
    Prov {
        task: ProvTask,

        /// Single node to act on; all matching nodes if omitted
        #[arg(long)]
        uuid: Option<Uuid>,
    },
    /// Scan for unprovisioned devices
    Scan,
    /// Read node state
    Mgmt {
        #[command(subcommand)]
        operation: MgmtOperation,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProvTask {
    List,
    Add,
    Config,
    Reset,
}

#[derive(Subcommand)]
enum MgmtOperation {
    /// Read `ttl` or `composition` from a node
    Get { field: Field, uuid: Uuid },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` if set, else a filter derived from the verbosity count
fn log_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)))
}

const fn default_directives(verbose: u8) -> &'static str {
    match verbose {
        0 => "info,mesh_gateway=info",
        1 => "info,mesh_gateway=debug",
        2 => "debug",
        _ => "trace",
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let basedir = cli.basedir.unwrap_or_else(default_basedir);
    tracing::info!(basedir = %basedir.display(), "starting mesh gateway");

    // No hardware mesh backend is built in; run against the simulated mesh
    let sim = Arc::new(SimulatedMesh::new());
    let context = Arc::new(Context::load(&basedir, sim.clone())?);
    populate_simulation(&sim, &context);

    let bus: Arc<dyn BusClient> = if cli.loopback {
        Arc::new(LoopbackBus::default())
    } else {
        Arc::new(MqttBus::new(&context.config().mqtt))
    };
    let gateway = Arc::new(Gateway::new(Arc::clone(&context), bus));
    let application: Arc<dyn MeshApplication> = gateway.clone();
    sim.attach(Arc::downgrade(&application));

    if cli.leave {
        gateway.connect().await?;
        gateway.leave().await?;
        gateway.stop().await?;
        return Ok(());
    }

    gateway.start(cli.reload).await?;

    let result = match cli.command {
        Some(Command::Prov { task, uuid }) => prov(&gateway, task, uuid).await,
        Some(Command::Scan) => scan(&gateway).await,
        Some(Command::Mgmt {
            operation: MgmtOperation::Get { field, uuid },
        }) => mgmt_get(&gateway, field, uuid).await,
        None => serve(&gateway).await,
    };

    gateway.stop().await?;
    result
}

/// Run until interrupted
async fn serve(gateway: &Gateway) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            interrupt.cancel();
        }
    });

    tracing::info!("mesh gateway ready");
    gateway.run(token).await?;
    Ok(())
}

async fn prov(gateway: &Gateway, task: ProvTask, uuid: Option<Uuid>) -> anyhow::Result<()> {
    let provisioner = gateway.provisioner();
    let context = gateway.context();
    let node = |uuid| context.node(uuid).ok_or(Error::NodeNotFound(uuid));

    match (task, uuid) {
        (ProvTask::List, _) => {}
        (ProvTask::Add, None) => {
            provisioner.provision_configured().await?;
        }
        (ProvTask::Add, Some(uuid)) => {
            provisioner.provision(uuid).await?;
        }
        (ProvTask::Config, None) => provisioner.configure_pending().await?,
        (ProvTask::Config, Some(uuid)) => {
            let node = node(uuid)?;
            provisioner.configure(&node).await?;
        }
        (ProvTask::Reset, None) => provisioner.reset_unconfigured().await?,
        (ProvTask::Reset, Some(uuid)) => {
            let node = node(uuid)?;
            provisioner.reset(&node).await?;
        }
    }

    print_nodes(context);
    Ok(())
}

async fn scan(gateway: &Gateway) -> anyhow::Result<()> {
    let context = gateway.context();
    let found = gateway
        .scanner()
        .scan(context.mesh(), context.config().provisioning.scan_seconds)
        .await?;

    println!("\nFound {} node(s):", found.len());
    for uuid in found {
        println!("  UUID => {uuid}");
    }
    Ok(())
}

async fn mgmt_get(gateway: &Gateway, field: Field, uuid: Uuid) -> anyhow::Result<()> {
    let value = gateway.manager().get(uuid, field).await?;

    println!("\nGet returned:");
    match value {
        Some(value) => println!("  {value}"),
        None => println!("  no answer"),
    }
    Ok(())
}

fn print_nodes(context: &Context) {
    let nodes = context.nodes();
    println!("\nMesh contains {} node(s):", nodes.len());
    for node in nodes {
        println!(
            "  {node}: type={} count={} configured={}",
            node.device_type(),
            node.record().count,
            node.is_configured()
        );
    }
}

/// Give every known and configured node a virtual device
fn populate_simulation(sim: &SimulatedMesh, context: &Context) {
    for node in context.nodes() {
        let mut device = SimDevice::light(node.uuid());
        device.element_count = node.record().count;
        sim.adopt_device(device, node.unicast());
    }

    let registry = context.registry();
    for uuid in context.config().configured_uuids() {
        if !registry.has(uuid) {
            sim.add_device(SimDevice::light(uuid));
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbosity_raises_log_level() {
        assert_eq!(default_directives(0), "info,mesh_gateway=info");
        assert_eq!(default_directives(1), "info,mesh_gateway=debug");
        assert_eq!(default_directives(2), "debug");
        assert_eq!(default_directives(7), "trace");
    }

    #[test]
    fn prov_with_uuid_and_loopback_parse() {
        let uuid = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "mesh-gateway",
            "--loopback",
            "-vv",
            "prov",
            "config",
            "--uuid",
            &uuid.to_string(),
        ])
        .unwrap();

        assert!(cli.loopback);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Some(Command::Prov { task: ProvTask::Config, uuid: Some(u) }) if u == uuid
        ));
    }
}
