//! Capmesh node entry point.
//!
//! Dev-mode wiring: the registry contract, the P2P fabric, and the message
//! dispatcher are all in-process stand-ins, so a node can be brought up and
//! observed from a config file alone. The reconciliation engine itself is
//! the production component under test.

use std::sync::Arc;

use anyhow::{Context, Result};
use capmesh_config::NodeConfig;
use capmesh_core::{
    CapabilityEntry, CapabilityInfo, CapabilityRegistry, CapabilityType, LocalRegistry, PeerId,
    Service,
};
use capmesh_network::{InProcessNetwork, InProcessPeerWrapper};
use capmesh_syncer::{
    BootstrapSetup, BoundContract, RegistrySyncer, RemoteRegistryReader,
    SimulatedRegistryContract,
};
use clap::{Arg, ArgAction, Command};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod feed;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let matches = Command::new("capmesh-node")
        .about("Capability network node (dev-mode wiring)")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .help("Path to the node configuration file")
                .required(true),
        )
        .arg(
            Arg::new("offline")
                .long("offline")
                .help("Leave the simulated registry empty to exercise the bootstrap path")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("required arg");
    let offline = matches.get_flag("offline");

    let config = NodeConfig::load(config_path)
        .with_context(|| format!("loading config from {config_path}"))?;

    if let Err(e) = run_node(config, offline).await {
        error!(error = %e, "node failed");
        return Err(e);
    }
    Ok(())
}

async fn run_node(config: NodeConfig, offline: bool) -> Result<()> {
    let peer_id: PeerId = config.peer_id.parse().context("parsing peer_id")?;
    info!(peer_id = %peer_id, "starting capmesh node");

    let bootstrap = BootstrapSetup::from_config(&config.bootstrap)
        .context("parsing bootstrap network description")?;

    // Dev-mode collaborators. A production deployment swaps these for the
    // chain-backed contract reader and the real P2P transport.
    let contract = Arc::new(SimulatedRegistryContract::new());
    if offline {
        info!("offline mode: simulated registry left empty, bootstrap description takes over");
    } else {
        contract.seed(&bootstrap.initial_state());
    }
    let reader = Arc::new(RemoteRegistryReader::new(
        contract,
        BoundContract {
            name: config.registry.contract_name.clone(),
            address: config.registry.contract_address.clone(),
        },
    ));

    let network = InProcessNetwork::new();
    let dispatcher = network.dispatcher_for(peer_id);
    let peer_wrapper = Arc::new(InProcessPeerWrapper::new(peer_id));
    let registry = Arc::new(LocalRegistry::new());

    // If this node hosts the bootstrap trigger DON, publish the dev feed so
    // the server-side publisher path has an implementation to wrap.
    let trigger_member = config
        .bootstrap
        .trigger_don
        .members
        .contains(&config.peer_id);
    let dev_feed = if trigger_member {
        let info = CapabilityInfo {
            id: bootstrap.trigger_capability_id(),
            capability_type: CapabilityType::Trigger,
            description: format!("dev feed for {}", config.bootstrap.trigger_capability_name),
            version: config.bootstrap.trigger_capability_version.clone(),
            don: None,
        };
        let feed = feed::feed_for(info);
        registry
            .add(CapabilityEntry::Trigger(feed.clone()))
            .await
            .context("publishing dev feed")?;
        feed.start().await.context("starting dev feed")?;
        info!("member of the trigger DON: dev streams feed published");
        Some(feed)
    } else {
        None
    };

    let syncer = RegistrySyncer::new(
        reader,
        registry,
        dispatcher,
        peer_wrapper,
        config.syncer.clone(),
        bootstrap,
    );
    syncer.start().context("starting registry syncer")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");

    if let Some(feed) = dev_feed {
        if let Err(e) = feed.close().await {
            warn!(error = %e, "dev feed did not close cleanly");
        }
    }
    syncer.close().await.context("closing registry syncer")?;
    info!("node stopped");
    Ok(())
}
