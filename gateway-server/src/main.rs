//! Mesh Gateway Server
//!
//! Runs a mesh node with the gateway role:
//! - Accepts clients on the external listener
//! - Relays their commands to login/lobby backends by command range
//! - Advertises itself to the directory

use std::path::PathBuf;

use clap::Parser;

use gateway_server::GatewayRole;
use mesh_net::{LocalIdentity, Node, NodeConfig, PeerType};

// ============================================================================
// Command Line
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "gateway-server", version, about = "Mesh gateway - relays client traffic to backends")]
struct Args {
    /// JSON node configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Application id, 0 picks a random one
    #[arg(long, default_value_t = 0)]
    id: u64,

    /// Application group id
    #[arg(long, default_value_t = 0)]
    group: u32,

    #[arg(long, default_value = "gateway")]
    name: String,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = &args.log_level {
        builder.parse_filters(filter);
    }
    builder.init();

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if config.external_host.is_none() {
        log::info!("no external_host configured, accepting clients on 0.0.0.0");
        config.external_host = Some("0.0.0.0".to_string());
    }

    let identity = LocalIdentity {
        app_id: args.id,
        group_id: args.group,
        peer_type: PeerType::Gateway,
        name: args.name,
    };

    log::info!("Mesh gateway starting...");
    log::info!("  Internal: {}:{}", config.internal_host, config.internal_port);
    log::info!(
        "  External: {}:{}",
        config.external_host.as_deref().unwrap_or("-"),
        config.external_port
    );

    let mut node = Node::new(config, identity, GatewayRole::new())?;
    log::info!(
        "gateway {} listening on {} (internal) and {:?} (external)",
        node.local().app_id,
        node.internal_port(),
        node.external_port()
    );

    if !node.run() {
        return Err("event loop stopped with an error".into());
    }
    log::info!("gateway stopped");
    Ok(())
}
