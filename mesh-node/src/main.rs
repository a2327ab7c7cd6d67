//! Mesh Node
//!
//! Runs one mesh role in this process:
//! - `--type directory`: gateway directory for clients
//! - `--type login|lobby|...`: backend bound to a gateway

use std::path::PathBuf;

use clap::Parser;

use mesh_net::{LocalIdentity, Node, PeerType, Role};
use mesh_node::{load_config, BackendRole, DirectoryRole};

// ============================================================================
// Command Line
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "mesh-node", version, about = "Mesh node - directory and backend roles")]
struct Args {
    /// Role of this process
    #[arg(long = "type", default_value = "login")]
    peer_type: PeerType,

    /// JSON node configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Application id, 0 picks a random one
    #[arg(long, default_value_t = 0)]
    id: u64,

    /// Application group id
    #[arg(long, default_value_t = 0)]
    group: u32,

    /// Display name, defaults to the role name
    #[arg(long)]
    name: Option<String>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Backends: answer every forwarded command with itself
    #[arg(long)]
    echo: bool,
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

    let config = load_config(args.config.as_deref())?;
    let identity = LocalIdentity {
        app_id: args.id,
        group_id: args.group,
        peer_type: args.peer_type,
        name: args.name.unwrap_or_else(|| args.peer_type.to_string()),
    };

    log::info!("Mesh node starting...");
    log::info!("  Type:     {}", identity.peer_type);
    log::info!("  Internal: {}:{}", config.internal_host, config.internal_port);

    match args.peer_type {
        PeerType::Directory => run(Node::new(config, identity, DirectoryRole::new())?),
        PeerType::Gateway => Err("gateways run as gateway-server".into()),
        PeerType::Unknown | PeerType::Client | PeerType::TestBot => {
            Err(format!("{} cannot run as a mesh node", args.peer_type).into())
        }
        _ => {
            if args.echo {
                log::info!("  Echo mode");
            }
            run(Node::new(config, identity, BackendRole::new(args.echo))?)
        }
    }
}

fn run<R: Role>(mut node: Node<R>) -> Result<(), Box<dyn std::error::Error>> {
    log::info!(
        "{} {} running on port {}",
        node.local().peer_type,
        node.local().app_id,
        node.internal_port()
    );
    if !node.run() {
        return Err("event loop stopped with an error".into());
    }
    log::info!("node stopped");
    Ok(())
}
