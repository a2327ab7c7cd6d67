//! Mesh node roles
//!
//! - [`directory`]: tracks gateways and hands them out to clients
//! - [`backend`]: login/lobby style roles that bind to a gateway and serve
//!   forwarded client traffic

use std::path::Path;

use mesh_net::{ConfigError, NodeConfig};

pub mod backend;
pub mod directory;

pub use backend::BackendRole;
pub use directory::DirectoryRole;

/// Config from `path`, or the defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig, ConfigError> {
    match path {
        Some(path) => {
            log::info!("loading config from {}", path.display());
            NodeConfig::from_file(path)
        }
        None => Ok(NodeConfig::default()),
    }
}
