//! Mesh transport and cluster-membership fabric
//!
//! Building blocks for a mesh of cooperating server processes:
//!
//! - [`reactor`]: single-threaded mio event loop with typed timers and signals
//! - [`socket`], [`connection`], [`listener`]: framed TCP endpoints
//! - [`protocol`]: wire header, command ids and message bodies
//! - [`registry`]: known peers, subscriptions, reconnection
//! - [`selector`]: RTT-based gateway selection
//! - [`tunnel`]: envelope relay between clients and backends
//! - [`node`] and [`role`]: the per-process runtime and its injected behavior

pub mod config;
pub mod connection;
pub mod error;
pub mod ids;
pub mod listener;
pub mod node;
pub mod protocol;
pub mod reactor;
pub mod registry;
pub mod role;
pub mod selector;
pub mod socket;
pub mod tunnel;
pub mod worker;

pub use config::{NodeConfig, PeerEndpoint};
pub use connection::{Connection, ConnectionInfo, ConnectionState};
pub use error::{ConfigError, NetError, ProtocolError, RegistryError, WorkerError};
pub use ids::{AppId, ConnectionId, GroupId};
pub use listener::ListenerKind;
pub use node::{Node, NodeContext, NodeState};
pub use protocol::{Command, ForwardEnvelope, PeerType, ServerInfo};
pub use registry::{LocalIdentity, PeerDescriptor, PeerRegistry, RegistryEvent};
pub use role::Role;
pub use selector::{GatewaySelector, SelectorState};
pub use tunnel::{PartitionTable, Relay};
pub use worker::{JobHandle, WorkerPool};
