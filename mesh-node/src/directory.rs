//! Directory role
//!
//! Every gateway pushes its ServerInfo here, children included. Clients ask
//! for a gateway with `DIRECTORY_LIST_SERVERS` and get every connected gateway
//! that currently has a login backend behind it.

use serde::{Deserialize, Serialize};

use mesh_net::protocol::{
    decode_body, encode_body, DIRECTORY_LIST_SERVERS, DIRECTORY_LIST_SERVERS_ACK, DIRECTORY_RANGE,
};
use mesh_net::{
    AppId, ConnectionId, GroupId, NodeContext, PeerDescriptor, PeerRegistry, PeerType, ProtocolError, Role,
};

pub const LIST_OK: u32 = 0;
pub const LIST_NOT_FOUND: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListServers {}

/// Where a client can reach one gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEntry {
    pub addr: String,
    pub port: u16,
    pub group_id: GroupId,
    pub app_id: AppId,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListServersAck {
    pub error: u32,
    pub servers: Vec<GatewayEntry>,
}

/// Gateways on a live connection with at least one login child.
pub fn list_gateways(registry: &PeerRegistry, is_connected: impl Fn(ConnectionId) -> bool) -> ListServersAck {
    let servers: Vec<GatewayEntry> = registry
        .find_by_type(PeerType::Gateway, 0, 0)
        .into_iter()
        .filter(|d| d.connection.map_or(false, &is_connected))
        .filter(|d| d.has_child_of_type(PeerType::Login))
        .map(entry)
        .collect();

    ListServersAck {
        error: if servers.is_empty() { LIST_NOT_FOUND } else { LIST_OK },
        servers,
    }
}

fn entry(desc: &PeerDescriptor) -> GatewayEntry {
    GatewayEntry {
        addr: desc.external_addr.clone(),
        port: desc.external_port,
        group_id: desc.group_id,
        app_id: desc.app_id,
        name: desc.name.clone(),
    }
}

#[derive(Debug, Default)]
pub struct DirectoryRole {
    served: u64,
}

impl DirectoryRole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listings answered so far.
    pub fn served(&self) -> u64 {
        self.served
    }
}

impl Role for DirectoryRole {
    fn on_command(
        &mut self,
        ctx: &mut NodeContext<'_>,
        conn: ConnectionId,
        command: u16,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if !DIRECTORY_RANGE.contains(&command) {
            return Err(ProtocolError::UnknownCommand(command));
        }
        match command {
            DIRECTORY_LIST_SERVERS => {
                let _: ListServers = decode_body(command, payload)?;
                let ack = list_gateways(ctx.registry(), |c| {
                    ctx.connection(c).map_or(false, |c| c.is_connected())
                });
                log::debug!("listing {} gateways to {}", ack.servers.len(), conn);

                let body = encode_body(&ack)?;
                ctx.send_packet(conn, DIRECTORY_LIST_SERVERS_ACK, &body)?;
                self.served += 1;
                Ok(())
            }
            _ => Err(ProtocolError::UnknownCommand(command)),
        }
    }

    fn on_peer_joined(&mut self, _ctx: &mut NodeContext<'_>, peer: &PeerDescriptor) {
        log::info!("{} {} registered", peer.peer_type, peer.app_id);
    }

    fn on_peer_exit(&mut self, _ctx: &mut NodeContext<'_>, peer: &PeerDescriptor) {
        log::info!("{} {} unregistered", peer.peer_type, peer.app_id);
    }
}

// ============================================================================
// Tests
// ============================================================================
