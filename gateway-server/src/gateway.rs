//! Gateway role: client relay plus directory advertisement

use mesh_net::connection::ConnectionInfo;
use mesh_net::{
    ConnectionId, ForwardEnvelope, NodeContext, PartitionTable, PeerDescriptor, PeerType, ProtocolError,
    Relay, Role, ServerInfo,
};

pub struct GatewayRole {
    relay: Relay,
}

impl GatewayRole {
    pub fn new() -> Self {
        Self::with_partitions(PartitionTable::gateway_default())
    }

    pub fn with_partitions(partitions: PartitionTable) -> Self {
        GatewayRole {
            relay: Relay::new(partitions),
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Push our ServerInfo to the directory so it can hand us out to clients.
    fn advertise(&self, ctx: &mut NodeContext<'_>) {
        let directory = match ctx.registry().find_one(PeerType::Directory).and_then(|d| d.connection) {
            Some(conn) => conn,
            None => return,
        };
        if !is_connected(ctx, directory) {
            return;
        }
        if let Err(e) = ctx.update_server_info_to(self, directory) {
            log::warn!("server info update to directory failed: {}", e);
        }
    }
}

impl Default for GatewayRole {
    fn default() -> Self {
        Self::new()
    }
}

fn is_connected(ctx: &NodeContext<'_>, conn: ConnectionId) -> bool {
    ctx.connection(conn).map_or(false, |c| c.is_connected())
}

fn is_client(ctx: &NodeContext<'_>, conn: ConnectionId) -> bool {
    ctx.connection(conn).map_or(false, |c| !c.is_peer())
}

impl Role for GatewayRole {
    fn on_start(&mut self, ctx: &mut NodeContext<'_>) {
        ctx.registry_mut().add_interested_type(PeerType::Directory);
        if ctx.network().external().is_none() {
            log::warn!("gateway has no external listener, clients cannot reach it");
        }
    }

    fn on_command(
        &mut self,
        ctx: &mut NodeContext<'_>,
        conn: ConnectionId,
        command: u16,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if !is_client(ctx, conn) {
            return Err(ProtocolError::UnknownCommand(command));
        }
        let (registry, mut link) = ctx.split();
        self.relay.inbound(registry, &mut link, conn, command, payload)
    }

    fn on_forward(
        &mut self,
        ctx: &mut NodeContext<'_>,
        conn: ConnectionId,
        envelope: ForwardEnvelope,
    ) -> Result<(), ProtocolError> {
        let from_client = is_client(ctx, conn);
        let (registry, mut link) = ctx.split();
        if from_client {
            return self.relay.relay_envelope(registry, &mut link, conn, &envelope);
        }
        self.relay.outbound(&mut link, &envelope);
        Ok(())
    }

    fn on_disconnected(&mut self, ctx: &mut NodeContext<'_>, info: &ConnectionInfo) {
        if info.is_peer {
            return;
        }
        let (_, mut link) = ctx.split();
        self.relay.client_disconnected(&mut link, info.id);
    }

    fn on_peer_joined(&mut self, ctx: &mut NodeContext<'_>, peer: &PeerDescriptor) {
        log::info!("{} {} joined", peer.peer_type, peer.app_id);
        match peer.connection {
            Some(conn) if is_connected(ctx, conn) => self.advertise(ctx),
            _ => {}
        }
    }

    fn on_peer_exit(&mut self, ctx: &mut NodeContext<'_>, peer: &PeerDescriptor) {
        log::info!("{} {} left", peer.peer_type, peer.app_id);
        if let Some(conn) = peer.connection {
            let (_, mut link) = ctx.split();
            let lost = self.relay.lose_backend(&mut link, conn);
            if !lost.is_empty() {
                log::warn!("{} clients dropped with {} {}", lost.len(), peer.peer_type, peer.app_id);
            }
        }
        if peer.peer_type != PeerType::Directory {
            self.advertise(ctx);
        }
    }

    fn on_update_server_info(&self, info: &mut ServerInfo) {
        info.player_count = self.relay.client_count() as u32;
    }
}

// ============================================================================
// Tests
// ============================================================================
