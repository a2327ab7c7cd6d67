//! Backend role (login, lobby, ...)
//!
//! Binds to one gateway through the gateway selector and serves the client
//! traffic that gateway forwards. In echo mode every forwarded command is sent
//! straight back to its client through the same envelope.

use std::collections::BTreeSet;

use mesh_net::{
    Command, ConnectionId, ForwardEnvelope, NodeContext, PeerDescriptor, ProtocolError, Role, SelectorState,
    ServerInfo,
};

pub struct BackendRole {
    echo: bool,
    /// (gateway connection, client connection on that gateway)
    clients: BTreeSet<(ConnectionId, ConnectionId)>,
    last_state: Option<SelectorState>,
}

impl BackendRole {
    pub fn new(echo: bool) -> Self {
        BackendRole {
            echo,
            clients: BTreeSet::new(),
            last_state: None,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_client(&self, gateway: ConnectionId, client: ConnectionId) -> bool {
        self.clients.contains(&(gateway, client))
    }
}

impl Role for BackendRole {
    fn uses_gateway_selector(&self) -> bool {
        true
    }

    fn on_tick(&mut self, ctx: &mut NodeContext<'_>) {
        let state = ctx.selector().map(|s| s.state());
        if state == self.last_state {
            return;
        }
        match state {
            Some(SelectorState::Bound(gateway)) => log::info!("serving clients of gateway {}", gateway),
            Some(other) => log::debug!("gateway selector: {:?}", other),
            None => {}
        }
        self.last_state = state;
    }

    fn on_command(
        &mut self,
        _ctx: &mut NodeContext<'_>,
        conn: ConnectionId,
        command: u16,
        _payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if command == Command::RemoteDisconnected.code() {
            log::info!("remote disconnected on {}", conn);
            return Ok(());
        }
        Err(ProtocolError::UnknownCommand(command))
    }

    fn on_forward(
        &mut self,
        ctx: &mut NodeContext<'_>,
        conn: ConnectionId,
        envelope: ForwardEnvelope,
    ) -> Result<(), ProtocolError> {
        if envelope.command == Command::RemoteDisconnected.code() {
            log::info!("client {} of {} disconnected", envelope.requestor, conn);
            self.clients.remove(&(conn, envelope.requestor));
            return Ok(());
        }

        if self.clients.insert((conn, envelope.requestor)) {
            log::debug!("new client {} via {}", envelope.requestor, conn);
        }

        if self.echo {
            ctx.forward_packet(conn, envelope.requestor, envelope.command, &envelope.payload)?;
        } else {
            log::debug!(
                "command {} from client {} ({} bytes)",
                envelope.command,
                envelope.requestor,
                envelope.payload.len()
            );
        }
        Ok(())
    }

    fn on_peer_exit(&mut self, _ctx: &mut NodeContext<'_>, peer: &PeerDescriptor) {
        if let Some(conn) = peer.connection {
            let before = self.clients.len();
            self.clients.retain(|(gateway, _)| *gateway != conn);
            if self.clients.len() != before {
                log::warn!(
                    "{} {} left, dropped {} clients",
                    peer.peer_type,
                    peer.app_id,
                    before - self.clients.len()
                );
            }
        }
    }

    fn on_update_server_info(&self, info: &mut ServerInfo) {
        info.player_count = self.clients.len() as u32;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_uses_selector() {
        assert!(BackendRole::new(false).uses_gateway_selector());
        assert!(BackendRole::new(true).uses_gateway_selector());
    }

    #[test]
    fn test_player_count_tracks_clients() {
        let mut role = BackendRole::new(false);
        role.clients.insert((ConnectionId(1), ConnectionId(10)));
        role.clients.insert((ConnectionId(1), ConnectionId(11)));
        role.clients.insert((ConnectionId(2), ConnectionId(10)));

        let mut info = ServerInfo::default();
        role.on_update_server_info(&mut info);
        assert_eq!(info.player_count, 3);
        assert!(role.has_client(ConnectionId(2), ConnectionId(10)));
        assert!(!role.has_client(ConnectionId(2), ConnectionId(11)));
    }
}
