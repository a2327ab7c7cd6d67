//! Per-role behavior injected into a [`Node`](crate::node::Node)
//!
//! The node handles the built-in protocol (handshake, heartbeat, gossip,
//! probes). Everything else reaches the role through these hooks. All hooks
//! run on the reactor thread.

use crate::connection::ConnectionInfo;
use crate::error::ProtocolError;
use crate::ids::ConnectionId;
use crate::node::NodeContext;
use crate::protocol::{ForwardEnvelope, ServerInfo};
use crate::registry::PeerDescriptor;

pub trait Role {
    /// Run the gateway selector on this node.
    fn uses_gateway_selector(&self) -> bool {
        false
    }

    /// Called once the listeners are up, before the first dispatch.
    fn on_start(&mut self, _ctx: &mut NodeContext<'_>) {}

    fn on_tick(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// An inbound connection was accepted or an outbound one finished
    /// connecting.
    fn on_connected(&mut self, _ctx: &mut NodeContext<'_>, _info: &ConnectionInfo) {}

    /// The connection is on its way out. It can no longer be written to.
    fn on_disconnected(&mut self, _ctx: &mut NodeContext<'_>, _info: &ConnectionInfo) {}

    /// A command outside the built-in set.
    fn on_command(
        &mut self,
        _ctx: &mut NodeContext<'_>,
        _conn: ConnectionId,
        command: u16,
        _payload: &[u8],
    ) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnknownCommand(command))
    }

    /// A ForwardPacket arrived on `conn`.
    fn on_forward(
        &mut self,
        _ctx: &mut NodeContext<'_>,
        conn: ConnectionId,
        envelope: ForwardEnvelope,
    ) -> Result<(), ProtocolError> {
        log::warn!(
            "forwarded command {} from {} on {}: not implemented",
            envelope.command,
            envelope.requestor,
            conn
        );
        Ok(())
    }

    fn on_peer_joined(&mut self, _ctx: &mut NodeContext<'_>, _peer: &PeerDescriptor) {}

    fn on_peer_exit(&mut self, _ctx: &mut NodeContext<'_>, _peer: &PeerDescriptor) {}

    /// Amend the ServerInfo this node is about to advertise.
    fn on_update_server_info(&self, _info: &mut ServerInfo) {}

    /// Shutdown is in progress. `first` is set on the request itself, later
    /// calls come from the shutdown tick until the grace period ends.
    fn on_shutdown(&mut self, _ctx: &mut NodeContext<'_>, _first: bool) {}
}
