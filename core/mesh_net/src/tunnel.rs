//! Tunneling relay used by gateways
//!
//! A gateway does not understand backend commands. It maps command ranges to
//! backend roles, binds each client to one backend connection per role, and
//! moves traffic inside [`ForwardEnvelope`]s:
//!
//! ```text
//! Client                 Gateway                         Backend
//!   │── cmd 1001 ─────────►│                                │
//!   │                      │── ForwardPacket{client,1001} ─►│
//!   │                      │◄─ ForwardPacket{client,1002} ──│
//!   │◄─ cmd 1002 ──────────│                                │
//! ```

use std::collections::HashMap;
use std::ops::RangeInclusive;

use crate::error::{NetError, ProtocolError};
use crate::ids::{AppId, ConnectionId};
use crate::protocol::{Command, ForwardEnvelope, PeerType, LOBBY_ENTER, LOBBY_RANGE, LOGIN_RANGE};
use crate::registry::PeerRegistry;

// ============================================================================
// Partition Table
// ============================================================================

/// Static map from command ranges to the backend role that owns them.
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    entries: Vec<(RangeInclusive<u16>, PeerType)>,
    /// Commands that name the backend to bind to
    pins: Vec<u16>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Login and lobby ranges. `LOBBY_ENTER` may pick its lobby.
    pub fn gateway_default() -> Self {
        Self::new()
            .with(LOGIN_RANGE, PeerType::Login)
            .with(LOBBY_RANGE, PeerType::Lobby)
            .with_pin(LOBBY_ENTER)
    }

    pub fn with(mut self, range: RangeInclusive<u16>, peer_type: PeerType) -> Self {
        self.entries.push((range, peer_type));
        self
    }

    /// A client that is not yet bound sending `command` is bound to the
    /// backend whose app id leads the payload (a bincode `u64`, 0 for any).
    pub fn with_pin(mut self, command: u16) -> Self {
        self.pins.push(command);
        self
    }

    /// Backend app id named by a pin command, if any.
    pub fn pinned_target(&self, command: u16, payload: &[u8]) -> Option<AppId> {
        if !self.pins.contains(&command) {
            return None;
        }
        let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
        match u64::from_le_bytes(bytes) {
            0 => None,
            app_id => Some(app_id),
        }
    }

    pub fn route(&self, command: u16) -> Option<PeerType> {
        self.entries
            .iter()
            .find(|(range, _)| range.contains(&command))
            .map(|(_, t)| *t)
    }
}

// ============================================================================
// Network access
// ============================================================================

/// What the relay needs from the node.
pub trait RelayLink {
    fn is_connected(&self, conn: ConnectionId) -> bool;

    /// The connection is a live client on the external listener.
    fn is_client(&self, conn: ConnectionId) -> bool;

    fn send_packet(&mut self, conn: ConnectionId, command: u16, payload: &[u8]) -> Result<(), NetError>;

    fn forward_packet(
        &mut self,
        conn: ConnectionId,
        requestor: ConnectionId,
        command: u16,
        payload: &[u8],
    ) -> Result<(), NetError>;

    fn destroy(&mut self, conn: ConnectionId);
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Debug, Default)]
pub struct Relay {
    partitions: PartitionTable,
    /// client -> (role -> backend connection)
    bindings: HashMap<ConnectionId, HashMap<PeerType, ConnectionId>>,
    /// backend connection -> bound clients
    loads: HashMap<ConnectionId, u32>,
}

impl Relay {
    pub fn new(partitions: PartitionTable) -> Self {
        Relay {
            partitions,
            bindings: HashMap::new(),
            loads: HashMap::new(),
        }
    }

    pub fn partitions(&self) -> &PartitionTable {
        &self.partitions
    }

    pub fn bound_backend(&self, client: ConnectionId, peer_type: PeerType) -> Option<ConnectionId> {
        self.bindings.get(&client)?.get(&peer_type).copied()
    }

    pub fn load(&self, backend: ConnectionId) -> u32 {
        self.loads.get(&backend).copied().unwrap_or(0)
    }

    /// Clients with at least one binding.
    pub fn client_count(&self) -> usize {
        self.bindings.len()
    }

    /// Bind `client` to the least-loaded connected backend of `peer_type`
    /// (lowest app id on ties), or to `pinned` when given.
    pub fn bind_backend(
        &mut self,
        registry: &PeerRegistry,
        link: &impl RelayLink,
        client: ConnectionId,
        peer_type: PeerType,
        pinned: Option<AppId>,
    ) -> Option<ConnectionId> {
        let backend = registry
            .find_by_type(peer_type, pinned.unwrap_or(0), 0)
            .into_iter()
            .filter_map(|d| d.connection.map(|c| (d.app_id, c)))
            .filter(|(_, c)| link.is_connected(*c))
            .min_by_key(|(app_id, c)| (self.load(*c), *app_id))
            .map(|(_, c)| c)?;

        if let Some(previous) = self
            .bindings
            .entry(client)
            .or_default()
            .insert(peer_type, backend)
        {
            self.release(previous);
        }
        *self.loads.entry(backend).or_insert(0) += 1;

        log::debug!("client {} bound to {} backend {}", client, peer_type, backend);
        Some(backend)
    }

    fn release(&mut self, backend: ConnectionId) {
        if let Some(load) = self.loads.get_mut(&backend) {
            *load = load.saturating_sub(1);
        }
    }

    /// Client to backend: wrap the command in an envelope.
    pub fn inbound(
        &mut self,
        registry: &PeerRegistry,
        link: &mut impl RelayLink,
        client: ConnectionId,
        command: u16,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let backend = self.backend_for(registry, &*link, client, command, payload)?;
        forward_to_backend(link, backend, client, command, payload)
    }

    /// A client sent a ready-made envelope: pass it to its backend unchanged.
    pub fn relay_envelope(
        &mut self,
        registry: &PeerRegistry,
        link: &mut impl RelayLink,
        client: ConnectionId,
        envelope: &ForwardEnvelope,
    ) -> Result<(), ProtocolError> {
        let command = envelope.command;
        let backend = self.backend_for(registry, &*link, client, command, &envelope.payload)?;
        forward_to_backend(link, backend, envelope.requestor, command, &envelope.payload)
    }

    /// The client's live binding for the role owning `command`, or a new one.
    fn backend_for(
        &mut self,
        registry: &PeerRegistry,
        link: &impl RelayLink,
        client: ConnectionId,
        command: u16,
        payload: &[u8],
    ) -> Result<ConnectionId, ProtocolError> {
        let target = self
            .partitions
            .route(command)
            .ok_or(ProtocolError::UnknownCommand(command))?;

        match self.bound_backend(client, target) {
            Some(conn) if link.is_connected(conn) => Ok(conn),
            _ => {
                let pinned = self.partitions.pinned_target(command, payload);
                self.bind_backend(registry, link, client, target, pinned)
                    .ok_or(ProtocolError::NoBackend { command })
            }
        }
    }

    /// Backend to client. Returns `false` when the client is gone and the
    /// reply was dropped.
    pub fn outbound(&self, link: &mut impl RelayLink, envelope: &ForwardEnvelope) -> bool {
        if !link.is_client(envelope.requestor) {
            log::warn!(
                "dropping reply {} for vanished client {}",
                envelope.command,
                envelope.requestor
            );
            return false;
        }
        match link.send_packet(envelope.requestor, envelope.command, &envelope.payload) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("reply to client {} failed: {}", envelope.requestor, e);
                false
            }
        }
    }

    /// A backend connection is gone: every client bound to it is destroyed.
    pub fn lose_backend(&mut self, link: &mut impl RelayLink, backend: ConnectionId) -> Vec<ConnectionId> {
        let mut lost = Vec::new();
        for (client, roles) in self.bindings.iter_mut() {
            let before = roles.len();
            roles.retain(|_, conn| *conn != backend);
            if roles.len() != before {
                lost.push(*client);
            }
        }
        self.bindings.retain(|_, roles| !roles.is_empty());
        self.loads.remove(&backend);

        for client in &lost {
            log::info!("client {} lost its backend {}", client, backend);
            link.destroy(*client);
        }
        lost
    }

    /// A client went away: tell its backends and release the bindings.
    pub fn client_disconnected(&mut self, link: &mut impl RelayLink, client: ConnectionId) {
        let roles = match self.bindings.remove(&client) {
            Some(r) => r,
            None => return,
        };
        for backend in roles.into_values() {
            self.release(backend);
            if !link.is_connected(backend) {
                continue;
            }
            if let Err(e) = link.forward_packet(backend, client, Command::RemoteDisconnected.code(), &[]) {
                log::debug!("disconnect notice to {} failed: {}", backend, e);
            }
        }
    }
}

/// A payload that does not fit once wrapped is the client's fault.
fn forward_to_backend(
    link: &mut impl RelayLink,
    backend: ConnectionId,
    requestor: ConnectionId,
    command: u16,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    match link.forward_packet(backend, requestor, command, payload) {
        Ok(()) => Ok(()),
        Err(NetError::PayloadTooLarge { .. }) => Err(ProtocolError::EnvelopeTooLarge {
            command,
            len: payload.len(),
        }),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ENVELOPE_OVERHEAD;
    use crate::registry::tests::local;
    use crate::registry::PeerDescriptor;
    use std::collections::{BTreeMap, HashSet};

    #[derive(Default)]
    struct MockRelayLink {
        connected: HashSet<ConnectionId>,
        clients: HashSet<ConnectionId>,
        packets: Vec<(ConnectionId, u16, Vec<u8>)>,
        forwards: Vec<(ConnectionId, ForwardEnvelope)>,
        destroyed: Vec<ConnectionId>,
        /// Largest envelope payload the backend link accepts
        payload_limit: Option<usize>,
    }

    impl RelayLink for MockRelayLink {
        fn is_connected(&self, conn: ConnectionId) -> bool {
            self.connected.contains(&conn)
        }

        fn is_client(&self, conn: ConnectionId) -> bool {
            self.clients.contains(&conn)
        }

        fn send_packet(&mut self, conn: ConnectionId, command: u16, payload: &[u8]) -> Result<(), NetError> {
            self.packets.push((conn, command, payload.to_vec()));
            Ok(())
        }

        fn forward_packet(
            &mut self,
            conn: ConnectionId,
            requestor: ConnectionId,
            command: u16,
            payload: &[u8],
        ) -> Result<(), NetError> {
            if let Some(max) = self.payload_limit {
                if payload.len() > max {
                    return Err(NetError::PayloadTooLarge {
                        len: payload.len() + ENVELOPE_OVERHEAD,
                        max: max + ENVELOPE_OVERHEAD,
                    });
                }
            }
            self.forwards.push((
                conn,
                ForwardEnvelope {
                    requestor,
                    command,
                    payload: payload.to_vec(),
                },
            ));
            Ok(())
        }

        fn destroy(&mut self, conn: ConnectionId) {
            self.destroyed.push(conn);
        }
    }

    const CLIENT_1: ConnectionId = ConnectionId(1);
    const CLIENT_2: ConnectionId = ConnectionId(2);
    const LOGIN_A: ConnectionId = ConnectionId(100);
    const LOGIN_B: ConnectionId = ConnectionId(101);
    const LOBBY: ConnectionId = ConnectionId(200);

    fn setup() -> (PeerRegistry, MockRelayLink) {
        let mut reg = PeerRegistry::new(local(1, PeerType::Gateway), BTreeMap::new());
        for (app_id, peer_type, conn) in [
            (10, PeerType::Login, LOGIN_A),
            (11, PeerType::Login, LOGIN_B),
            (20, PeerType::Lobby, LOBBY),
        ] {
            let mut desc = PeerDescriptor::new(app_id, peer_type);
            desc.connection = Some(conn);
            reg.add_server(desc).unwrap();
        }
        let mut link = MockRelayLink::default();
        link.connected.extend([LOGIN_A, LOGIN_B, LOBBY, CLIENT_1, CLIENT_2]);
        link.clients.extend([CLIENT_1, CLIENT_2]);
        (reg, link)
    }

    #[test]
    fn test_partition_routing() {
        let table = PartitionTable::gateway_default();
        assert_eq!(table.route(1000), Some(PeerType::Login));
        assert_eq!(table.route(1999), Some(PeerType::Login));
        assert_eq!(table.route(2500), Some(PeerType::Lobby));
        assert_eq!(table.route(999), None);
        assert_eq!(table.route(3000), None);
    }

    #[test]
    fn test_inbound_wraps_and_binds() {
        let (reg, mut link) = setup();
        let mut relay = Relay::new(PartitionTable::gateway_default());

        relay.inbound(&reg, &mut link, CLIENT_1, 1001, b"user").unwrap();

        let (backend, envelope) = &link.forwards[0];
        assert_eq!(*backend, LOGIN_A);
        assert_eq!(envelope.requestor, CLIENT_1);
        assert_eq!(envelope.command, 1001);
        assert_eq!(envelope.payload, b"user");
        assert_eq!(relay.bound_backend(CLIENT_1, PeerType::Login), Some(LOGIN_A));

        // Second command reuses the binding
        relay.inbound(&reg, &mut link, CLIENT_1, 1003, b"").unwrap();
        assert_eq!(link.forwards[1].0, LOGIN_A);
        assert_eq!(relay.load(LOGIN_A), 1);
    }

    #[test]
    fn test_load_aware_binding() {
        let (reg, mut link) = setup();
        let mut relay = Relay::new(PartitionTable::gateway_default());

        relay.inbound(&reg, &mut link, CLIENT_1, 1001, b"").unwrap();
        relay.inbound(&reg, &mut link, CLIENT_2, 1001, b"").unwrap();
        assert_eq!(relay.bound_backend(CLIENT_2, PeerType::Login), Some(LOGIN_B));
        assert_eq!(relay.load(LOGIN_A), 1);
        assert_eq!(relay.load(LOGIN_B), 1);
    }

    #[test]
    fn test_pinned_binding() {
        let (reg, link) = setup();
        let mut relay = Relay::new(PartitionTable::gateway_default());
        let bound = relay.bind_backend(&reg, &link, CLIENT_1, PeerType::Login, Some(11));
        assert_eq!(bound, Some(LOGIN_B));
        assert_eq!(relay.bind_backend(&reg, &link, CLIENT_1, PeerType::Login, Some(99)), None);
    }

    #[test]
    fn test_pin_command_selects_backend() {
        let (reg, mut link) = setup();
        let table = PartitionTable::new().with(LOGIN_RANGE, PeerType::Login).with_pin(1000);
        let mut relay = Relay::new(table);

        let mut body = 11u64.to_le_bytes().to_vec();
        body.extend_from_slice(b"rest");
        relay.inbound(&reg, &mut link, CLIENT_1, 1000, &body).unwrap();
        assert_eq!(relay.bound_backend(CLIENT_1, PeerType::Login), Some(LOGIN_B));
        assert_eq!(link.forwards[0].1.payload, body);

        // Same bytes under another command are not a pin
        relay.inbound(&reg, &mut link, CLIENT_2, 1001, &body).unwrap();
        assert_eq!(relay.bound_backend(CLIENT_2, PeerType::Login), Some(LOGIN_A));

        let err = relay
            .inbound(&reg, &mut link, ConnectionId(3), 1000, &99u64.to_le_bytes())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoBackend { command: 1000 }));
    }

    #[test]
    fn test_pinned_target_parsing() {
        let table = PartitionTable::gateway_default();
        assert_eq!(table.pinned_target(LOBBY_ENTER, &20u64.to_le_bytes()), Some(20));
        assert_eq!(table.pinned_target(LOBBY_ENTER, &0u64.to_le_bytes()), None);
        assert_eq!(table.pinned_target(LOBBY_ENTER, &[1, 2, 3]), None);
        assert_eq!(table.pinned_target(LOBBY_ENTER + 1, &20u64.to_le_bytes()), None);
    }

    #[test]
    fn test_unrouted_and_missing_backend() {
        let (reg, mut link) = setup();
        let mut relay = Relay::new(PartitionTable::gateway_default());

        assert!(matches!(
            relay.inbound(&reg, &mut link, CLIENT_1, 5000, b""),
            Err(ProtocolError::UnknownCommand(5000))
        ));

        link.connected.remove(&LOBBY);
        let err = relay.inbound(&reg, &mut link, CLIENT_1, 2001, b"").unwrap_err();
        assert!(matches!(err, ProtocolError::NoBackend { command: 2001 }));
        assert!(err.closes_client());
    }

    #[test]
    fn test_outbound_routes_by_requestor() {
        let (_reg, mut link) = setup();
        let relay = Relay::new(PartitionTable::gateway_default());
        let reply = ForwardEnvelope {
            requestor: CLIENT_2,
            command: 1002,
            payload: b"ok".to_vec(),
        };

        assert!(relay.outbound(&mut link, &reply));
        assert_eq!(link.packets, vec![(CLIENT_2, 1002, b"ok".to_vec())]);

        let orphan = ForwardEnvelope {
            requestor: ConnectionId(404),
            ..reply
        };
        assert!(!relay.outbound(&mut link, &orphan));
        assert_eq!(link.packets.len(), 1);
    }

    #[test]
    fn test_lose_backend_destroys_clients() {
        let (reg, mut link) = setup();
        let mut relay = Relay::new(PartitionTable::gateway_default());
        relay.inbound(&reg, &mut link, CLIENT_1, 1001, b"").unwrap();
        relay.inbound(&reg, &mut link, CLIENT_1, 2001, b"").unwrap();
        relay.inbound(&reg, &mut link, CLIENT_2, 2001, b"").unwrap();

        let lost = relay.lose_backend(&mut link, LOBBY);
        let lost: HashSet<_> = lost.into_iter().collect();
        assert_eq!(lost, HashSet::from([CLIENT_1, CLIENT_2]));
        assert_eq!(relay.bound_backend(CLIENT_1, PeerType::Lobby), None);
        assert_eq!(relay.bound_backend(CLIENT_1, PeerType::Login), Some(LOGIN_A));
        assert_eq!(link.destroyed.len(), 2);
    }

    #[test]
    fn test_client_disconnect_notifies_backend() {
        let (reg, mut link) = setup();
        let mut relay = Relay::new(PartitionTable::gateway_default());
        relay.inbound(&reg, &mut link, CLIENT_1, 1001, b"").unwrap();
        link.forwards.clear();

        relay.client_disconnected(&mut link, CLIENT_1);
        assert_eq!(link.forwards.len(), 1);
        let (backend, envelope) = &link.forwards[0];
        assert_eq!(*backend, LOGIN_A);
        assert_eq!(envelope.command, Command::RemoteDisconnected.code());
        assert_eq!(envelope.requestor, CLIENT_1);
        assert_eq!(relay.load(LOGIN_A), 0);
        assert_eq!(relay.bound_backend(CLIENT_1, PeerType::Login), None);
    }

    #[test]
    fn test_oversized_envelope_closes_client() {
        let (reg, mut link) = setup();
        link.payload_limit = Some(16);
        let mut relay = Relay::new(PartitionTable::gateway_default());

        relay.inbound(&reg, &mut link, CLIENT_1, 1001, &[0u8; 16]).unwrap();
        let err = relay.inbound(&reg, &mut link, CLIENT_1, 1001, &[0u8; 17]).unwrap_err();
        assert!(matches!(err, ProtocolError::EnvelopeTooLarge { command: 1001, len: 17 }));
        assert!(err.closes_client());

        let envelope = ForwardEnvelope {
            requestor: CLIENT_1,
            command: 2001,
            payload: vec![0u8; 32],
        };
        let err = relay.relay_envelope(&reg, &mut link, CLIENT_1, &envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::EnvelopeTooLarge { command: 2001, len: 32 }));
        assert_eq!(link.forwards.len(), 1);
    }

    #[test]
    fn test_client_envelope_relayed_unchanged() {
        let (reg, mut link) = setup();
        let mut relay = Relay::new(PartitionTable::gateway_default());
        let envelope = ForwardEnvelope {
            requestor: ConnectionId(77),
            command: 2001,
            payload: b"raw".to_vec(),
        };
        relay.relay_envelope(&reg, &mut link, CLIENT_1, &envelope).unwrap();
        assert_eq!(link.forwards, vec![(LOBBY, envelope)]);
    }
}
