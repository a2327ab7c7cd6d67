//! Peer registry: known mesh processes and the policy that keeps them connected
//!
//! The registry maps application ids to [`PeerDescriptor`]s. Descriptors never
//! own their connection; they hold a [`ConnectionId`] that is resolved through
//! a [`PeerLink`] whenever the registry needs the network.
//!
//! Subscriptions drive the periodic tick:
//! - interested *types*: keep one instance of that role connected, starting
//!   from the static endpoint in the config
//! - interested *ids*: keep that exact instance connected, giving up after
//!   [`MAX_RECONNECT_ATTEMPTS`] failed ticks

use std::collections::BTreeMap;

use crate::config::PeerEndpoint;
use crate::error::{NetError, RegistryError};
use crate::ids::{AppId, ConnectionId, GroupId};
use crate::protocol::{
    encode_body, Command, Heartbeat, Hello, PeerType, QueryServerInfos, QueryServerInfosAck,
    ServerInfo, PROTOCOL_VERSION,
};

// ============================================================================
// Constants
// ============================================================================

/// Reconnect attempts before an interested id is given up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Id of a descriptor whose identity is not known yet
pub const PLACEHOLDER_ID: AppId = 0;

// ============================================================================
// Network access
// ============================================================================

/// The registry's view of the network.
///
/// The node implements this over its listeners; tests use an in-memory mock.
pub trait PeerLink {
    /// Start an outbound connection. `None` if it could not be started.
    fn connect(&mut self, host: &str, port: u16, peer_type: PeerType) -> Option<ConnectionId>;

    /// The connection exists and has finished connecting.
    fn is_connected(&self, conn: ConnectionId) -> bool;

    fn send(&mut self, conn: ConnectionId, command: Command, body: &[u8]) -> Result<(), NetError>;

    /// Measured RTT, `None` if the connection is gone.
    fn rtt(&self, conn: ConnectionId) -> Option<i64>;

    fn ping(&mut self, conn: ConnectionId) -> Result<(), NetError>;

    fn set_app_id(&mut self, conn: ConnectionId, app_id: AppId);

    /// Request a deferred close.
    fn destroy(&mut self, conn: ConnectionId);
}

// ============================================================================
// Descriptors
// ============================================================================

/// What this process says about itself in handshakes and gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub app_id: AppId,
    pub group_id: GroupId,
    pub peer_type: PeerType,
    pub name: String,
}

impl LocalIdentity {
    pub fn hello(&self) -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            app_id: self.app_id,
            peer_type: self.peer_type,
            group_id: self.group_id,
            name: self.name.clone(),
        }
    }
}

/// One known remote application instance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PeerDescriptor {
    pub app_id: AppId,
    pub group_id: GroupId,
    pub peer_type: PeerType,
    pub name: String,
    /// Live connection, looked up by id; never owned here
    pub connection: Option<ConnectionId>,
    pub internal_addr: String,
    pub internal_port: u16,
    pub external_addr: String,
    pub external_port: u16,
    pub load: f32,
    pub player_count: u32,
    pub session_count: u32,
    pub hello_sent: bool,
    pub reconnect_attempts: u32,
    /// The peer's own view of further peers
    pub children: BTreeMap<AppId, PeerDescriptor>,
}

impl PeerDescriptor {
    pub fn new(app_id: AppId, peer_type: PeerType) -> Self {
        PeerDescriptor {
            app_id,
            peer_type,
            ..Default::default()
        }
    }

    pub fn from_info(info: &ServerInfo) -> Self {
        let mut desc = PeerDescriptor::new(info.app_id, info.peer_type);
        desc.apply_info(info);
        desc
    }

    /// Copy advertised fields, leaving connection state alone.
    pub fn apply_info(&mut self, info: &ServerInfo) {
        self.app_id = info.app_id;
        self.group_id = info.group_id;
        self.peer_type = info.peer_type;
        self.name = info.name.clone();
        self.internal_addr = info.internal_addr.clone();
        self.internal_port = info.internal_port;
        self.external_addr = info.external_addr.clone();
        self.external_port = info.external_port;
        self.load = info.load;
        self.player_count = info.player_count;
        self.session_count = info.session_count;
    }

    /// Advertised fields, children excluded.
    pub fn to_info(&self) -> ServerInfo {
        ServerInfo {
            app_id: self.app_id,
            group_id: self.group_id,
            peer_type: self.peer_type,
            name: self.name.clone(),
            internal_addr: self.internal_addr.clone(),
            internal_port: self.internal_port,
            external_addr: self.external_addr.clone(),
            external_port: self.external_port,
            load: self.load,
            player_count: self.player_count,
            session_count: self.session_count,
            children: Vec::new(),
        }
    }

    pub fn has_child_of_type(&self, peer_type: PeerType) -> bool {
        self.children.values().any(|c| c.peer_type == peer_type)
    }
}

/// Membership changes the owning node forwards to its role.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    PeerJoined(PeerDescriptor),
    PeerExited(PeerDescriptor),
}

// ============================================================================
// Registry
// ============================================================================

pub struct PeerRegistry {
    local: LocalIdentity,
    peers: BTreeMap<AppId, PeerDescriptor>,
    interested_types: Vec<PeerType>,
    interested_ids: Vec<AppId>,
    endpoints: BTreeMap<PeerType, PeerEndpoint>,
}

impl PeerRegistry {
    pub fn new(local: LocalIdentity, endpoints: BTreeMap<PeerType, PeerEndpoint>) -> Self {
        PeerRegistry {
            local,
            peers: BTreeMap::new(),
            interested_types: Vec::new(),
            interested_ids: Vec::new(),
            endpoints,
        }
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    // ------------------------------------------------------------------------
    // Descriptor map
    // ------------------------------------------------------------------------

    pub fn add_server(&mut self, desc: PeerDescriptor) -> Result<(), RegistryError> {
        if self.peers.contains_key(&desc.app_id) {
            return Err(RegistryError::Duplicate(desc.app_id));
        }
        if desc.app_id == self.local.app_id {
            return Err(RegistryError::SelfId(desc.app_id));
        }
        self.peers.insert(desc.app_id, desc);
        Ok(())
    }

    pub fn del_server(&mut self, app_id: AppId) -> Result<PeerDescriptor, RegistryError> {
        self.peers
            .remove(&app_id)
            .ok_or(RegistryError::NotFound(app_id))
    }

    pub fn find(&self, app_id: AppId) -> Option<&PeerDescriptor> {
        self.peers.get(&app_id)
    }

    pub fn find_mut(&mut self, app_id: AppId) -> Option<&mut PeerDescriptor> {
        self.peers.get_mut(&app_id)
    }

    pub fn find_by_connection(&self, conn: ConnectionId) -> Option<&PeerDescriptor> {
        self.peers.values().find(|d| d.connection == Some(conn))
    }

    /// Descriptors of `peer_type`, optionally one exact id (non-zero), capped
    /// at `max` results (0 = no cap).
    pub fn find_by_type(&self, peer_type: PeerType, app_id: AppId, max: usize) -> Vec<&PeerDescriptor> {
        let mut found = Vec::new();
        for desc in self.peers.values() {
            if desc.peer_type != peer_type {
                continue;
            }
            if app_id > 0 && app_id != desc.app_id {
                continue;
            }
            found.push(desc);
            if max > 0 && found.len() >= max {
                break;
            }
        }
        found
    }

    pub fn find_one(&self, peer_type: PeerType) -> Option<&PeerDescriptor> {
        self.find_by_type(peer_type, 0, 1).into_iter().next()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerDescriptor> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    pub fn add_interested_type(&mut self, peer_type: PeerType) {
        if !self.interested_types.contains(&peer_type) {
            log::info!("interested in {} peers", peer_type);
            self.interested_types.push(peer_type);
        }
    }

    /// Drop the subscription and every descriptor of that type, destroying
    /// their connections.
    pub fn remove_interested_type(&mut self, peer_type: PeerType, link: &mut impl PeerLink) {
        if let Some(pos) = self.interested_types.iter().position(|t| *t == peer_type) {
            self.interested_types.remove(pos);
            log::info!("no longer interested in {} peers", peer_type);
        }

        let doomed: Vec<AppId> = self
            .peers
            .values()
            .filter(|d| d.peer_type == peer_type)
            .map(|d| d.app_id)
            .collect();
        for app_id in doomed {
            if let Some(desc) = self.peers.remove(&app_id) {
                if let Some(conn) = desc.connection {
                    link.destroy(conn);
                }
            }
        }
    }

    pub fn interested_types(&self) -> &[PeerType] {
        &self.interested_types
    }

    pub fn add_interested_id(&mut self, app_id: AppId) {
        if !self.interested_ids.contains(&app_id) {
            log::info!("interested in peer {}", app_id);
            self.interested_ids.push(app_id);
        }
    }

    pub fn remove_interested_id(&mut self, app_id: AppId) {
        if let Some(pos) = self.interested_ids.iter().position(|id| *id == app_id) {
            self.interested_ids.remove(pos);
            log::info!("no longer interested in peer {}", app_id);
        }
    }

    pub fn interested_ids(&self) -> &[AppId] {
        &self.interested_ids
    }

    // ------------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------------

    /// Discovery and reconnection. At most one outbound connect per tick.
    pub fn on_tick(&mut self, link: &mut impl PeerLink) -> Vec<RegistryEvent> {
        let mut events = Vec::new();

        for peer_type in self.interested_types.clone() {
            let known = self.find_one(peer_type).map(|d| d.app_id);
            match known {
                None => {
                    log::info!("finding {} ...", peer_type);
                    let endpoint = match self.endpoints.get(&peer_type) {
                        Some(ep) => ep.clone(),
                        None => {
                            log::warn!("no static endpoint configured for {}", peer_type);
                            continue;
                        }
                    };

                    let mut placeholder = PeerDescriptor::new(PLACEHOLDER_ID, peer_type);
                    placeholder.internal_addr = endpoint.host.clone();
                    placeholder.internal_port = endpoint.port;
                    placeholder.connection = link.connect(&endpoint.host, endpoint.port, peer_type);

                    if placeholder.connection.is_some() {
                        if let Err(e) = self.add_server(placeholder) {
                            log::warn!("placeholder for {} not added: {}", peer_type, e);
                        }
                    }
                    return events;
                }
                Some(PLACEHOLDER_ID) => {
                    self.send_hello_once(PLACEHOLDER_ID, link);
                    return events;
                }
                Some(_) => {}
            }
        }

        for app_id in self.interested_ids.clone() {
            let (connection, host, port, peer_type) = match self.peers.get(&app_id) {
                Some(d) => (d.connection, d.internal_addr.clone(), d.internal_port, d.peer_type),
                None => {
                    log::error!("interested peer {} not found", app_id);
                    self.remove_interested_id(app_id);
                    return events;
                }
            };

            if connection.is_some() {
                self.send_hello_once(app_id, link);
                continue;
            }

            let attempts = match self.peers.get_mut(&app_id) {
                Some(d) => {
                    d.reconnect_attempts += 1;
                    d.reconnect_attempts
                }
                None => continue,
            };

            if attempts > MAX_RECONNECT_ATTEMPTS {
                log::warn!("giving up on {} {} after {} attempts", peer_type, app_id, attempts - 1);
                self.remove_interested_id(app_id);
                if let Ok(desc) = self.del_server(app_id) {
                    events.push(RegistryEvent::PeerExited(desc));
                }
                return events;
            }

            log::error!(
                "lost connection to {} {}, reconnecting ({})...",
                peer_type,
                app_id,
                attempts
            );
            let conn = link.connect(&host, port, peer_type);
            if let Some(conn) = conn {
                link.set_app_id(conn, app_id);
            }
            if let Some(d) = self.peers.get_mut(&app_id) {
                d.connection = conn;
                d.hello_sent = false;
            }
        }

        events
    }

    fn send_hello_once(&mut self, app_id: AppId, link: &mut impl PeerLink) {
        let hello = self.local.hello();
        let desc = match self.peers.get_mut(&app_id) {
            Some(d) => d,
            None => return,
        };
        let conn = match desc.connection {
            Some(c) if link.is_connected(c) && !desc.hello_sent => c,
            _ => return,
        };

        desc.hello_sent = true;
        match encode_body(&hello) {
            Ok(body) => {
                if let Err(e) = link.send(conn, Command::Hello, &body) {
                    log::warn!("hello to {} failed: {}", conn, e);
                }
            }
            Err(e) => log::error!("failed to encode hello: {}", e),
        }
    }

    /// Heartbeat every descriptor that has a connection.
    pub fn on_heartbeat(&mut self, link: &mut impl PeerLink) {
        let body = match encode_body(&Heartbeat {
            app_id: self.local.app_id,
        }) {
            Ok(b) => b,
            Err(e) => {
                log::error!("failed to encode heartbeat: {}", e);
                return;
            }
        };

        for desc in self.peers.values() {
            if let Some(conn) = desc.connection {
                if let Err(e) = link.send(conn, Command::Heartbeat, &body) {
                    log::trace!("heartbeat to {} failed: {}", desc.app_id, e);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connection notifications
    // ------------------------------------------------------------------------

    /// A peer connection closed; its descriptor (if any) is gone.
    pub fn on_connection_closed(&mut self, conn: ConnectionId) -> Vec<RegistryEvent> {
        let app_id = match self.find_by_connection(conn) {
            Some(d) => d.app_id,
            None => return Vec::new(),
        };
        match self.peers.remove(&app_id) {
            Some(desc) => {
                log::info!("{} {} exited", desc.peer_type, desc.app_id);
                vec![RegistryEvent::PeerExited(desc)]
            }
            None => Vec::new(),
        }
    }

    /// Inbound Hello on `conn` from `ip:port`.
    pub fn on_hello(&mut self, conn: ConnectionId, hello: &Hello, ip: &str, port: u16) -> Vec<RegistryEvent> {
        if let Some(desc) = self.rekey(conn, hello) {
            return vec![RegistryEvent::PeerJoined(desc)];
        }

        let mut desc = PeerDescriptor::new(hello.app_id, hello.peer_type);
        desc.group_id = hello.group_id;
        desc.name = hello.name.clone();
        desc.internal_addr = ip.to_string();
        desc.internal_port = port;
        desc.connection = Some(conn);
        desc.hello_sent = true;

        match self.add_server(desc.clone()) {
            Ok(()) => {
                log::info!("{} {} joined ({}:{})", desc.peer_type, desc.app_id, ip, port);
                vec![RegistryEvent::PeerJoined(desc)]
            }
            Err(e) => {
                log::warn!("hello from {}:{} ignored: {}", ip, port, e);
                Vec::new()
            }
        }
    }

    /// HelloAck on an outbound connection: confirm and re-key its descriptor.
    pub fn on_hello_ack(&mut self, conn: ConnectionId, ack: &Hello) -> Vec<RegistryEvent> {
        match self.rekey(conn, ack) {
            Some(desc) => {
                log::info!("{} {} confirmed", desc.peer_type, desc.app_id);
                vec![RegistryEvent::PeerJoined(desc)]
            }
            None => {
                log::debug!("hello ack on {} with no descriptor", conn);
                Vec::new()
            }
        }
    }

    /// Move the descriptor bound to `conn` under the id it just announced.
    /// An id that is ours or held by another descriptor leaves the map as is.
    fn rekey(&mut self, conn: ConnectionId, hello: &Hello) -> Option<PeerDescriptor> {
        let old_id = self.find_by_connection(conn)?.app_id;
        if hello.app_id == self.local.app_id {
            log::warn!("{} on {} announced our own id {}, ignored", hello.peer_type, conn, hello.app_id);
            return None;
        }
        if hello.app_id != old_id && self.peers.contains_key(&hello.app_id) {
            log::warn!(
                "{} on {} announced id {} owned by another connection, ignored",
                hello.peer_type,
                conn,
                hello.app_id
            );
            return None;
        }
        let mut desc = self.peers.remove(&old_id)?;

        desc.app_id = hello.app_id;
        desc.group_id = hello.group_id;
        desc.name = hello.name.clone();
        if hello.peer_type != PeerType::Unknown {
            desc.peer_type = hello.peer_type;
        }
        desc.reconnect_attempts = 0;

        if old_id != desc.app_id {
            self.interested_ids.iter_mut().filter(|id| **id == old_id).for_each(|id| *id = desc.app_id);
        }
        self.peers.insert(desc.app_id, desc.clone());
        Some(desc)
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// UpdateServerInfos from a known peer.
    pub fn apply_update(&mut self, info: &ServerInfo) -> Result<(), RegistryError> {
        let local_id = self.local.app_id;
        if info.app_id == local_id {
            return Err(RegistryError::SelfId(info.app_id));
        }
        let desc = self
            .peers
            .get_mut(&info.app_id)
            .ok_or(RegistryError::NotFound(info.app_id))?;

        desc.apply_info(info);
        desc.children = info
            .children
            .iter()
            .filter(|c| c.app_id != local_id)
            .map(|c| (c.app_id, PeerDescriptor::from_info(c)))
            .collect();

        log::info!(
            "{} {} updated: external {}:{}, sessions {}, {} children",
            desc.peer_type,
            desc.app_id,
            desc.external_addr,
            desc.external_port,
            desc.session_count,
            desc.children.len()
        );
        Ok(())
    }

    /// Answer a QueryServerInfos. A query naming this process gets nothing.
    pub fn query(&self, request: &QueryServerInfos) -> QueryServerInfosAck {
        if request.app_id == self.local.app_id {
            return QueryServerInfosAck::default();
        }
        let servers = self
            .find_by_type(request.peer_type, request.app_id, request.max_count as usize)
            .into_iter()
            .filter(|d| request.group_id == 0 || request.group_id == d.group_id)
            .map(PeerDescriptor::to_info)
            .collect();
        QueryServerInfosAck { servers }
    }

    /// Merge a QueryServerInfosAck: update known peers, add the rest without
    /// a connection.
    pub fn merge_query_results(&mut self, ack: &QueryServerInfosAck) {
        for info in &ack.servers {
            if info.app_id == self.local.app_id {
                continue;
            }
            match self.peers.get_mut(&info.app_id) {
                Some(desc) => desc.apply_info(info),
                None => {
                    if let Err(e) = self.add_server(PeerDescriptor::from_info(info)) {
                        log::debug!("query result {} not added: {}", info.app_id, e);
                    }
                }
            }
        }
    }

    /// Every descriptor as a gossip child entry.
    pub fn snapshot_children(&self) -> Vec<ServerInfo> {
        self.peers.values().map(PeerDescriptor::to_info).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::decode_body;
    use std::collections::{HashMap, HashSet};

    /// In-memory network for registry and selector tests.
    #[derive(Default)]
    pub(crate) struct MockLink {
        pub next: u64,
        pub refuse: bool,
        pub connects: Vec<(String, u16, PeerType)>,
        pub connected: HashSet<ConnectionId>,
        pub sent: Vec<(ConnectionId, Command, Vec<u8>)>,
        pub rtts: HashMap<ConnectionId, i64>,
        pub pings: Vec<ConnectionId>,
        pub app_ids: HashMap<ConnectionId, AppId>,
        pub destroyed: Vec<ConnectionId>,
    }

    impl MockLink {
        pub fn sent_commands(&self, command: Command) -> Vec<ConnectionId> {
            self.sent
                .iter()
                .filter(|(_, c, _)| *c == command)
                .map(|(conn, _, _)| *conn)
                .collect()
        }
    }

    impl PeerLink for MockLink {
        fn connect(&mut self, host: &str, port: u16, peer_type: PeerType) -> Option<ConnectionId> {
            self.connects.push((host.to_string(), port, peer_type));
            if self.refuse {
                return None;
            }
            self.next += 1;
            let conn = ConnectionId(self.next);
            self.rtts.insert(conn, -1);
            Some(conn)
        }

        fn is_connected(&self, conn: ConnectionId) -> bool {
            self.connected.contains(&conn)
        }

        fn send(&mut self, conn: ConnectionId, command: Command, body: &[u8]) -> Result<(), NetError> {
            self.sent.push((conn, command, body.to_vec()));
            Ok(())
        }

        fn rtt(&self, conn: ConnectionId) -> Option<i64> {
            self.rtts.get(&conn).copied()
        }

        fn ping(&mut self, conn: ConnectionId) -> Result<(), NetError> {
            self.pings.push(conn);
            Ok(())
        }

        fn set_app_id(&mut self, conn: ConnectionId, app_id: AppId) {
            self.app_ids.insert(conn, app_id);
        }

        fn destroy(&mut self, conn: ConnectionId) {
            self.destroyed.push(conn);
        }
    }

    pub(crate) fn local(app_id: AppId, peer_type: PeerType) -> LocalIdentity {
        LocalIdentity {
            app_id,
            group_id: 1,
            peer_type,
            name: format!("{}-{}", peer_type, app_id),
        }
    }

    fn registry_with_directory() -> PeerRegistry {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            PeerType::Directory,
            PeerEndpoint {
                host: "127.0.0.1".into(),
                port: 7100,
            },
        );
        PeerRegistry::new(local(5, PeerType::Login), endpoints)
    }

    fn hello(app_id: AppId, peer_type: PeerType) -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            app_id,
            peer_type,
            group_id: 1,
            name: format!("peer-{}", app_id),
        }
    }

    #[test]
    fn test_add_rejects_duplicate_and_self() {
        let mut reg = registry_with_directory();
        assert!(reg.add_server(PeerDescriptor::new(9, PeerType::Gateway)).is_ok());
        assert_eq!(
            reg.add_server(PeerDescriptor::new(9, PeerType::Gateway)),
            Err(RegistryError::Duplicate(9))
        );
        assert_eq!(
            reg.add_server(PeerDescriptor::new(5, PeerType::Gateway)),
            Err(RegistryError::SelfId(5))
        );
        assert!(reg.del_server(9).is_ok());
        assert_eq!(reg.del_server(9), Err(RegistryError::NotFound(9)));
    }

    #[test]
    fn test_find_by_type_filters() {
        let mut reg = registry_with_directory();
        for id in [10, 11, 12] {
            reg.add_server(PeerDescriptor::new(id, PeerType::Gateway)).unwrap();
        }
        reg.add_server(PeerDescriptor::new(20, PeerType::Lobby)).unwrap();

        assert_eq!(reg.find_by_type(PeerType::Gateway, 0, 0).len(), 3);
        assert_eq!(reg.find_by_type(PeerType::Gateway, 0, 2).len(), 2);
        assert_eq!(reg.find_by_type(PeerType::Gateway, 11, 0)[0].app_id, 11);
        assert_eq!(reg.find_one(PeerType::Lobby).map(|d| d.app_id), Some(20));
        assert!(reg.find_one(PeerType::Room).is_none());
    }

    #[test]
    fn test_discovery_one_connect_per_tick() {
        let mut reg = registry_with_directory();
        let mut link = MockLink {
            refuse: true,
            ..Default::default()
        };
        reg.add_interested_type(PeerType::Directory);
        reg.add_interested_type(PeerType::Gateway);

        for tick in 1..=5 {
            reg.on_tick(&mut link);
            assert_eq!(link.connects.len(), tick);
        }
        assert!(reg.is_empty());
        assert_eq!(link.connects[0], ("127.0.0.1".to_string(), 7100, PeerType::Directory));
    }

    #[test]
    fn test_placeholder_hello_sent_once() {
        let mut reg = registry_with_directory();
        let mut link = MockLink::default();
        reg.add_interested_type(PeerType::Directory);

        reg.on_tick(&mut link);
        let placeholder = reg.find(PLACEHOLDER_ID).unwrap().clone();
        let conn = placeholder.connection.unwrap();

        // Still connecting: nothing sent, no new connect
        reg.on_tick(&mut link);
        assert!(link.sent.is_empty());
        assert_eq!(link.connects.len(), 1);

        link.connected.insert(conn);
        reg.on_tick(&mut link);
        reg.on_tick(&mut link);
        assert_eq!(link.sent_commands(Command::Hello), vec![conn]);

        let (_, _, body) = &link.sent[0];
        let sent: Hello = decode_body(Command::Hello.code(), body).unwrap();
        assert_eq!(sent.app_id, 5);
        assert_eq!(sent.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_placeholder_rekeyed() {
        let mut reg = registry_with_directory();
        let mut link = MockLink::default();
        reg.add_interested_type(PeerType::Directory);
        reg.on_tick(&mut link);
        let conn = reg.find(PLACEHOLDER_ID).unwrap().connection.unwrap();

        let events = reg.on_hello_ack(conn, &hello(42, PeerType::Directory));

        assert_eq!(reg.len(), 1);
        assert!(reg.find(PLACEHOLDER_ID).is_none());
        let desc = reg.find(42).unwrap();
        assert_eq!(desc.connection, Some(conn));
        assert_eq!(desc.name, "peer-42");
        assert!(matches!(&events[..], [RegistryEvent::PeerJoined(d)] if d.app_id == 42));
    }

    #[test]
    fn test_rekey_keeps_existing_owner() {
        let mut reg = registry_with_directory();
        reg.on_hello(ConnectionId(3), &hello(42, PeerType::Gateway), "127.0.0.1", 5555);
        reg.on_hello(ConnectionId(9), &hello(7, PeerType::Gateway), "127.0.0.1", 5556);

        let events = reg.on_hello_ack(ConnectionId(9), &hello(42, PeerType::Gateway));
        assert!(events.is_empty());
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.find(42).unwrap().connection, Some(ConnectionId(3)));
        assert_eq!(reg.find(7).unwrap().connection, Some(ConnectionId(9)));

        // Conn 3 still owns 42, so its close reports the exit
        let events = reg.on_connection_closed(ConnectionId(3));
        assert!(matches!(&events[..], [RegistryEvent::PeerExited(d)] if d.app_id == 42));
    }

    #[test]
    fn test_rekey_rejects_local_id() {
        let mut reg = registry_with_directory();
        let mut link = MockLink::default();
        reg.add_interested_type(PeerType::Directory);
        reg.on_tick(&mut link);
        let conn = reg.find(PLACEHOLDER_ID).unwrap().connection.unwrap();

        let events = reg.on_hello_ack(conn, &hello(5, PeerType::Directory));
        assert!(events.is_empty());
        assert!(reg.find(5).is_none());
        assert_eq!(reg.find(PLACEHOLDER_ID).unwrap().connection, Some(conn));

        // Inbound hello on a registered connection is held to the same rule
        reg.on_hello(ConnectionId(3), &hello(77, PeerType::Gateway), "127.0.0.1", 5555);
        let events = reg.on_hello(ConnectionId(3), &hello(5, PeerType::Gateway), "127.0.0.1", 5555);
        assert!(events.is_empty());
        assert!(reg.find(5).is_none());
        assert_eq!(reg.find(77).unwrap().connection, Some(ConnectionId(3)));
    }

    #[test]
    fn test_inbound_hello_registers_peer() {
        let mut reg = registry_with_directory();
        let events = reg.on_hello(ConnectionId(3), &hello(77, PeerType::Gateway), "127.0.0.1", 5555);
        assert_eq!(events.len(), 1);

        let desc = reg.find(77).unwrap();
        assert_eq!(desc.connection, Some(ConnectionId(3)));
        assert_eq!(desc.internal_port, 5555);

        // Same id on another connection is a duplicate
        let events = reg.on_hello(ConnectionId(4), &hello(77, PeerType::Gateway), "127.0.0.1", 5556);
        assert!(events.is_empty());
        assert_eq!(reg.find(77).unwrap().connection, Some(ConnectionId(3)));
    }

    #[test]
    fn test_bounded_reconnection() {
        let mut reg = registry_with_directory();
        let mut link = MockLink {
            refuse: true,
            ..Default::default()
        };
        let mut desc = PeerDescriptor::new(30, PeerType::Gateway);
        desc.internal_addr = "127.0.0.1".into();
        desc.internal_port = 7200;
        reg.add_server(desc).unwrap();
        reg.add_interested_id(30);

        let mut exits = 0;
        for tick in 1..=10 {
            let events = reg.on_tick(&mut link);
            assert!(events.is_empty(), "tick {}", tick);
            assert_eq!(reg.find(30).unwrap().reconnect_attempts, tick);
        }
        assert_eq!(link.connects.len(), 10);

        let events = reg.on_tick(&mut link);
        exits += events
            .iter()
            .filter(|e| matches!(e, RegistryEvent::PeerExited(d) if d.app_id == 30))
            .count();
        assert!(reg.find(30).is_none());
        assert!(reg.interested_ids().is_empty());

        for _ in 0..5 {
            exits += reg.on_tick(&mut link).len();
        }
        assert_eq!(exits, 1);
        assert_eq!(link.connects.len(), 10);
    }

    #[test]
    fn test_reconnect_sets_connection_and_resends_hello() {
        let mut reg = registry_with_directory();
        let mut link = MockLink::default();
        reg.add_server(PeerDescriptor::new(30, PeerType::Gateway)).unwrap();
        reg.add_interested_id(30);

        reg.on_tick(&mut link);
        let conn = reg.find(30).unwrap().connection.unwrap();
        assert_eq!(link.app_ids.get(&conn), Some(&30));

        link.connected.insert(conn);
        reg.on_tick(&mut link);
        assert_eq!(link.sent_commands(Command::Hello), vec![conn]);
    }

    #[test]
    fn test_vanished_interest_dropped() {
        let mut reg = registry_with_directory();
        let mut link = MockLink::default();
        reg.add_interested_id(99);
        reg.on_tick(&mut link);
        assert!(reg.interested_ids().is_empty());
        assert!(link.connects.is_empty());
    }

    #[test]
    fn test_connection_closed_reports_exit() {
        let mut reg = registry_with_directory();
        reg.on_hello(ConnectionId(3), &hello(77, PeerType::Gateway), "127.0.0.1", 1);

        let events = reg.on_connection_closed(ConnectionId(3));
        assert!(matches!(&events[..], [RegistryEvent::PeerExited(d)] if d.app_id == 77));
        assert!(reg.is_empty());
        assert!(reg.on_connection_closed(ConnectionId(3)).is_empty());
    }

    #[test]
    fn test_remove_interested_type_destroys_connections() {
        let mut reg = registry_with_directory();
        let mut link = MockLink::default();
        reg.add_interested_type(PeerType::Directory);
        reg.on_tick(&mut link);
        let conn = reg.find(PLACEHOLDER_ID).unwrap().connection.unwrap();

        reg.remove_interested_type(PeerType::Directory, &mut link);
        assert!(reg.is_empty());
        assert!(reg.interested_types().is_empty());
        assert_eq!(link.destroyed, vec![conn]);
    }

    #[test]
    fn test_heartbeat_fan_out() {
        let mut reg = registry_with_directory();
        let mut link = MockLink::default();
        reg.on_hello(ConnectionId(3), &hello(77, PeerType::Gateway), "127.0.0.1", 1);
        reg.on_hello(ConnectionId(4), &hello(78, PeerType::Lobby), "127.0.0.1", 2);
        reg.add_server(PeerDescriptor::new(79, PeerType::Room)).unwrap();

        reg.on_heartbeat(&mut link);
        let mut targets = link.sent_commands(Command::Heartbeat);
        targets.sort();
        assert_eq!(targets, vec![ConnectionId(3), ConnectionId(4)]);
    }

    #[test]
    fn test_update_replaces_children() {
        let mut reg = registry_with_directory();
        reg.on_hello(ConnectionId(3), &hello(77, PeerType::Gateway), "127.0.0.1", 1);

        let info = ServerInfo {
            app_id: 77,
            peer_type: PeerType::Gateway,
            external_addr: "203.0.113.1".into(),
            external_port: 9000,
            session_count: 4,
            children: vec![
                ServerInfo {
                    app_id: 5,
                    peer_type: PeerType::Login,
                    ..Default::default()
                },
                ServerInfo {
                    app_id: 8,
                    peer_type: PeerType::Login,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        reg.apply_update(&info).unwrap();

        let desc = reg.find(77).unwrap();
        assert_eq!(desc.session_count, 4);
        assert_eq!(desc.connection, Some(ConnectionId(3)));
        // Our own id is skipped
        assert_eq!(desc.children.keys().copied().collect::<Vec<_>>(), vec![8]);
        assert!(desc.has_child_of_type(PeerType::Login));

        assert_eq!(
            reg.apply_update(&ServerInfo {
                app_id: 1234,
                ..Default::default()
            }),
            Err(RegistryError::NotFound(1234))
        );
    }

    #[test]
    fn test_query_and_merge() {
        let mut directory = PeerRegistry::new(local(1, PeerType::Directory), BTreeMap::new());
        let mut g = PeerDescriptor::new(40, PeerType::Gateway);
        g.group_id = 1;
        g.session_count = 3;
        directory.add_server(g).unwrap();
        let mut other = PeerDescriptor::new(41, PeerType::Gateway);
        other.group_id = 2;
        directory.add_server(other).unwrap();

        let ack = directory.query(&QueryServerInfos {
            app_id: 0,
            group_id: 1,
            peer_type: PeerType::Gateway,
            max_count: 0,
        });
        assert_eq!(ack.servers.len(), 1);
        assert_eq!(ack.servers[0].app_id, 40);

        let mut login = registry_with_directory();
        login.merge_query_results(&ack);
        let merged = login.find(40).unwrap();
        assert_eq!(merged.session_count, 3);
        assert!(merged.connection.is_none());

        // Query naming the directory itself returns nothing
        let ack = directory.query(&QueryServerInfos {
            app_id: 1,
            group_id: 0,
            peer_type: PeerType::Gateway,
            max_count: 0,
        });
        assert!(ack.servers.is_empty());
    }

    #[test]
    fn test_snapshot_children() {
        let mut reg = registry_with_directory();
        reg.add_server(PeerDescriptor::new(10, PeerType::Gateway)).unwrap();
        reg.add_server(PeerDescriptor::new(11, PeerType::Lobby)).unwrap();
        let snapshot = reg.snapshot_children();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|s| s.children.is_empty()));
    }
}
