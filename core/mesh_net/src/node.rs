//! Node runtime
//!
//! A [`Node`] owns one process's reactor, its internal (peer) and optional
//! external (client) listeners, the peer registry, the optional gateway
//! selector and the injected [`Role`]. It answers the built-in protocol itself
//! and hands everything else to the role through a [`NodeContext`].
//!
//! ```text
//!              ┌──────────────────── Node ────────────────────┐
//!  peers ────► │ internal listener ─┐                         │
//!              │                    ├─► frames ─► built-ins ──┼─► registry / selector
//!  clients ──► │ external listener ─┘            └─► role ────┼─► NodeContext
//!              │ timers: tick, heartbeat, registry, selector  │
//!              └──────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use ring::rand::SystemRandom;
use serde::Serialize;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGQUIT, SIGTERM};

use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{NetError, ProtocolError};
use crate::ids::{random_app_id, AppId, ConnectionId, ConnectionIdGenerator};
use crate::listener::{HostCache, Listener, ListenerKind, Lookup};
use crate::protocol::{
    command_name, decode_body, Command, ForwardEnvelope, Frame, Heartbeat, Hello, HelloAck, PeerType,
    Ping, QueryServerInfos, QueryServerInfosAck, ServerInfo, VersionMismatch, PROTOCOL_VERSION,
};
use crate::reactor::{EventHandler, IoEvent, Reactor, SignalWatch, TimerId};
use crate::registry::{LocalIdentity, PeerLink, PeerRegistry, RegistryEvent};
use crate::role::Role;
use crate::selector::{GatewaySelector, SELECTOR_TICK};
use crate::socket::ReadStatus;
use crate::tunnel::RelayLink;
use crate::worker::WorkerPool;

// ============================================================================
// Constants
// ============================================================================

/// Registry discovery and reconnection period
pub const REGISTRY_TICK: Duration = Duration::from_secs(1);

/// Grace period after SIGINT, SIGQUIT or SIGHUP. SIGTERM drains for the
/// configured `shutdown_time_ms` instead.
pub const SIGNAL_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub const ENV_APP_ID: &str = "SERVER_APPID";
pub const ENV_GROUP_ID: &str = "SERVER_APPGID";
pub const ENV_TYPE: &str = "SERVER_TYPE";

// ============================================================================
// Types
// ============================================================================

/// Timer payloads armed by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTimer {
    Tick,
    Heartbeat,
    RegistryTick,
    SelectorTick,
    ShutdownTick,
    ShutdownExpired,
    Destroy(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Running,
    ShutdownWaiting,
    ShutdownOver,
}

/// Give a process configured with id 0 a random one.
pub fn resolve_identity(mut identity: LocalIdentity, rng: &SystemRandom) -> Result<LocalIdentity, NetError> {
    if identity.app_id == 0 {
        identity.app_id = random_app_id(rng)?;
        log::info!("no app id configured, using {}", identity.app_id);
    }
    Ok(identity)
}

/// How long a node lets `signal` drain it before exiting. `None` for signals
/// that do not stop the node.
pub fn signal_grace(config: &NodeConfig, signal: i32) -> Option<Duration> {
    match signal {
        SIGTERM => Some(config.shutdown_period()),
        SIGINT | SIGQUIT | SIGHUP => Some(SIGNAL_SHUTDOWN_GRACE),
        _ => None,
    }
}

/// Publish the identity for child processes.
pub fn export_environment(identity: &LocalIdentity) {
    std::env::set_var(ENV_APP_ID, identity.app_id.to_string());
    std::env::set_var(ENV_GROUP_ID, identity.group_id.to_string());
    std::env::set_var(ENV_TYPE, identity.peer_type.name());
}

// ============================================================================
// Network
// ============================================================================

/// Both listeners, the connection id source and the resolved host names.
pub struct Network {
    internal: Listener,
    external: Option<Listener>,
    ids: ConnectionIdGenerator,
    hosts: HostCache,
}

impl Network {
    pub fn internal(&self) -> &Listener {
        &self.internal
    }

    pub fn external(&self) -> Option<&Listener> {
        self.external.as_ref()
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&Connection> {
        self.internal
            .get(conn)
            .or_else(|| self.external.as_ref()?.get(conn))
    }

    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut Connection> {
        if self.internal.contains(conn) {
            return self.internal.get_mut(conn);
        }
        self.external.as_mut()?.get_mut(conn)
    }

    /// Live connections on both listeners.
    pub fn session_count(&self) -> usize {
        self.internal.len() + self.external.as_ref().map_or(0, Listener::len)
    }

    fn by_token(&self, token: mio::Token) -> Option<ConnectionId> {
        self.internal
            .by_token(token)
            .or_else(|| self.external.as_ref()?.by_token(token))
    }

    fn remove(&mut self, conn: ConnectionId) -> Option<Connection> {
        self.internal
            .remove(conn)
            .or_else(|| self.external.as_mut()?.remove(conn))
    }

    fn all_ids(&self) -> Vec<ConnectionId> {
        let mut ids = self.internal.ids();
        if let Some(external) = &self.external {
            ids.extend(external.ids());
        }
        ids
    }

    fn send_packet(&mut self, conn: ConnectionId, command: u16, payload: &[u8]) -> Result<(), NetError> {
        self.get_mut(conn)
            .ok_or(NetError::UnknownConnection(conn))?
            .send_packet(command, payload)
    }

    fn send_message<M: Serialize>(&mut self, conn: ConnectionId, command: Command, msg: &M) -> Result<(), NetError> {
        self.get_mut(conn)
            .ok_or(NetError::UnknownConnection(conn))?
            .send_message(command, msg)
    }

    fn destroy(&mut self, reactor: &mut Reactor<NodeTimer>, conn: ConnectionId) -> bool {
        match self.get_mut(conn) {
            Some(c) => c.destroy(reactor, NodeTimer::Destroy(conn)),
            None => false,
        }
    }
}

// ============================================================================
// NetLink
// ============================================================================

/// The network as seen by the registry, the selector and the relay.
pub struct NetLink<'a> {
    net: &'a mut Network,
    reactor: &'a mut Reactor<NodeTimer>,
    workers: &'a WorkerPool,
}

impl PeerLink for NetLink<'_> {
    fn connect(&mut self, host: &str, port: u16, peer_type: PeerType) -> Option<ConnectionId> {
        let addr = match self.net.hosts.lookup(host, port, self.workers) {
            Lookup::Ready(addr) => addr,
            Lookup::Pending => {
                log::debug!("resolving {} for {}", host, peer_type);
                return None;
            }
            Lookup::Failed(e) => {
                log::warn!("cannot reach {} at {}:{}: {}", peer_type, host, port, e);
                return None;
            }
        };
        match self.net.internal.connect(addr, self.reactor, &mut self.net.ids) {
            Ok(conn) => {
                if let Some(c) = self.net.internal.get_mut(conn) {
                    c.set_peer_type(peer_type);
                }
                Some(conn)
            }
            Err(e) => {
                log::warn!("connect to {} at {} failed: {}", peer_type, addr, e);
                None
            }
        }
    }

    fn is_connected(&self, conn: ConnectionId) -> bool {
        self.net.get(conn).map_or(false, Connection::is_connected)
    }

    fn send(&mut self, conn: ConnectionId, command: Command, body: &[u8]) -> Result<(), NetError> {
        self.net.send_packet(conn, command.code(), body)
    }

    fn rtt(&self, conn: ConnectionId) -> Option<i64> {
        self.net.get(conn).map(Connection::rtt)
    }

    fn ping(&mut self, conn: ConnectionId) -> Result<(), NetError> {
        self.net
            .get_mut(conn)
            .ok_or(NetError::UnknownConnection(conn))?
            .ping()
            .map(|_| ())
    }

    fn set_app_id(&mut self, conn: ConnectionId, app_id: AppId) {
        if let Some(c) = self.net.get_mut(conn) {
            c.set_app_id(app_id);
        }
    }

    fn destroy(&mut self, conn: ConnectionId) {
        self.net.destroy(self.reactor, conn);
    }
}

impl RelayLink for NetLink<'_> {
    fn is_connected(&self, conn: ConnectionId) -> bool {
        PeerLink::is_connected(self, conn)
    }

    fn is_client(&self, conn: ConnectionId) -> bool {
        self.net
            .external
            .as_ref()
            .and_then(|l| l.get(conn))
            .map_or(false, Connection::is_connected)
    }

    fn send_packet(&mut self, conn: ConnectionId, command: u16, payload: &[u8]) -> Result<(), NetError> {
        self.net.send_packet(conn, command, payload)
    }

    fn forward_packet(
        &mut self,
        conn: ConnectionId,
        requestor: ConnectionId,
        command: u16,
        payload: &[u8],
    ) -> Result<(), NetError> {
        self.net
            .get_mut(conn)
            .ok_or(NetError::UnknownConnection(conn))?
            .forward_packet(requestor, command, payload)
    }

    fn destroy(&mut self, conn: ConnectionId) {
        self.net.destroy(self.reactor, conn);
    }
}

// ============================================================================
// Node core and context
// ============================================================================

/// Everything the node owns except the reactor and the role.
pub struct NodeCore {
    config: NodeConfig,
    net: Network,
    registry: PeerRegistry,
    selector: Option<GatewaySelector>,
    workers: WorkerPool,
    state: NodeState,
    timers: Vec<TimerId>,
    signals: Vec<SignalWatch>,
    shutdown_timers: Vec<TimerId>,
    /// Shutdown was requested and the role has not been told yet
    shutdown_notice: bool,
}

/// Handle given to role hooks.
pub struct NodeContext<'a> {
    reactor: &'a mut Reactor<NodeTimer>,
    core: &'a mut NodeCore,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(reactor: &'a mut Reactor<NodeTimer>, core: &'a mut NodeCore) -> Self {
        NodeContext { reactor, core }
    }

    pub fn local(&self) -> &LocalIdentity {
        self.core.registry.local()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.core.config
    }

    pub fn state(&self) -> NodeState {
        self.core.state
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.core.registry
    }

    pub fn registry_mut(&mut self) -> &mut PeerRegistry {
        &mut self.core.registry
    }

    pub fn selector(&self) -> Option<&GatewaySelector> {
        self.core.selector.as_ref()
    }

    pub fn network(&self) -> &Network {
        &self.core.net
    }

    pub fn connection(&self, conn: ConnectionId) -> Option<&Connection> {
        self.core.net.get(conn)
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.core.workers
    }

    /// Registry plus a network handle, for policies that need both.
    pub fn split(&mut self) -> (&mut PeerRegistry, NetLink<'_>) {
        (
            &mut self.core.registry,
            NetLink {
                net: &mut self.core.net,
                reactor: &mut *self.reactor,
                workers: &self.core.workers,
            },
        )
    }

    pub fn send_packet(&mut self, conn: ConnectionId, command: u16, payload: &[u8]) -> Result<(), NetError> {
        self.core.net.send_packet(conn, command, payload)
    }

    pub fn send_message<M: Serialize>(&mut self, conn: ConnectionId, command: Command, msg: &M) -> Result<(), NetError> {
        self.core.net.send_message(conn, command, msg)
    }

    pub fn forward_packet(
        &mut self,
        conn: ConnectionId,
        requestor: ConnectionId,
        command: u16,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let (_, mut link) = self.split();
        link.forward_packet(conn, requestor, command, payload)
    }

    /// Deferred close. `false` if already pending or unknown.
    pub fn destroy(&mut self, conn: ConnectionId) -> bool {
        self.core.net.destroy(self.reactor, conn)
    }

    /// Outbound peer connection on the internal listener.
    pub fn connect(&mut self, host: &str, port: u16, peer_type: PeerType) -> Option<ConnectionId> {
        let (_, mut link) = self.split();
        link.connect(host, port, peer_type)
    }

    pub fn session_count(&self) -> usize {
        self.core.net.session_count()
    }

    /// What this node advertises: exposed addresses, listener ports, live
    /// session count and every known peer as a child.
    pub fn server_info(&self) -> ServerInfo {
        let local = self.core.registry.local();
        let config = &self.core.config;
        ServerInfo {
            app_id: local.app_id,
            group_id: local.group_id,
            peer_type: local.peer_type,
            name: local.name.clone(),
            internal_addr: config.internal_exposed().to_string(),
            internal_port: self.core.net.internal.local_port(),
            external_addr: config.external_exposed().to_string(),
            external_port: self.core.net.external.as_ref().map_or(0, Listener::local_port),
            load: 0.0,
            player_count: 0,
            session_count: self.session_count() as u32,
            children: self.core.registry.snapshot_children(),
        }
    }

    /// Send UpdateServerInfos to `conn` after `role` amends it.
    pub fn update_server_info_to<R: Role + ?Sized>(&mut self, role: &R, conn: ConnectionId) -> Result<(), NetError> {
        let mut info = self.server_info();
        role.on_update_server_info(&mut info);
        self.send_message(conn, Command::UpdateServerInfos, &info)
    }

    /// Begin a graceful shutdown that ends after `after`. Only a running node
    /// can start one.
    pub fn shutdown(&mut self, after: Duration) -> bool {
        if self.core.state != NodeState::Running {
            return false;
        }
        log::info!("shutting down in {:?}", after);

        let tick = Duration::from_millis(self.core.config.shutdown_tick_ms.max(1));
        let ticker = self.reactor.add_repeating_timer(tick, NodeTimer::ShutdownTick);
        let expiry = self.reactor.add_timer(after, NodeTimer::ShutdownExpired);
        self.core.shutdown_timers.extend([ticker, expiry]);
        self.core.state = NodeState::ShutdownWaiting;
        self.core.shutdown_notice = true;
        true
    }
}

// ============================================================================
// Node
// ============================================================================

pub struct Node<R> {
    reactor: Reactor<NodeTimer>,
    core: NodeCore,
    role: R,
}

impl<R: Role> Node<R> {
    /// Bind the listeners, arm the timers, watch the signals and start the
    /// role.
    pub fn new(config: NodeConfig, identity: LocalIdentity, role: R) -> Result<Self, NetError> {
        let identity = resolve_identity(identity, &SystemRandom::new())?;
        export_environment(&identity);

        let mut reactor = Reactor::new()?;

        let mut internal = Listener::bind(
            ListenerKind::Internal,
            &config.internal_host,
            config.internal_port,
            &reactor,
            &config.server_addresses,
            config.max_payload_len,
        )?;
        internal.set_debug_packet(config.debug_packet);

        let external = match &config.external_host {
            Some(host) => {
                let mut listener = Listener::bind(
                    ListenerKind::External,
                    host,
                    config.external_port,
                    &reactor,
                    &[],
                    config.max_payload_len,
                )?;
                listener.set_debug_packet(config.debug_packet);
                Some(listener)
            }
            None => None,
        };

        // Static endpoints are resolved here, before the loop starts
        let mut hosts = HostCache::new();
        for endpoint in config.peers.values() {
            if let Err(e) = hosts.prime(&endpoint.host) {
                log::warn!("{}, will retry from the loop", e);
            }
        }

        let registry = PeerRegistry::new(identity.clone(), config.peer_endpoints());
        let selector = role
            .uses_gateway_selector()
            .then(|| GatewaySelector::new(identity.group_id, config.rtt_tolerance_ms));
        let workers = WorkerPool::new(config.threads)?;

        let mut timers = vec![
            reactor.add_repeating_timer(config.tick_period(), NodeTimer::Tick),
            reactor.add_repeating_timer(config.heartbeat_period(), NodeTimer::Heartbeat),
            reactor.add_repeating_timer(REGISTRY_TICK, NodeTimer::RegistryTick),
        ];
        if selector.is_some() {
            timers.push(reactor.add_repeating_timer(SELECTOR_TICK, NodeTimer::SelectorTick));
        }

        let mut signals = Vec::new();
        for signal in [SIGINT, SIGQUIT, SIGHUP, SIGTERM, SIGPIPE] {
            signals.push(reactor.watch_signal(signal)?);
        }

        log::info!(
            "{} {} (group {}, {}) listening on {}:{}{}",
            identity.peer_type,
            identity.app_id,
            identity.group_id,
            identity.name,
            internal.local_ip(),
            internal.local_port(),
            external
                .as_ref()
                .map(|l| format!(", clients on {}:{}", l.local_ip(), l.local_port()))
                .unwrap_or_default()
        );

        let mut node = Node {
            reactor,
            core: NodeCore {
                net: Network {
                    internal,
                    external,
                    ids: ConnectionIdGenerator::new(config.worker_id),
                    hosts,
                },
                config,
                registry,
                selector,
                workers,
                state: NodeState::Running,
                timers,
                signals,
                shutdown_timers: Vec::new(),
                shutdown_notice: false,
            },
            role,
        };

        let (mut driver, reactor) = node.driver();
        driver.role.on_start(&mut NodeContext::new(reactor, driver.core));
        driver.flush_shutdown_notice(reactor);
        Ok(node)
    }

    fn driver(&mut self) -> (Driver<'_, R>, &mut Reactor<NodeTimer>) {
        (
            Driver {
                core: &mut self.core,
                role: &mut self.role,
            },
            &mut self.reactor,
        )
    }

    /// Dispatch until the node stops. Returns `false` if polling failed.
    pub fn run(&mut self) -> bool {
        let (mut driver, reactor) = self.driver();
        reactor.dispatch(&mut driver)
    }

    /// One reactor iteration waiting at most `timeout`.
    pub fn run_once(&mut self, timeout: Duration) -> Result<(), NetError> {
        let (mut driver, reactor) = self.driver();
        reactor.dispatch_once(&mut driver, Some(timeout))
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }

    pub fn shutdown(&mut self, after: Duration) -> bool {
        let (mut driver, reactor) = self.driver();
        let started = NodeContext::new(reactor, driver.core).shutdown(after);
        driver.flush_shutdown_notice(reactor);
        started
    }

    /// Run `f` with the role and a context, as a hook would.
    pub fn with_context<T>(&mut self, f: impl FnOnce(&mut R, &mut NodeContext<'_>) -> T) -> T {
        let (mut driver, reactor) = self.driver();
        let result = f(&mut *driver.role, &mut NodeContext::new(reactor, driver.core));
        driver.flush_shutdown_notice(reactor);
        result
    }

    pub fn local(&self) -> &LocalIdentity {
        self.core.registry.local()
    }

    pub fn state(&self) -> NodeState {
        self.core.state
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.core.registry
    }

    pub fn selector(&self) -> Option<&GatewaySelector> {
        self.core.selector.as_ref()
    }

    pub fn network(&self) -> &Network {
        &self.core.net
    }

    pub fn internal_port(&self) -> u16 {
        self.core.net.internal.local_port()
    }

    pub fn external_port(&self) -> Option<u16> {
        self.core.net.external.as_ref().map(Listener::local_port)
    }

    pub fn session_count(&self) -> usize {
        self.core.net.session_count()
    }
}

impl<R> Drop for Node<R> {
    fn drop(&mut self) {
        for watch in self.core.signals.drain(..) {
            self.reactor.unwatch_signal(watch);
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Reactor event handler: the node's dispatch logic.
struct Driver<'a, R> {
    core: &'a mut NodeCore,
    role: &'a mut R,
}

impl<R: Role> Driver<'_, R> {
    fn flush_shutdown_notice(&mut self, reactor: &mut Reactor<NodeTimer>) {
        if self.core.shutdown_notice {
            self.core.shutdown_notice = false;
            self.role
                .on_shutdown(&mut NodeContext::new(reactor, self.core), true);
        }
    }

    fn deliver(&mut self, reactor: &mut Reactor<NodeTimer>, events: Vec<RegistryEvent>) {
        for event in events {
            let mut ctx = NodeContext::new(reactor, self.core);
            match event {
                RegistryEvent::PeerJoined(peer) => self.role.on_peer_joined(&mut ctx, &peer),
                RegistryEvent::PeerExited(peer) => self.role.on_peer_exit(&mut ctx, &peer),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    fn accept(&mut self, reactor: &mut Reactor<NodeTimer>, kind: ListenerKind) {
        let net = &mut self.core.net;
        let accepted = match kind {
            ListenerKind::Internal => net.internal.accept_pending(reactor, &mut net.ids),
            ListenerKind::External => match net.external.as_mut() {
                Some(listener) => listener.accept_pending(reactor, &mut net.ids),
                None => return,
            },
        };
        for conn in accepted {
            self.notify_connected(reactor, conn);
        }
    }

    fn notify_connected(&mut self, reactor: &mut Reactor<NodeTimer>, conn: ConnectionId) {
        let info = match self.core.net.get(conn) {
            Some(c) => c.info(),
            None => return,
        };
        self.role
            .on_connected(&mut NodeContext::new(reactor, self.core), &info);
    }

    fn connection_event(&mut self, reactor: &mut Reactor<NodeTimer>, conn: ConnectionId, event: IoEvent) {
        if event.writable {
            let result = match self.core.net.get_mut(conn) {
                Some(c) => c.on_writable(),
                None => return,
            };
            match result {
                Ok(true) => {
                    log::debug!("{} connected", conn);
                    self.notify_connected(reactor, conn);
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!("connection {} failed: {}", conn, e);
                    self.close_connection(reactor, conn);
                    return;
                }
            }
        }

        if event.readable {
            let status = match self.core.net.get_mut(conn) {
                Some(c) => c.on_readable(),
                None => return,
            };
            match status {
                Ok(status) => {
                    self.process_frames(reactor, conn);
                    if status == ReadStatus::Eof {
                        log::debug!("{} closed by peer", conn);
                        self.close_connection(reactor, conn);
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("read on {} failed: {}", conn, e);
                    self.close_connection(reactor, conn);
                    return;
                }
            }
        }

        if event.closed {
            self.close_connection(reactor, conn);
        }
    }

    /// Decode and dispatch every complete frame buffered on `conn`.
    fn process_frames(&mut self, reactor: &mut Reactor<NodeTimer>, conn: ConnectionId) {
        loop {
            let next = match self.core.net.get_mut(conn) {
                None => return,
                Some(c) if c.is_destroyed() => {
                    self.close_connection(reactor, conn);
                    return;
                }
                Some(c) => c.next_frame(),
            };
            match next {
                Ok(Some(frame)) => self.dispatch_frame(reactor, conn, frame),
                Ok(None) => return,
                Err(e) => {
                    log::error!("closing {}: {}", conn, e);
                    self.close_connection(reactor, conn);
                    return;
                }
            }
        }
    }

    /// The single close path.
    fn close_connection(&mut self, reactor: &mut Reactor<NodeTimer>, conn: ConnectionId) {
        let info = match self.core.net.get_mut(conn) {
            Some(c) if c.state() != ConnectionState::Closed => {
                c.mark_disconnected();
                c.info()
            }
            _ => return,
        };
        log::debug!("closing {} ({:?}, {})", conn, info.listener, info.peer_type);

        self.role
            .on_disconnected(&mut NodeContext::new(reactor, self.core), &info);

        if info.is_peer {
            let events = self.core.registry.on_connection_closed(conn);
            self.deliver(reactor, events);
        }

        if let Some(mut c) = self.core.net.remove(conn) {
            c.close(reactor);
        }
    }

    // ------------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------------

    fn dispatch_frame(&mut self, reactor: &mut Reactor<NodeTimer>, conn: ConnectionId, frame: Frame) {
        let Frame { command, payload } = frame;
        let result = match Command::from_code(command) {
            Some(Command::RemoteDisconnected) | None => {
                self.role
                    .on_command(&mut NodeContext::new(reactor, self.core), conn, command, &payload)
            }
            Some(builtin) => self.dispatch_builtin(reactor, conn, builtin, &payload),
        };

        if let Err(e) = result {
            self.on_protocol_error(reactor, conn, command, e);
        }
    }

    fn on_protocol_error(
        &mut self,
        reactor: &mut Reactor<NodeTimer>,
        conn: ConnectionId,
        command: u16,
        error: ProtocolError,
    ) {
        let is_peer = self.core.net.get(conn).map_or(false, Connection::is_peer);
        match error {
            ProtocolError::UnknownCommand(_) => {
                log::warn!("unknown command {} on {}, dropped", command_name(command), conn);
            }
            e if e.closes_client() && !is_peer => {
                log::error!("closing client {}: {}", conn, e);
                self.close_connection(reactor, conn);
            }
            e => log::warn!("{} on {}: {}", command_name(command), conn, e),
        }
    }

    fn dispatch_builtin(
        &mut self,
        reactor: &mut Reactor<NodeTimer>,
        conn: ConnectionId,
        command: Command,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let code = command.code();
        match command {
            Command::Hello => {
                let hello: Hello = decode_body(code, payload)?;
                self.on_hello(reactor, conn, hello)
            }
            Command::HelloAck => {
                let ack: HelloAck = decode_body(code, payload)?;
                self.on_hello_ack(reactor, conn, ack)
            }
            Command::Heartbeat => {
                let _: Heartbeat = decode_body(code, payload)?;
                let ack = Heartbeat {
                    app_id: self.core.registry.local().app_id,
                };
                self.core.net.send_message(conn, Command::HeartbeatAck, &ack)?;
                Ok(())
            }
            Command::HeartbeatAck => {
                let ack: Heartbeat = decode_body(code, payload)?;
                log::trace!("heartbeat ack from {} on {}", ack.app_id, conn);
                Ok(())
            }
            Command::VersionMismatch => {
                let msg: VersionMismatch = decode_body(code, payload)?;
                log::error!(
                    "protocol {} rejected by {} {} (speaks {})",
                    PROTOCOL_VERSION,
                    msg.peer_type,
                    msg.app_id,
                    msg.version
                );
                Ok(())
            }
            Command::UpdateServerInfos => {
                let info: ServerInfo = decode_body(code, payload)?;
                if let Err(e) = self.core.registry.apply_update(&info) {
                    log::debug!("server info from {} ignored: {}", conn, e);
                }
                Ok(())
            }
            Command::QueryServerInfos => {
                let query: QueryServerInfos = decode_body(code, payload)?;
                let ack = self.core.registry.query(&query);
                self.core
                    .net
                    .send_message(conn, Command::QueryServerInfosAck, &ack)?;
                Ok(())
            }
            Command::QueryServerInfosAck => {
                let ack: QueryServerInfosAck = decode_body(code, payload)?;
                self.core.registry.merge_query_results(&ack);
                Ok(())
            }
            Command::Ping => {
                let ping: Ping = decode_body(code, payload)?;
                self.core.net.send_message(conn, Command::Pong, &ping)?;
                Ok(())
            }
            Command::Pong => {
                let pong: Ping = decode_body(code, payload)?;
                if let Some(c) = self.core.net.get_mut(conn) {
                    c.on_pong(pong.time);
                }
                Ok(())
            }
            Command::ForwardPacket => {
                let envelope: ForwardEnvelope = decode_body(code, payload)?;
                self.role
                    .on_forward(&mut NodeContext::new(reactor, self.core), conn, envelope)
            }
            Command::RemoteDisconnected => self
                .role
                .on_command(&mut NodeContext::new(reactor, self.core), conn, code, payload),
        }
    }

    fn on_hello(&mut self, reactor: &mut Reactor<NodeTimer>, conn: ConnectionId, hello: Hello) -> Result<(), ProtocolError> {
        let local = self.core.registry.local().clone();
        let c = self
            .core
            .net
            .get_mut(conn)
            .ok_or(NetError::UnknownConnection(conn))?;

        if hello.version != PROTOCOL_VERSION {
            log::error!(
                "{} {} on {} speaks protocol {}, expected {}",
                hello.peer_type,
                hello.app_id,
                conn,
                hello.version,
                PROTOCOL_VERSION
            );
            let mismatch = VersionMismatch {
                app_id: local.app_id,
                peer_type: local.peer_type,
                version: PROTOCOL_VERSION,
            };
            c.send_message(Command::VersionMismatch, &mismatch)?;
            c.send_message(Command::HelloAck, &local.hello())?;
            self.close_connection(reactor, conn);
            return Ok(());
        }

        c.send_message(Command::HelloAck, &local.hello())?;

        // Clients are recorded as clients whatever they declare
        let peer_type = if c.is_peer() { hello.peer_type } else { PeerType::Client };
        c.set_identity(hello.app_id, peer_type, hello.group_id);

        if c.is_peer() {
            let (ip, port) = (c.ip(), c.port());
            let events = self.core.registry.on_hello(conn, &hello, &ip, port);
            self.deliver(reactor, events);
        }
        Ok(())
    }

    fn on_hello_ack(&mut self, reactor: &mut Reactor<NodeTimer>, conn: ConnectionId, ack: HelloAck) -> Result<(), ProtocolError> {
        let c = self
            .core
            .net
            .get_mut(conn)
            .ok_or(NetError::UnknownConnection(conn))?;
        c.set_identity(ack.app_id, ack.peer_type, ack.group_id);

        if c.is_peer() {
            let events = self.core.registry.on_hello_ack(conn, &ack);
            self.deliver(reactor, events);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn on_heartbeat_tick(&mut self, reactor: &mut Reactor<NodeTimer>) {
        let heartbeat_ms = self.core.config.heartbeat_period().as_millis() as u64;
        let net = &mut self.core.net;
        net.internal
            .check_sessions(reactor, heartbeat_ms, NodeTimer::Destroy);
        if let Some(external) = net.external.as_mut() {
            external.check_sessions(reactor, heartbeat_ms, NodeTimer::Destroy);
        }

        let NodeCore {
            net,
            registry,
            workers,
            ..
        } = &mut *self.core;
        registry.on_heartbeat(&mut NetLink {
            net,
            reactor,
            workers: &*workers,
        });
    }

    fn on_registry_tick(&mut self, reactor: &mut Reactor<NodeTimer>) {
        let NodeCore {
            net,
            registry,
            workers,
            ..
        } = &mut *self.core;
        let events = registry.on_tick(&mut NetLink {
            net,
            reactor: &mut *reactor,
            workers: &*workers,
        });
        self.deliver(reactor, events);
    }

    fn on_selector_tick(&mut self, reactor: &mut Reactor<NodeTimer>) {
        let NodeCore {
            net,
            registry,
            selector,
            workers,
            ..
        } = &mut *self.core;
        if let Some(selector) = selector.as_mut() {
            selector.on_tick(
                registry,
                &mut NetLink {
                    net,
                    reactor,
                    workers: &*workers,
                },
            );
        }
    }

    /// End of the shutdown grace period.
    fn finish(&mut self, reactor: &mut Reactor<NodeTimer>) {
        log::info!("shutdown complete");
        self.core.state = NodeState::ShutdownOver;

        let NodeCore {
            timers,
            shutdown_timers,
            signals,
            ..
        } = &mut *self.core;
        for timer in timers.drain(..).chain(shutdown_timers.drain(..)) {
            reactor.cancel_timer(timer);
        }
        for watch in signals.drain(..) {
            reactor.unwatch_signal(watch);
        }

        for conn in self.core.net.all_ids() {
            self.close_connection(reactor, conn);
        }
        self.core.workers.shutdown();
        reactor.interrupt_now();
    }
}

impl<R: Role> EventHandler<NodeTimer> for Driver<'_, R> {
    fn on_io(&mut self, reactor: &mut Reactor<NodeTimer>, event: IoEvent) {
        let token = event.token;
        if token == self.core.net.internal.token() {
            self.accept(reactor, ListenerKind::Internal);
        } else if self.core.net.external.as_ref().map(Listener::token) == Some(token) {
            self.accept(reactor, ListenerKind::External);
        } else if let Some(conn) = self.core.net.by_token(token) {
            self.connection_event(reactor, conn, event);
        }
        self.flush_shutdown_notice(reactor);
    }

    fn on_timer(&mut self, reactor: &mut Reactor<NodeTimer>, _id: TimerId, payload: NodeTimer) {
        match payload {
            NodeTimer::Tick => self.role.on_tick(&mut NodeContext::new(reactor, self.core)),
            NodeTimer::Heartbeat => self.on_heartbeat_tick(reactor),
            NodeTimer::RegistryTick => self.on_registry_tick(reactor),
            NodeTimer::SelectorTick => self.on_selector_tick(reactor),
            NodeTimer::ShutdownTick => self
                .role
                .on_shutdown(&mut NodeContext::new(reactor, self.core), false),
            NodeTimer::ShutdownExpired => self.finish(reactor),
            NodeTimer::Destroy(conn) => {
                if self.core.net.get(conn).map_or(false, Connection::is_destroyed) {
                    self.close_connection(reactor, conn);
                }
            }
        }
        self.flush_shutdown_notice(reactor);
    }

    fn on_signal(&mut self, reactor: &mut Reactor<NodeTimer>, signal: i32) {
        match signal_grace(&self.core.config, signal) {
            Some(grace) => {
                log::info!("caught signal {}, exiting cleanly in {:?}", signal, grace);
                NodeContext::new(reactor, self.core).shutdown(grace);
            }
            None => log::debug!("ignoring signal {}", signal),
        }
        self.flush_shutdown_notice(reactor);
    }
}

// ============================================================================
// Tests
// ============================================================================
