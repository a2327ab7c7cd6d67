//! Accepting listener and the live connection set it owns
//!
//! Each node has an internal listener (peer processes, guarded by an address
//! allow-list) and optionally an external one (game clients). Connections are
//! keyed by [`ConnectionId`] and leave the set only on the close path.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use mio::net::TcpListener;
use mio::{Interest, Token};

use crate::connection::Connection;
use crate::error::NetError;
use crate::ids::{ConnectionId, ConnectionIdGenerator};
use crate::reactor::Reactor;
use crate::socket::Socket;
use crate::worker::{JobHandle, WorkerPool};

// ============================================================================
// Listener Kind
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Server-to-server port, allow-listed
    Internal,
    /// Client port
    External,
}

// ============================================================================
// Address Patterns
// ============================================================================

/// Allow-list entry: an exact dotted-quad, or a prefix ending in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPattern {
    Exact(String),
    Prefix(String),
}

impl AddressPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => AddressPattern::Prefix(prefix.to_string()),
            None => AddressPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, ip: &str) -> bool {
        match self {
            AddressPattern::Exact(addr) => addr == ip,
            AddressPattern::Prefix(prefix) => ip.starts_with(prefix.as_str()),
        }
    }
}

// ============================================================================
// Address Resolution
// ============================================================================

/// Address of an IP literal or a loopback alias, without a lookup. `0.0.0.0`
/// means the local host when used as a connect target.
pub fn resolve_literal(host: &str, port: u16) -> Option<SocketAddr> {
    match host {
        "localhost" | "0.0.0.0" => Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
        _ => host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port)),
    }
}

/// Resolve `host:port`, preferring IPv4. Blocks on the system resolver for
/// anything that is not a literal, so never call it on the loop thread.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    if let Some(addr) = resolve_literal(host, port) {
        return Ok(addr);
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::Resolve(format!("{}:{}", host, port)))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NetError::Resolve(format!("{}:{}", host, port)))
}

fn resolve_bind(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    resolve(host, port)
}

/// Outcome of a [`HostCache::lookup`].
#[derive(Debug)]
pub enum Lookup {
    Ready(SocketAddr),
    /// A worker is resolving the name, ask again later
    Pending,
    Failed(NetError),
}

/// Host names resolved once and remembered. Lookups from the loop thread
/// never block: unknown names go to the worker pool.
#[derive(Default)]
pub struct HostCache {
    resolved: HashMap<String, IpAddr>,
    pending: HashMap<String, JobHandle<Option<IpAddr>>>,
}

impl HostCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocking resolution for setup code that runs before the loop.
    pub fn prime(&mut self, host: &str) -> Result<(), NetError> {
        if resolve_literal(host, 0).is_some() || self.resolved.contains_key(host) {
            return Ok(());
        }
        let addr = resolve(host, 0)?;
        self.resolved.insert(host.to_string(), addr.ip());
        Ok(())
    }

    pub fn is_cached(&self, host: &str) -> bool {
        self.resolved.contains_key(host)
    }

    pub fn lookup(&mut self, host: &str, port: u16, workers: &WorkerPool) -> Lookup {
        if let Some(addr) = resolve_literal(host, port) {
            return Lookup::Ready(addr);
        }
        if let Some(ip) = self.resolved.get(host) {
            return Lookup::Ready(SocketAddr::new(*ip, port));
        }

        if let Some(job) = self.pending.get_mut(host) {
            let failed = match job.try_take() {
                Some(Some(ip)) => {
                    self.pending.remove(host);
                    self.resolved.insert(host.to_string(), ip);
                    log::debug!("resolved {} to {}", host, ip);
                    return Lookup::Ready(SocketAddr::new(ip, port));
                }
                Some(None) => true,
                None => job.is_lost(),
            };
            if !failed {
                return Lookup::Pending;
            }
            self.pending.remove(host);
            return Lookup::Failed(NetError::Resolve(format!("{}:{}", host, port)));
        }

        let name = host.to_string();
        match workers.submit(move || resolve(&name, 0).ok().map(|addr| addr.ip())) {
            Ok(job) => {
                self.pending.insert(host.to_string(), job);
                Lookup::Pending
            }
            Err(e) => {
                log::warn!("cannot queue lookup of {}: {}", host, e);
                Lookup::Failed(NetError::Resolve(format!("{}:{}", host, port)))
            }
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

pub struct Listener {
    kind: ListenerKind,
    listener: TcpListener,
    token: Token,
    local_addr: SocketAddr,
    connections: HashMap<ConnectionId, Connection>,
    tokens: HashMap<Token, ConnectionId>,
    allow_list: Vec<AddressPattern>,
    max_payload: usize,
    debug_packet: bool,
}

impl Listener {
    /// Bind and start accepting.
    pub fn bind<T: Clone>(
        kind: ListenerKind,
        host: &str,
        port: u16,
        reactor: &Reactor<T>,
        allow_list: &[String],
        max_payload: usize,
    ) -> Result<Self, NetError> {
        let addr = resolve_bind(host, port)?;
        let mut listener = TcpListener::bind(addr).map_err(|source| NetError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| NetError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let token = reactor.next_token();
        reactor
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .map_err(|source| NetError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        log::info!("{:?} listener on {}", kind, local_addr);

        Ok(Listener {
            kind,
            listener,
            token,
            local_addr,
            connections: HashMap::new(),
            tokens: HashMap::new(),
            allow_list: allow_list.iter().map(|p| AddressPattern::parse(p)).collect(),
            max_payload,
            debug_packet: false,
        })
    }

    pub fn set_debug_packet(&mut self, on: bool) {
        self.debug_packet = on;
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Bound IP; the unspecified address is reported as `localhost`.
    pub fn local_ip(&self) -> String {
        if self.local_addr.ip().is_unspecified() {
            "localhost".to_string()
        } else {
            self.local_addr.ip().to_string()
        }
    }

    pub fn is_allowed(&self, ip: &str) -> bool {
        self.allow_list.iter().any(|p| p.matches(ip))
    }

    /// Accept every pending connection. Returns the ids that survived
    /// initialization and the allow-list check.
    pub fn accept_pending<T: Clone>(
        &mut self,
        reactor: &mut Reactor<T>,
        ids: &mut ConnectionIdGenerator,
    ) -> Vec<ConnectionId> {
        let mut accepted = Vec::new();
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("{:?} accept failed: {}", self.kind, e);
                    break;
                }
            };

            let id = ids.next_id();
            let token = reactor.next_token();
            let mut conn = Connection::accepted(
                id,
                token,
                self.kind,
                Socket::new(stream),
                self.max_payload,
            );
            conn.set_debug_packet(self.debug_packet);
            self.insert(conn);

            let ip = addr.ip().to_string();
            let allowed = self.kind == ListenerKind::External || self.is_allowed(&ip);
            let init = match self.connections.get_mut(&id) {
                Some(conn) => conn.initialize(reactor.registry()),
                None => continue,
            };

            match (allowed, init) {
                (true, Ok(())) => {
                    log::debug!("{:?} accepted {} from {}", self.kind, id, addr);
                    accepted.push(id);
                }
                (false, _) => {
                    log::warn!("{:?} rejected {}: address not in allow list", self.kind, addr);
                    self.discard(reactor, id);
                }
                (true, Err(e)) => {
                    log::error!("{:?} failed to initialize {}: {}", self.kind, addr, e);
                    self.discard(reactor, id);
                }
            }
        }
        accepted
    }

    /// Start an outbound peer connection owned by this listener's set.
    pub fn connect<T: Clone>(
        &mut self,
        addr: SocketAddr,
        reactor: &mut Reactor<T>,
        ids: &mut ConnectionIdGenerator,
    ) -> Result<ConnectionId, NetError> {
        let id = ids.next_id();
        let mut conn = Connection::outbound(id, reactor.next_token(), addr, self.max_payload)?;
        conn.set_debug_packet(self.debug_packet);
        conn.initialize(reactor.registry())?;
        self.insert(conn);
        log::debug!("connecting {} to {}", id, addr);
        Ok(id)
    }

    fn insert(&mut self, conn: Connection) {
        self.tokens.insert(conn.token(), conn.id());
        self.connections.insert(conn.id(), conn);
    }

    fn discard<T: Clone>(&mut self, reactor: &mut Reactor<T>, id: ConnectionId) {
        if let Some(mut conn) = self.remove(id) {
            conn.close(reactor);
        }
    }

    // ------------------------------------------------------------------------
    // Connection set
    // ------------------------------------------------------------------------

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn by_token(&self, token: Token) -> Option<ConnectionId> {
        self.tokens.get(&token).copied()
    }

    /// Take a connection out of the set. Only the close path calls this.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        self.tokens.remove(&conn.token());
        Some(conn)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Arm the deferred close of every connection that has gone quiet.
    /// Returns how many were newly destroyed.
    pub fn check_sessions<T: Clone>(
        &mut self,
        reactor: &mut Reactor<T>,
        heartbeat_interval_ms: u64,
        destroy_payload: impl Fn(ConnectionId) -> T,
    ) -> usize {
        let timed_out: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.is_timeout(heartbeat_interval_ms))
            .map(|c| c.id())
            .collect();

        let mut destroyed = 0;
        for id in timed_out {
            if let Some(conn) = self.connections.get_mut(&id) {
                log::info!("{:?} connection {} timed out ({})", self.kind, id, conn.ip());
                if conn.destroy(reactor, destroy_payload(id)) {
                    destroyed += 1;
                }
            }
        }
        destroyed
    }
}

// ============================================================================
// Tests
// ============================================================================
