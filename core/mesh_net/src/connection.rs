//! One TCP endpoint's protocol state
//!
//! A `Connection` owns its [`Socket`] and frame decoder, and tracks liveness,
//! identity and RTT. Dispatching decoded frames is the node's job; this type
//! only knows how to move bytes and when it has gone quiet.
//!
//! ```text
//! Connecting ──► Connected ──► Disconnecting ──► Closed
//!      │                            ▲
//!      └─────── connect error ──────┘
//! ```

use std::io;
use std::net::SocketAddr;

use mio::{Registry, Token};
use serde::Serialize;

use crate::error::{NetError, ProtocolError};
use crate::ids::{now_ms, AppId, ConnectionId, GroupId};
use crate::listener::ListenerKind;
use crate::protocol::{
    command_name, encode_body, encode_frame, Command, ForwardEnvelope, Frame, FrameDecoder, PeerType,
    Ping,
};
use crate::reactor::{Reactor, TimerId};
use crate::socket::{ReadStatus, Socket};

// ============================================================================
// Constants
// ============================================================================

/// Delay between `destroy()` and the actual close
pub const DESTROY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// RTT value before the first Pong
pub const RTT_UNMEASURED: i64 = -1;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

/// Snapshot of a connection for hooks that run after it left the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub listener: ListenerKind,
    pub is_peer: bool,
    pub app_id: AppId,
    pub peer_type: PeerType,
    pub group_id: GroupId,
}

pub struct Connection {
    id: ConnectionId,
    token: Token,
    listener: ListenerKind,
    socket: Socket,
    state: ConnectionState,
    decoder: FrameDecoder,
    max_payload: usize,

    /// Last time a complete frame arrived (ms)
    last_received_ms: i64,
    /// Server-to-server link (true) or client link (false)
    is_peer: bool,

    app_id: AppId,
    peer_type: PeerType,
    group_id: GroupId,

    rtt_ms: i64,
    destroy_timer: Option<TimerId>,
    debug_packet: bool,
}

impl Connection {
    /// Wrap an accepted stream. It is connected already.
    pub fn accepted(
        id: ConnectionId,
        token: Token,
        listener: ListenerKind,
        socket: Socket,
        max_payload: usize,
    ) -> Self {
        Self::build(
            id,
            token,
            listener,
            socket,
            ConnectionState::Connected,
            listener == ListenerKind::Internal,
            max_payload,
        )
    }

    /// Start an outbound peer connection.
    pub fn outbound(
        id: ConnectionId,
        token: Token,
        addr: SocketAddr,
        max_payload: usize,
    ) -> Result<Self, NetError> {
        let socket = Socket::connect(addr).map_err(|source| NetError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self::build(
            id,
            token,
            ListenerKind::Internal,
            socket,
            ConnectionState::Connecting,
            true,
            max_payload,
        ))
    }

    fn build(
        id: ConnectionId,
        token: Token,
        listener: ListenerKind,
        socket: Socket,
        state: ConnectionState,
        is_peer: bool,
        max_payload: usize,
    ) -> Self {
        Connection {
            id,
            token,
            listener,
            socket,
            state,
            decoder: FrameDecoder::new(max_payload),
            max_payload,
            last_received_ms: now_ms(),
            is_peer,
            app_id: 0,
            peer_type: PeerType::Unknown,
            group_id: 0,
            rtt_ms: RTT_UNMEASURED,
            destroy_timer: None,
            debug_packet: false,
        }
    }

    /// Register for read and write readiness and reset liveness.
    pub fn initialize(&mut self, registry: &Registry) -> Result<(), NetError> {
        self.socket
            .register(registry, self.token)
            .map_err(NetError::Socket)?;
        self.last_received_ms = now_ms();
        self.rtt_ms = RTT_UNMEASURED;
        Ok(())
    }

    pub fn set_debug_packet(&mut self, on: bool) {
        self.debug_packet = on;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn listener(&self) -> ListenerKind {
        self.listener
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// A deferred close is pending.
    pub fn is_destroyed(&self) -> bool {
        self.destroy_timer.is_some()
    }

    pub fn is_peer(&self) -> bool {
        self.is_peer
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn set_app_id(&mut self, app_id: AppId) {
        self.app_id = app_id;
    }

    pub fn set_identity(&mut self, app_id: AppId, peer_type: PeerType, group_id: GroupId) {
        self.app_id = app_id;
        self.peer_type = peer_type;
        self.group_id = group_id;
    }

    pub fn set_peer_type(&mut self, peer_type: PeerType) {
        self.peer_type = peer_type;
    }

    /// Milliseconds, or [`RTT_UNMEASURED`].
    pub fn rtt(&self) -> i64 {
        self.rtt_ms
    }

    pub fn last_received_ms(&self) -> i64 {
        self.last_received_ms
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    /// Peer IP as text, empty when unknown.
    pub fn ip(&self) -> String {
        self.socket.peer_ip().map(|ip| ip.to_string()).unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.socket.peer_port().unwrap_or(0)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            listener: self.listener,
            is_peer: self.is_peer,
            app_id: self.app_id,
            peer_type: self.peer_type,
            group_id: self.group_id,
        }
    }

    // ------------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------------

    /// Handle writability. Returns `Ok(true)` when this completes an
    /// outbound connect.
    pub fn on_writable(&mut self) -> Result<bool, NetError> {
        let mut became_connected = false;
        if self.state == ConnectionState::Connecting {
            if let Some(e) = self.socket.take_error().map_err(NetError::Socket)? {
                return Err(NetError::Socket(e));
            }
            match self.socket.peer_addr() {
                Ok(_) => {
                    self.state = ConnectionState::Connected;
                    self.last_received_ms = now_ms();
                    became_connected = true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(false),
                Err(e) => return Err(NetError::Socket(e)),
            }
        }
        self.socket.flush()?;
        Ok(became_connected)
    }

    /// Pull everything readable into the input buffer.
    pub fn on_readable(&mut self) -> io::Result<ReadStatus> {
        self.socket.fill()
    }

    /// Next complete frame, updating liveness when one is produced.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let frame = self.decoder.next_frame(self.socket.input())?;
        if let Some(frame) = &frame {
            self.last_received_ms = now_ms();
            if self.debug_packet {
                log::debug!(
                    "recv {} ({} bytes) from {} [{}]",
                    command_name(frame.command),
                    frame.payload.len(),
                    self.socket.addr_string(),
                    self.id
                );
            }
        }
        Ok(frame)
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Frame and send a raw payload. Bytes are queued while connecting.
    pub fn send_packet(&mut self, command: u16, payload: &[u8]) -> Result<(), NetError> {
        if self.state == ConnectionState::Closed {
            return Err(NetError::Closed(self.id));
        }
        let frame = encode_frame(command, payload, self.max_payload)?;

        if self.debug_packet {
            log::debug!(
                "send {} ({} bytes) to {} [{}]",
                command_name(command),
                payload.len(),
                self.socket.addr_string(),
                self.id
            );
        }

        if self.state == ConnectionState::Connecting {
            self.socket.queue(&frame);
            return Ok(());
        }
        self.socket.write(&frame)?;
        Ok(())
    }

    pub fn send_message<M: Serialize>(&mut self, command: Command, msg: &M) -> Result<(), NetError> {
        let body = encode_body(msg)?;
        self.send_packet(command.code(), &body)
    }

    /// Wrap `payload` in a tunneling envelope for `requestor`.
    pub fn forward_packet(
        &mut self,
        requestor: ConnectionId,
        command: u16,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let envelope = ForwardEnvelope {
            requestor,
            command,
            payload: payload.to_vec(),
        };
        self.send_message(Command::ForwardPacket, &envelope)
    }

    /// Send a Ping stamped with the current time. Returns the stamp.
    pub fn ping(&mut self) -> Result<i64, NetError> {
        let time = now_ms();
        self.send_message(Command::Ping, &Ping { time })?;
        Ok(time)
    }

    pub fn on_pong(&mut self, time: i64) {
        self.rtt_ms = now_ms() - time;
    }

    // ------------------------------------------------------------------------
    // Liveness and teardown
    // ------------------------------------------------------------------------

    /// Silent for longer than twice the heartbeat interval.
    pub fn is_timeout(&self, heartbeat_interval_ms: u64) -> bool {
        self.is_timeout_at(now_ms(), heartbeat_interval_ms)
    }

    pub fn is_timeout_at(&self, now: i64, heartbeat_interval_ms: u64) -> bool {
        let limit = (heartbeat_interval_ms as i64).saturating_mul(2);
        limit > 0 && limit < now - self.last_received_ms
    }

    /// Arm the deferred close. A second call while armed does nothing and
    /// returns `false`.
    pub fn destroy<T: Clone>(&mut self, reactor: &mut Reactor<T>, payload: T) -> bool {
        if self.destroy_timer.is_some() || self.state == ConnectionState::Closed {
            return false;
        }
        self.destroy_timer = Some(reactor.add_timer(DESTROY_DELAY, payload));
        true
    }

    pub fn destroy_timer(&self) -> Option<TimerId> {
        self.destroy_timer
    }

    /// First step of the close path.
    pub fn mark_disconnected(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Disconnecting;
        }
    }

    /// Free the socket. Cancels a pending deferred close.
    pub fn close<T: Clone>(&mut self, reactor: &mut Reactor<T>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(timer) = self.destroy_timer.take() {
            reactor.cancel_timer(timer);
        }
        self.socket.deregister(reactor.registry());
        self.socket.shutdown();
        self.state = ConnectionState::Closed;
    }

    /// Test hook: pretend the last frame arrived at `ms`.
    #[cfg(test)]
    pub(crate) fn set_last_received_ms(&mut self, ms: i64) {
        self.last_received_ms = ms;
    }
}

// ============================================================================
// Tests
// ============================================================================
