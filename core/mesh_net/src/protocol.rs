//! Mesh wire protocol
//!
//! Every frame on a mesh connection carries a fixed 4-byte header followed by
//! a bincode-encoded body:
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────────────────┐
//! │ Length (2B)  │ Command (2B)  │ Payload (Length bytes)       │
//! │ big-endian   │ big-endian    │                              │
//! └──────────────┴───────────────┴──────────────────────────────┘
//! ```
//!
//! Commands 1-999 are built into the transport. Role commands live in
//! contiguous ranges so a gateway can route them without understanding them.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, ProtocolError};
use crate::ids::{AppId, ConnectionId, GroupId};
use crate::socket::ByteBuffer;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version exchanged in Hello
pub const PROTOCOL_VERSION: u32 = 100;

/// Length of the frame header
pub const HEADER_LEN: usize = 4;

/// Largest payload a frame can carry
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Reserved for built-in transport commands ([`Command`]). Role ranges
/// below never overlap it.
pub const BUILTIN_RANGE: RangeInclusive<u16> = 1..=99;

/// Directory role commands
pub const DIRECTORY_RANGE: RangeInclusive<u16> = 100..=199;

/// Login role commands
pub const LOGIN_RANGE: RangeInclusive<u16> = 1000..=1999;

/// Lobby role commands
pub const LOBBY_RANGE: RangeInclusive<u16> = 2000..=2999;

/// Client enters a lobby. The body may start with the lobby's app id
pub const LOBBY_ENTER: u16 = 2000;

/// Client asks the directory for usable gateways
pub const DIRECTORY_LIST_SERVERS: u16 = 101;

/// Directory reply to `DIRECTORY_LIST_SERVERS`
pub const DIRECTORY_LIST_SERVERS_ACK: u16 = 102;

// ============================================================================
// Peer Types
// ============================================================================

/// Role of a mesh process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum PeerType {
    #[default]
    Unknown,
    Gateway,
    Lobby,
    LobbyManager,
    Login,
    Room,
    RoomManager,
    DatabaseProxy,
    Machine,
    Directory,
    TestBot,
    Client,
}

impl PeerType {
    pub const ALL: [PeerType; 12] = [
        PeerType::Unknown,
        PeerType::Gateway,
        PeerType::Lobby,
        PeerType::LobbyManager,
        PeerType::Login,
        PeerType::Room,
        PeerType::RoomManager,
        PeerType::DatabaseProxy,
        PeerType::Machine,
        PeerType::Directory,
        PeerType::TestBot,
        PeerType::Client,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PeerType::Unknown => "unknown",
            PeerType::Gateway => "gateway",
            PeerType::Lobby => "lobby",
            PeerType::LobbyManager => "lobby-manager",
            PeerType::Login => "login",
            PeerType::Room => "room",
            PeerType::RoomManager => "room-manager",
            PeerType::DatabaseProxy => "database-proxy",
            PeerType::Machine => "machine",
            PeerType::Directory => "directory",
            PeerType::TestBot => "test-bot",
            PeerType::Client => "client",
        }
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PeerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerType::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| format!("unknown peer type '{}'", s))
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Built-in command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Hello = 1,
    HelloAck = 2,
    Heartbeat = 3,
    HeartbeatAck = 4,
    VersionMismatch = 5,
    UpdateServerInfos = 6,
    QueryServerInfos = 7,
    QueryServerInfosAck = 8,
    Ping = 9,
    Pong = 10,
    ForwardPacket = 11,
    RemoteDisconnected = 12,
}

impl Command {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Command::Hello,
            2 => Command::HelloAck,
            3 => Command::Heartbeat,
            4 => Command::HeartbeatAck,
            5 => Command::VersionMismatch,
            6 => Command::UpdateServerInfos,
            7 => Command::QueryServerInfos,
            8 => Command::QueryServerInfosAck,
            9 => Command::Ping,
            10 => Command::Pong,
            11 => Command::ForwardPacket,
            12 => Command::RemoteDisconnected,
            _ => return None,
        })
    }
}

/// Name used in packet debug logs.
pub fn command_name(code: u16) -> String {
    match Command::from_code(code) {
        Some(cmd) => format!("{:?}", cmd),
        None => format!("cmd#{}", code),
    }
}

// ============================================================================
// Wire Header
// ============================================================================

/// The 4-byte frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Payload length in bytes (header excluded)
    pub length: u16,
    /// Command id
    pub command: u16,
}

impl WireHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.length.to_be_bytes();
        let cmd = self.command.to_be_bytes();
        [len[0], len[1], cmd[0], cmd[1]]
    }

    /// Decode from the first four bytes of `buf`, `None` if fewer are present.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(WireHeader {
            length: u16::from_be_bytes([buf[0], buf[1]]),
            command: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }
}

/// Build a complete frame. Fails when `payload` is longer than `max`.
pub fn encode_frame(command: u16, payload: &[u8], max: usize) -> Result<Vec<u8>, NetError> {
    let max = max.min(MAX_PAYLOAD_LEN);
    if payload.len() > max {
        return Err(NetError::PayloadTooLarge {
            len: payload.len(),
            max,
        });
    }

    let header = WireHeader {
        length: payload.len() as u16,
        command,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    Ok(frame)
}

// ============================================================================
// Frame Decoder
// ============================================================================

/// One fully received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u16,
    pub payload: Vec<u8>,
}

/// Incremental decoder. A header that arrived without its full body stays
/// pending across reads.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Option<WireHeader>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            pending: None,
            max_payload: max_payload.min(MAX_PAYLOAD_LEN),
        }
    }

    pub fn has_pending_header(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the next complete frame out of `input`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversize header is
    /// rejected without consuming anything from `input`.
    pub fn next_frame(&mut self, input: &mut ByteBuffer) -> Result<Option<Frame>, ProtocolError> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                let header = match input.peek(HEADER_LEN).and_then(WireHeader::decode) {
                    Some(h) => h,
                    None => return Ok(None),
                };
                if usize::from(header.length) > self.max_payload {
                    return Err(ProtocolError::Oversize {
                        length: usize::from(header.length),
                        max: self.max_payload,
                        command: header.command,
                    });
                }
                input.drain(HEADER_LEN);
                self.pending = Some(header);
                header
            }
        };

        let payload = match input.read(usize::from(header.length)) {
            Some(p) => p,
            None => return Ok(None),
        };
        self.pending = None;

        Ok(Some(Frame {
            command: header.command,
            payload,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LEN)
    }
}

// ============================================================================
// Message Bodies
// ============================================================================

/// Identity handshake, sent by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub app_id: AppId,
    pub peer_type: PeerType,
    pub group_id: GroupId,
    pub name: String,
}

/// Reply to `Hello`, same shape.
pub type HelloAck = Hello;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub app_id: AppId,
}

pub type HeartbeatAck = Heartbeat;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMismatch {
    pub app_id: AppId,
    pub peer_type: PeerType,
    pub version: u32,
}

/// Registry snapshot entry. `children` carries the sender's own view of
/// further peers for one-hop gossip.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub app_id: AppId,
    pub group_id: GroupId,
    pub peer_type: PeerType,
    pub name: String,
    pub internal_addr: String,
    pub internal_port: u16,
    pub external_addr: String,
    pub external_port: u16,
    pub load: f32,
    pub player_count: u32,
    pub session_count: u32,
    pub children: Vec<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryServerInfos {
    /// Exact id, 0 for any
    pub app_id: AppId,
    /// Only peers of this group when > 0
    pub group_id: GroupId,
    pub peer_type: PeerType,
    /// Result cap, 0 for unlimited
    pub max_count: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryServerInfosAck {
    pub servers: Vec<ServerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Sender clock in milliseconds
    pub time: i64,
}

pub type Pong = Ping;

/// Bytes an envelope adds around its payload: requestor, command and the
/// payload length prefix.
pub const ENVELOPE_OVERHEAD: usize = 8 + 2 + 8;

/// Tunneling envelope: an opaque client command relayed through a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    /// Client connection on the gateway this traffic belongs to
    pub requestor: ConnectionId,
    /// Inner command id
    pub command: u16,
    /// Inner payload, never interpreted by the gateway
    pub payload: Vec<u8>,
}

/// Encode a message body.
pub fn encode_body<M: Serialize>(msg: &M) -> Result<Vec<u8>, NetError> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a message body received under `command`.
pub fn decode_body<M: DeserializeOwned>(command: u16, payload: &[u8]) -> Result<M, ProtocolError> {
    bincode::deserialize(payload).map_err(|source| ProtocolError::Malformed { command, source })
}

// ============================================================================
// Tests
// ============================================================================
