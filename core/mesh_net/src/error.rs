//! Error types for the mesh transport
//!
//! Errors are split by concern. None of them is fatal to the process: callers
//! log them and either drop a frame, close one connection, or retry on the
//! next tick.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::ids::{AppId, ConnectionId};

/// Socket, reactor and send-path failures.
#[derive(Debug, Error)]
pub enum NetError {
    /// The poll instance or another loop primitive could not be created
    #[error("reactor initialization failed: {0}")]
    Init(#[source] io::Error),

    /// A socket could not be registered or configured
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),

    /// A listener could not bind its address
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// An outbound connection could not be started
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A host name did not resolve to any address
    #[error("cannot resolve address {0}")]
    Resolve(String),

    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("failed to encode message body: {0}")]
    Encode(#[from] bincode::Error),

    #[error("connection {0} not found")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Violations of the wire protocol detected while decoding or dispatching.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Header length above the decoder limit; the connection is closed
    #[error("frame length {length} exceeds maximum of {max} (command {command})")]
    Oversize {
        length: usize,
        max: usize,
        command: u16,
    },

    /// No handler claims the command; the frame is dropped
    #[error("unknown command {0}")]
    UnknownCommand(u16),

    /// Body did not decode for its command
    #[error("malformed body for command {command}: {source}")]
    Malformed {
        command: u16,
        #[source]
        source: bincode::Error,
    },

    /// A client command targets a role with no connected backend
    #[error("no backend available for command {command}")]
    NoBackend { command: u16 },

    /// A client payload too large to fit a frame once wrapped in an envelope
    #[error("payload of {len} bytes for command {command} cannot be relayed")]
    EnvelopeTooLarge { command: u16, len: usize },

    #[error(transparent)]
    Net(#[from] NetError),
}

impl ProtocolError {
    /// Whether this error should terminate a client connection.
    ///
    /// Peer connections only ever drop the offending frame, except for an
    /// oversize header which always closes.
    pub fn closes_client(&self) -> bool {
        matches!(
            self,
            ProtocolError::Oversize { .. }
                | ProtocolError::Malformed { .. }
                | ProtocolError::NoBackend { .. }
                | ProtocolError::EnvelopeTooLarge { .. }
        )
    }
}

/// Peer registry bookkeeping failures. Logged and treated as transient.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("peer {0} is already registered")]
    Duplicate(AppId),

    #[error("peer {0} is the local process")]
    SelfId(AppId),

    #[error("peer {0} not found")]
    NotFound(AppId),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Worker pool submission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker queue is full")]
    QueueFull,

    #[error("worker pool is stopped")]
    Stopped,
}
