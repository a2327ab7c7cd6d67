//! Identifiers: connection ids, application ids, timestamps
//!
//! Connection ids are 64-bit snowflakes:
//!
//! ```text
//! ┌──────────────────────────┬──────────────┬───────────────┐
//! │ milliseconds (<< 22)     │ worker (10b) │ sequence (12b)│
//! └──────────────────────────┴──────────────┴───────────────┘
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::NetError;

// ============================================================================
// Constants
// ============================================================================

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Worker id used when the process does not configure one
pub const DEFAULT_WORKER_ID: u16 = 1;

// ============================================================================
// Types
// ============================================================================

/// Application instance id. `0` marks a placeholder whose identity is unknown.
pub type AppId = u64;

/// Group id used to partition a deployment (0 = no group).
pub type GroupId = u32;

/// Process-unique identity of one live connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Connection Id Generator
// ============================================================================

/// Snowflake generator owned by the node (no global state).
#[derive(Debug)]
pub struct ConnectionIdGenerator {
    worker_id: u64,
    last_ms: i64,
    sequence: u64,
}

impl ConnectionIdGenerator {
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id) & WORKER_MASK,
            last_ms: 0,
            sequence: 0,
        }
    }

    /// Produce the next id. When the 12-bit sequence wraps inside one
    /// millisecond, waits for the clock to advance.
    pub fn next_id(&mut self) -> ConnectionId {
        // A clock step backwards keeps using the last timestamp
        let mut now = now_ms().max(self.last_ms);

        if now == self.last_ms {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
            if self.sequence == 0 {
                while now <= self.last_ms {
                    std::hint::spin_loop();
                    now = now_ms();
                }
            }
        } else {
            self.sequence = 0;
        }

        self.last_ms = now;
        ConnectionId(
            ((now as u64) << (WORKER_BITS + SEQUENCE_BITS))
                | (self.worker_id << SEQUENCE_BITS)
                | self.sequence,
        )
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_ID)
    }
}

/// Pick a random non-zero application id for a process configured with id 0.
pub fn random_app_id(rng: &SystemRandom) -> Result<AppId, NetError> {
    let mut bytes = [0u8; 4];
    rng.fill(&mut bytes).map_err(|_| {
        NetError::Init(std::io::Error::new(
            std::io::ErrorKind::Other,
            "system random source unavailable",
        ))
    })?;
    Ok(u64::from(u32::from_be_bytes(bytes) >> 1) + 1)
}

// ============================================================================
// Tests
// ============================================================================
