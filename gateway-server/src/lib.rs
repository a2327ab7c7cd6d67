//! Mesh Gateway
//!
//! Clients connect to the gateway's external listener and speak role commands
//! (login, lobby, ...). The gateway never interprets them: each command is
//! routed by its id range to a backend peer, wrapped in a forwarding envelope,
//! and replies travel back the same way.

pub mod gateway;

pub use gateway::GatewayRole;
