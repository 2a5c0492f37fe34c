//! `PQChat` relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, registers clients by self-asserted id,
//! tracks room membership, monitors liveness, and routes opaque payloads
//! between clients without interpreting them.

pub mod config;
pub mod monitor;
pub mod registry;
pub mod relay;
pub mod rooms;
