//! Shared wire protocol definitions for the `PQChat` relay.

pub mod frame;
