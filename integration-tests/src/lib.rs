//! Test-only crate hosting the relay end-to-end integration suite.
//!
//! The integration tests live here (rather than in `pqchat-relay` itself) so
//! that they link Tokio without the `test-util` feature the relay's own unit
//! tests require — that feature's mock clock changes the monitor's timing and
//! would disturb the real-time WebSocket assertions in these tests.
