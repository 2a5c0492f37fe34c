//! Liveness monitor: probes every open connection and evicts the
//! unresponsive.
//!
//! Two independent timers drive the monitor. The probe timer marks each
//! responsive connection as awaiting and sends it a WebSocket Ping. The
//! shorter check timer evicts connections whose probe has gone unanswered
//! for a full probe interval, so an answer always has at least one complete
//! cycle to arrive. Eviction runs the same cleanup as an explicit
//! disconnect, which is what keeps half-open connections from lingering as
//! phantom room members.

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::time::Instant;

use crate::registry::ConnId;
use crate::relay::{self, RelayState};

/// Runs the monitor loop until the process (or the owning task) ends.
///
/// Probe and check cycles run independently of frame handling and never
/// block on it.
pub async fn run(state: Arc<RelayState>) {
    let mut probe = tokio::time::interval(state.probe_interval);
    let mut check = tokio::time::interval(state.check_interval);
    loop {
        tokio::select! {
            _ = probe.tick() => send_probes(&state).await,
            _ = check.tick() => evict_unresponsive(&state).await,
        }
    }
}

/// Marks every responsive connection as awaiting and sends it a Ping.
pub(crate) async fn send_probes(state: &Arc<RelayState>) {
    for (conn_id, sender) in state.registry.begin_probe(Instant::now()).await {
        tracing::trace!(conn_id, "sending liveness probe");
        let _ = sender.send(Message::Ping(Vec::new().into()));
    }
}

/// Evicts every connection whose probe has been unanswered for at least one
/// probe interval.
pub(crate) async fn evict_unresponsive(state: &Arc<RelayState>) {
    let stale = state
        .registry
        .stale_connections(Instant::now(), state.probe_interval)
        .await;
    for conn_id in stale {
        tracing::info!(conn_id, "liveness probe unanswered, evicting connection");
        evict(state, conn_id).await;
    }
}

/// Forcibly closes one connection, running the standard disconnect cleanup.
///
/// Nothing is reported to the evicted client beyond the close frame.
async fn evict(state: &Arc<RelayState>, conn_id: ConnId) {
    // Hold the sender across cleanup so the writer task still gets the
    // close frame after the registry entry is gone.
    let sender = state.registry.sender_for_conn(conn_id).await;
    relay::disconnect_cleanup(state, conn_id).await;
    if let Some(sender) = sender {
        let _ = sender.send(Message::Close(None));
    }
}
