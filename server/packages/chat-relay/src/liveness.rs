//! Client connection liveness.
//!
//! hyper drops a handler future (and any streaming body it returned) as soon
//! as the client connection goes away. The handler holds a [`ConnectionGuard`]
//! for the lifetime of its response; dropping it flips the paired
//! [`ConnectionHandle`], which the worker and monitors probe without blocking.

use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    closed: CancellationToken,
}

/// Keeps the paired [`ConnectionHandle`] alive until dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    _guard: DropGuard,
}

pub fn connection_pair() -> (ConnectionHandle, ConnectionGuard) {
    let closed = CancellationToken::new();
    let guard = ConnectionGuard {
        _guard: closed.clone().drop_guard(),
    };
    (ConnectionHandle { closed }, guard)
}

impl ConnectionHandle {
    /// Non-blocking liveness probe.
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Probes `handle` and logs the first observation of a dead client at `stage`.
pub fn probe(request_id: &str, handle: &ConnectionHandle, stage: &str) -> bool {
    let connected = handle.is_connected();
    if !connected {
        tracing::info!(request_id = %request_id, stage = %stage, "client connection closed");
    }
    connected
}
