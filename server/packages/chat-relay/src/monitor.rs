//! Per-request disconnect monitoring.
//!
//! Every request in flight carries a [`DisconnectState`]. Monitor tasks poll
//! the client's liveness and, on the first negative probe, mark the state and
//! resolve whatever the request is waiting on. All monitor handles live in the
//! request's [`MonitorSet`] and are torn down in one place.

use std::time::Duration;

use chat_relay_error::RelayError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::completion::{CompletionCause, CompletionSignal};
use crate::liveness::ConnectionHandle;
use crate::slot::ResultSlot;

#[derive(Debug, Clone)]
pub struct DisconnectState {
    request_id: String,
    flag: CancellationToken,
}

impl DisconnectState {
    pub fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            flag: CancellationToken::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn mark(&self) {
        self.flag.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.flag.is_cancelled()
    }

    pub async fn disconnected(&self) {
        self.flag.cancelled().await;
    }

    /// Stage-boundary check.
    pub fn check(&self, stage: &str) -> Result<(), RelayError> {
        if self.is_disconnected() {
            return Err(RelayError::disconnected(&self.request_id, stage));
        }
        Ok(())
    }

    /// Marks the state and resolves `slot` with a disconnect error when the
    /// client is gone. Returns whether the client is still connected.
    pub fn observe<T>(
        &self,
        connection: &ConnectionHandle,
        slot: &ResultSlot<T>,
        stage: &str,
    ) -> bool {
        if connection.is_connected() && !self.is_disconnected() {
            return true;
        }
        self.mark();
        if slot.resolve_err(RelayError::disconnected(&self.request_id, stage)) {
            tracing::info!(request_id = %self.request_id, stage = %stage, "client disconnected");
        }
        false
    }
}

/// Background tasks owned by one request.
#[derive(Default)]
pub struct MonitorSet {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl MonitorSet {
    pub fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Aborts and joins every monitor.
    pub async fn shutdown(&mut self) {
        for (name, handle) in self.tasks.drain(..) {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => tracing::warn!(monitor = name, error = %err, "monitor task failed"),
            }
        }
    }
}

impl Drop for MonitorSet {
    fn drop(&mut self) {
        for (_, handle) in &self.tasks {
            handle.abort();
        }
    }
}

/// Resolves `slot` with a disconnect error as soon as the client goes away.
pub fn spawn_disconnect_monitor<T: Send + 'static>(
    connection: ConnectionHandle,
    state: DisconnectState,
    slot: ResultSlot<T>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = connection.closed() => break,
                _ = ticker.tick() => {
                    if !connection.is_connected() {
                        break;
                    }
                }
            }
        }
        // The slot may already hold a dispatched response; the flag still
        // has to flip so later stage checks see it.
        state.observe(&connection, &slot, "processing");
    })
}

/// Sets `completion` early when the client disappears while output is still
/// being produced, so the worker does not hold the processing lock for a
/// reader that is gone.
pub fn spawn_completion_monitor(
    connection: ConnectionHandle,
    state: DisconnectState,
    completion: CompletionSignal,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = completion.wait() => return,
                _ = connection.closed() => break,
                _ = ticker.tick() => {
                    if !connection.is_connected() {
                        break;
                    }
                }
            }
        }
        state.mark();
        if completion.set(CompletionCause::Disconnect) {
            tracing::info!(
                request_id = %state.request_id(),
                "client disconnected during streaming; releasing worker early"
            );
        }
    })
}
