//! FIFO of admitted chat-completion requests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chat_relay_error::RelayError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use utoipa::ToSchema;

use crate::liveness::ConnectionHandle;
use crate::openai::ChatCompletionRequest;
use crate::processor::RelaySlot;

#[derive(Debug)]
pub struct QueueItem {
    pub request_id: String,
    pub request: ChatCompletionRequest,
    pub connection: ConnectionHandle,
    pub slot: RelaySlot,
    pub enqueued_at: Instant,
    enqueued_at_unix: f64,
    cancelled: bool,
}

impl QueueItem {
    pub fn new(
        request_id: String,
        request: ChatCompletionRequest,
        connection: ConnectionHandle,
        slot: RelaySlot,
    ) -> Self {
        let enqueued_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        Self {
            request_id,
            request,
            connection,
            slot,
            enqueued_at: Instant::now(),
            enqueued_at_unix,
            cancelled: false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_streaming(&self) -> bool {
        self.request.stream
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct QueueEntryStatus {
    pub req_id: String,
    pub enqueue_time: f64,
    pub wait_time_seconds: f64,
    pub is_streaming: bool,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `item`, or refuses it once the queue has been closed.
    pub fn enqueue(&self, item: QueueItem) -> Result<(), RelayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RelayError::unavailable("server is shutting down"));
        }
        tracing::debug!(request_id = %item.request_id, stream = item.request.stream, "request queued");
        state.items.push_back(item);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the head, waiting up to `timeout` for one to arrive.
    pub async fn dequeue_blocking(&self, timeout: Duration) -> Option<QueueItem> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.lock().items.pop_front() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().items.pop_front();
            }
        }
    }

    /// Marks every queued item with `request_id` cancelled and resolves its
    /// slot. Items stay in place so the worker can discard them in order.
    pub fn cancel_by_id(&self, request_id: &str) -> bool {
        let mut found = false;
        for item in self.lock().items.iter_mut().filter(|item| item.request_id == request_id) {
            found = true;
            item.cancelled = true;
            if item.slot.resolve_err(RelayError::Cancelled {
                request_id: request_id.to_string(),
            }) {
                tracing::info!(request_id = %request_id, "queued request cancelled");
            }
        }
        found
    }

    /// Probes the first `batch` items and cancels the ones whose client left.
    /// Relative order is untouched.
    pub fn prune_disconnected(&self, batch: usize) -> usize {
        let mut pruned = 0;
        for item in self.lock().items.iter_mut().take(batch) {
            if item.cancelled || item.connection.is_connected() {
                continue;
            }
            item.cancelled = true;
            pruned += 1;
            if item
                .slot
                .resolve_err(RelayError::disconnected(&item.request_id, "queued"))
            {
                tracing::info!(request_id = %item.request_id, "client left while queued");
            }
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn snapshot(&self) -> Vec<QueueEntryStatus> {
        let state = self.lock();
        state
            .items
            .iter()
            .map(|item| QueueEntryStatus {
                req_id: item.request_id.clone(),
                enqueue_time: item.enqueued_at_unix,
                wait_time_seconds: (item.enqueued_at.elapsed().as_secs_f64() * 100.0).round()
                    / 100.0,
                is_streaming: item.is_streaming(),
                cancelled: item.cancelled,
            })
            .collect()
    }

    /// Refuses further items and hands back everything still queued.
    pub fn close(&self) -> Vec<QueueItem> {
        let mut state = self.lock();
        state.closed = true;
        state.items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
