//! Single-assignment result delivery between the worker and an HTTP handler.
//!
//! The handler keeps the [`SlotReceiver`]; every other party (worker, monitors,
//! cancel endpoint, queue maintenance) holds a clone of the [`ResultSlot`]. The
//! first `resolve` wins; later calls are no-ops and report `false`.

use std::fmt;
use std::sync::{Arc, Mutex};

use chat_relay_error::RelayError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub type SlotResult<T> = Result<T, RelayError>;

pub struct ResultSlot<T> {
    inner: Arc<SlotInner<T>>,
}

struct SlotInner<T> {
    sender: Mutex<Option<oneshot::Sender<SlotResult<T>>>>,
    resolved: CancellationToken,
}

pub struct SlotReceiver<T> {
    receiver: oneshot::Receiver<SlotResult<T>>,
}

pub fn result_slot<T>() -> (ResultSlot<T>, SlotReceiver<T>) {
    let (sender, receiver) = oneshot::channel();
    let slot = ResultSlot {
        inner: Arc::new(SlotInner {
            sender: Mutex::new(Some(sender)),
            resolved: CancellationToken::new(),
        }),
    };
    (slot, SlotReceiver { receiver })
}

impl<T> ResultSlot<T> {
    /// Returns `true` only for the call that actually resolved the slot. A
    /// receiver that already went away still counts as resolved.
    pub fn resolve(&self, result: SlotResult<T>) -> bool {
        let sender = match self.inner.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(sender) = sender else {
            return false;
        };
        let _ = sender.send(result);
        self.inner.resolved.cancel();
        true
    }

    pub fn resolve_err(&self, error: RelayError) -> bool {
        self.resolve(Err(error))
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.is_cancelled()
    }

    pub async fn wait_resolved(&self) {
        self.inner.resolved.cancelled().await;
    }
}

impl<T> Clone for ResultSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ResultSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSlot")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<T> SlotReceiver<T> {
    /// Waits for the slot. If every `ResultSlot` handle is dropped without
    /// resolving, the request is reported as an internal error.
    pub async fn recv(self) -> SlotResult<T> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(RelayError::internal("request dropped without a result")),
        }
    }
}
