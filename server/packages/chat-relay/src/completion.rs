//! Completion latch shared between a streaming response and the worker.
//!
//! Whichever side finishes first records the cause; the worker uses it to
//! decide whether the producer still needs aborting.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Who set a [`CompletionSignal`] first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCause {
    /// The response producer flushed everything (or failed and gave up).
    Producer,
    /// A monitor saw the client go away while output was being produced.
    Disconnect,
    /// The worker's bounded wait expired.
    Timeout,
    /// The worker is tearing the request down.
    Cleanup,
}

/// One-shot latch shared by a response producer and the worker.
///
/// Monotonic: once set it stays set, and only the first cause is recorded.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    token: CancellationToken,
    cause: Arc<OnceLock<CompletionCause>>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call was the one that set the latch.
    pub fn set(&self, cause: CompletionCause) -> bool {
        let won = self.cause.set(cause).is_ok();
        self.token.cancel();
        won
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<CompletionCause> {
        self.cause.get().copied()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Sets the latch with `cause` when dropped, so the latch is released on
    /// every exit path of the owner, including panics and task aborts.
    pub fn guard(&self, cause: CompletionCause) -> CompletionGuard {
        CompletionGuard {
            signal: self.clone(),
            cause,
        }
    }
}

pub struct CompletionGuard {
    signal: CompletionSignal,
    cause: CompletionCause,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.signal.set(self.cause);
    }
}
