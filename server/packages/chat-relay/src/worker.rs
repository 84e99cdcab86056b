//! The single queue consumer.
//!
//! One worker owns the page: it dequeues requests in FIFO order, holds the
//! processing lock while a request drives the page, and resets the page after
//! every request that got as far as submitting a prompt.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chat_relay_error::RelayError;
use futures::FutureExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::automation::ChatAutomation;
use crate::completion::{CompletionCause, CompletionSignal};
use crate::config::RelayConfig;
use crate::liveness::probe;
use crate::monitor::{spawn_completion_monitor, DisconnectState};
use crate::processor::{Dispatch, RequestContext, RequestProcessor, RequestStage};
use crate::queue::{QueueItem, RequestQueue};
use crate::source::StreamQueue;

/// Mutual exclusion over the chat page.
#[derive(Debug, Default)]
pub struct ProcessingLock {
    inner: Mutex<()>,
}

impl ProcessingLock {
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub dequeue_timeout: Duration,
    pub maintenance_batch: usize,
    pub min_stream_interval: Duration,
    pub liveness_interval: Duration,
    pub completion_wait: Duration,
}

impl From<&RelayConfig> for WorkerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            dequeue_timeout: config.dequeue_timeout,
            maintenance_batch: config.maintenance_batch,
            min_stream_interval: config.min_stream_interval,
            liveness_interval: config.liveness_interval,
            completion_wait: config.completion_wait(),
        }
    }
}

/// What the previous request looked like, for spacing streaming requests.
#[derive(Debug, Default)]
struct Pacing {
    last_was_streaming: bool,
    last_completed: Option<Instant>,
}

impl Pacing {
    fn delay_for(&self, streaming: bool, min_interval: Duration) -> Option<Duration> {
        if !streaming || !self.last_was_streaming {
            return None;
        }
        let elapsed = self.last_completed?.elapsed();
        Some(min_interval.saturating_sub(elapsed)).filter(|delay| !delay.is_zero())
    }
}

pub struct Worker {
    queue: Arc<RequestQueue>,
    processor: RequestProcessor,
    lock: Arc<ProcessingLock>,
    automation: Arc<dyn ChatAutomation>,
    stream_queue: Arc<StreamQueue>,
    config: WorkerConfig,
    pacing: Pacing,
}

impl Worker {
    pub fn new(
        queue: Arc<RequestQueue>,
        processor: RequestProcessor,
        lock: Arc<ProcessingLock>,
        automation: Arc<dyn ChatAutomation>,
        stream_queue: Arc<StreamQueue>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            lock,
            automation,
            stream_queue,
            config,
            pacing: Pacing::default(),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` fires, then resolves everything still queued.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("request worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let pruned = self.queue.prune_disconnected(self.config.maintenance_batch);
            if pruned > 0 {
                tracing::debug!(pruned, "pruned disconnected requests");
            }

            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = self.queue.dequeue_blocking(self.config.dequeue_timeout) => item,
            };
            let Some(item) = item else {
                continue;
            };

            let request_id = item.request_id.clone();
            let slot = item.slot.clone();
            let handled = AssertUnwindSafe(self.handle(item, &shutdown))
                .catch_unwind()
                .await;
            if handled.is_err() {
                tracing::error!(request_id = %request_id, "request handling panicked");
                slot.resolve_err(RelayError::internal("request handling panicked"));
            }
        }

        let remaining = self.queue.close();
        if !remaining.is_empty() {
            tracing::info!(count = remaining.len(), "rejecting queued requests on shutdown");
        }
        for item in remaining {
            item.slot
                .resolve_err(RelayError::unavailable("server is shutting down"));
        }
        tracing::info!("request worker stopped");
    }

    async fn handle(&mut self, item: QueueItem, shutdown: &CancellationToken) {
        if item.is_cancelled() {
            tracing::debug!(request_id = %item.request_id, "discarding cancelled request");
            item.slot.resolve_err(RelayError::Cancelled {
                request_id: item.request_id.clone(),
            });
            return;
        }
        let QueueItem {
            request_id,
            request,
            connection,
            slot,
            enqueued_at,
            ..
        } = item;
        tracing::info!(
            request_id = %request_id,
            stream = request.stream,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "processing request"
        );

        if !probe(&request_id, &connection, "dequeued") {
            slot.resolve_err(RelayError::disconnected(&request_id, "dequeued"));
            return;
        }

        if let Some(delay) = self
            .pacing
            .delay_for(request.stream, self.config.min_stream_interval)
        {
            tracing::info!(request_id = %request_id, delay_ms = delay.as_millis() as u64, "spacing consecutive streaming requests");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    slot.resolve_err(RelayError::unavailable("server is shutting down"));
                    return;
                }
            }
            if !probe(&request_id, &connection, "pacing") {
                slot.resolve_err(RelayError::disconnected(&request_id, "pacing"));
                return;
            }
        }

        let lock = self.lock.clone();
        let guard = tokio::select! {
            guard = lock.acquire() => guard,
            _ = shutdown.cancelled() => {
                slot.resolve_err(RelayError::unavailable("server is shutting down"));
                return;
            }
        };
        if !probe(&request_id, &connection, "lock acquired") {
            slot.resolve_err(RelayError::disconnected(&request_id, "lock acquired"));
            return;
        }

        let started = Instant::now();
        let mut ctx = RequestContext::new(request_id.clone(), connection, slot);
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(
                self.config.completion_wait,
                self.processor.run(&mut ctx, &request),
            ) => Some(outcome),
            _ = shutdown.cancelled() => None,
        };
        match outcome {
            Some(Ok(Ok(Dispatch::Streaming {
                completion,
                producer,
            }))) => self.await_stream(&mut ctx, completion, producer, shutdown).await,
            Some(Ok(Ok(Dispatch::Complete))) => self.await_result(&mut ctx, shutdown).await,
            Some(Ok(Err(err))) => {
                log_failure(&ctx, &err);
                ctx.slot.resolve_err(err);
            }
            None => {
                tracing::info!(request_id = %ctx.request_id, "abandoning request on shutdown");
                ctx.slot
                    .resolve_err(RelayError::unavailable("server is shutting down"));
            }
            Some(Err(_)) => {
                tracing::warn!(request_id = %ctx.request_id, stage = ctx.stage().as_str(), "request processing timed out");
                ctx.slot.resolve_err(RelayError::timeout(format!(
                    "request {} timed out during {}",
                    ctx.request_id,
                    ctx.stage().as_str()
                )));
            }
        }
        ctx.monitors.shutdown().await;
        drop(guard);

        self.cleanup(&ctx).await;
        self.pacing = Pacing {
            last_was_streaming: request.stream,
            last_completed: Some(Instant::now()),
        };
        tracing::info!(
            request_id = %ctx.request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request finished"
        );
    }

    async fn await_stream(
        &self,
        ctx: &mut RequestContext,
        completion: CompletionSignal,
        producer: JoinHandle<()>,
        shutdown: &CancellationToken,
    ) {
        ctx.set_stage(RequestStage::StreamingWait);
        ctx.monitors.push(
            "completion",
            spawn_completion_monitor(
                ctx.connection.clone(),
                ctx.disconnect.clone(),
                completion.clone(),
                self.config.liveness_interval,
            ),
        );
        tokio::select! {
            _ = completion.wait() => {}
            _ = tokio::time::sleep(self.config.completion_wait) => {
                if completion.set(CompletionCause::Timeout) {
                    tracing::warn!(request_id = %ctx.request_id, "timed out waiting for stream to finish");
                }
            }
            _ = shutdown.cancelled() => {
                completion.set(CompletionCause::Cleanup);
            }
        }

        if completion.cause() != Some(CompletionCause::Producer) {
            producer.abort();
        }
        match producer.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => tracing::error!(request_id = %ctx.request_id, error = %err, "stream producer failed"),
        }
        tracing::debug!(request_id = %ctx.request_id, cause = ?completion.cause(), "stream completed");
        ctx.set_stage(RequestStage::Done);
    }

    async fn await_result(&self, ctx: &mut RequestContext, shutdown: &CancellationToken) {
        ctx.set_stage(RequestStage::NonStreamWait);
        tokio::select! {
            _ = ctx.slot.wait_resolved() => {}
            _ = tokio::time::sleep(self.config.completion_wait) => {
                ctx.slot.resolve_err(RelayError::timeout("timed out waiting for response"));
            }
            _ = shutdown.cancelled() => {
                ctx.slot.resolve_err(RelayError::unavailable("server is shutting down"));
            }
        }
        ctx.set_stage(RequestStage::Done);
    }

    /// Leaves the page ready for the next request. Runs detached from the
    /// finished request's disconnect state.
    async fn cleanup(&self, ctx: &RequestContext) {
        self.stream_queue.drain().await;
        if !ctx.prompt_submitted() {
            return;
        }
        let detached = DisconnectState::new(&ctx.request_id);
        if let Err(err) = self.automation.clear_chat_history(&detached).await {
            tracing::warn!(request_id = %ctx.request_id, error = %err, "failed to clear chat history");
        }
    }
}

fn log_failure(ctx: &RequestContext, err: &RelayError) {
    let stage = ctx.stage().as_str();
    if err.is_client_side() {
        tracing::info!(request_id = %ctx.request_id, stage, error = %err, "request ended by client");
    } else if err.status_code() >= 500 {
        tracing::error!(request_id = %ctx.request_id, stage, error = %err, "request failed");
    } else {
        tracing::warn!(request_id = %ctx.request_id, stage, error = %err, "request rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_applies_only_between_streaming_requests() {
        let min = Duration::from_secs(1);
        let pacing = Pacing {
            last_was_streaming: true,
            last_completed: Some(Instant::now()),
        };
        let delay = pacing.delay_for(true, min).expect("delay");
        assert!(delay <= min);
        assert!(delay > Duration::from_millis(500));
        assert_eq!(pacing.delay_for(false, min), None);

        let after_non_stream = Pacing {
            last_was_streaming: false,
            last_completed: Some(Instant::now()),
        };
        assert_eq!(after_non_stream.delay_for(true, min), None);
        assert_eq!(Pacing::default().delay_for(true, min), None);
    }

    #[test]
    fn pacing_expires_after_interval() {
        let pacing = Pacing {
            last_was_streaming: true,
            last_completed: Instant::now().checked_sub(Duration::from_secs(2)),
        };
        assert_eq!(pacing.delay_for(true, Duration::from_secs(1)), None);
    }

    #[tokio::test]
    async fn processing_lock_reports_state() {
        let lock = ProcessingLock::default();
        assert!(!lock.is_locked());
        let guard = lock.acquire().await;
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }
}
