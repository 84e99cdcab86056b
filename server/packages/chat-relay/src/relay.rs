//! Process-wide runtime: the queue, shared state, and the worker task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chat_relay_error::RelayError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::automation::ChatAutomation;
use crate::config::RelayConfig;
use crate::liveness::ConnectionHandle;
use crate::openai::ChatCompletionRequest;
use crate::processor::{Dispatched, ProcessorConfig, RequestProcessor};
use crate::queue::{QueueItem, RequestQueue};
use crate::slot::{result_slot, SlotReceiver};
use crate::source::StreamQueue;
use crate::state::{load_excluded_models, ServerState};
use crate::usage::{HeuristicEstimator, TokenEstimator};
use crate::worker::{ProcessingLock, Worker, WorkerConfig};

pub struct RelayBuilder {
    config: RelayConfig,
    automation: Arc<dyn ChatAutomation>,
    stream_queue: Option<Arc<StreamQueue>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
}

impl RelayBuilder {
    /// Shares an existing stream queue, e.g. with an in-process interceptor.
    pub fn stream_queue(mut self, stream_queue: Arc<StreamQueue>) -> Self {
        self.stream_queue = Some(stream_queue);
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Builds the runtime and spawns the worker. Must be called inside a
    /// tokio runtime.
    pub fn start(self) -> Arc<Relay> {
        let config = Arc::new(self.config);
        let excluded = config
            .excluded_models_path
            .as_deref()
            .map(load_excluded_models)
            .unwrap_or_else(HashSet::new);
        let state = Arc::new(ServerState::new(
            config.model_name.clone(),
            excluded,
            config.catalog_ttl,
        ));
        let stream_queue = self
            .stream_queue
            .unwrap_or_else(|| Arc::new(StreamQueue::new(config.stream_idle_timeout)));
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(HeuristicEstimator));
        let queue = Arc::new(RequestQueue::new());
        let lock = Arc::new(ProcessingLock::default());
        let shutdown = CancellationToken::new();

        let processor = RequestProcessor::new(
            self.automation.clone(),
            state.clone(),
            stream_queue.clone(),
            estimator,
            ProcessorConfig::from(config.as_ref()),
        );
        let worker = Worker::new(
            queue.clone(),
            processor,
            lock.clone(),
            self.automation.clone(),
            stream_queue.clone(),
            WorkerConfig::from(config.as_ref()),
        );
        let handle = worker.spawn(shutdown.clone());
        tracing::info!(
            model = %config.model_name,
            response_source = ?config.response_source,
            "relay started"
        );

        Arc::new(Relay {
            config,
            queue,
            state,
            automation: self.automation,
            stream_queue,
            lock,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }
}

pub struct Relay {
    config: Arc<RelayConfig>,
    queue: Arc<RequestQueue>,
    state: Arc<ServerState>,
    automation: Arc<dyn ChatAutomation>,
    stream_queue: Arc<StreamQueue>,
    lock: Arc<ProcessingLock>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    pub fn builder(config: RelayConfig, automation: Arc<dyn ChatAutomation>) -> RelayBuilder {
        RelayBuilder {
            config,
            automation,
            stream_queue: None,
            estimator: None,
        }
    }

    pub fn start(config: RelayConfig, automation: Arc<dyn ChatAutomation>) -> Arc<Self> {
        Self::builder(config, automation).start()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn automation(&self) -> &dyn ChatAutomation {
        self.automation.as_ref()
    }

    pub fn stream_queue(&self) -> &StreamQueue {
        &self.stream_queue
    }

    pub fn is_processing(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn worker_running(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.worker.lock() {
            Ok(worker) => worker.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
        }
    }

    /// Admits a request and returns the receiving half of its result slot.
    /// Fails once shutdown has begun.
    pub fn enqueue(
        &self,
        request_id: String,
        request: ChatCompletionRequest,
        connection: ConnectionHandle,
    ) -> Result<SlotReceiver<Dispatched>, RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::unavailable("server is shutting down"));
        }
        let (slot, receiver) = result_slot();
        self.queue
            .enqueue(QueueItem::new(request_id, request, connection, slot))?;
        Ok(receiver)
    }

    /// Stops the worker and waits for it to drain the queue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "request worker failed");
            }
        }
    }
}
