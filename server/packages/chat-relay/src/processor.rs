//! The per-request state machine.
//!
//! `INIT → MODEL_NEGOTIATION → PARAM_CACHE_REFRESH → PROMPT_SUBMIT →
//! RESPONSE_DISPATCH → {STREAMING_WAIT | NONSTREAM_WAIT} → DONE`
//!
//! Every transition goes through [`RequestContext::enter`], which checks the
//! request's disconnect state and short-circuits with `ClientDisconnected`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chat_relay_error::RelayError;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::automation::{AutomationError, ChatAutomation, RecordStream, ResponseBody};
use crate::completion::CompletionSignal;
use crate::config::{RelayConfig, ResponseSource, CHAT_COMPLETION_ID_PREFIX};
use crate::delta::{encode_params, new_tool_call_id, StreamRecord};
use crate::liveness::ConnectionHandle;
use crate::monitor::{spawn_disconnect_monitor, DisconnectState, MonitorSet};
use crate::openai::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, FunctionCall, ResponseMessage,
    ToolCall, CHAT_COMPLETION_OBJECT, FINISH_STOP, FINISH_TOOL_CALLS,
};
use crate::prompt::prepare_combined_prompt;
use crate::slot::ResultSlot;
use crate::source::{response_records, StreamQueue};
use crate::sse::{completion_id, spawn_stream_producer, unix_timestamp, EventStream, StreamSetup};
use crate::state::ServerState;
use crate::usage::{calculate_usage, TokenEstimator};

/// What a request's slot resolves to on success.
pub enum Dispatched {
    Json(ChatCompletionResponse),
    Stream(EventStream),
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(response) => f.debug_tuple("Json").field(&response.id).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub type RelaySlot = ResultSlot<Dispatched>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Init,
    ModelNegotiation,
    ParamCacheRefresh,
    PromptSubmit,
    ResponseDispatch,
    StreamingWait,
    NonStreamWait,
    Done,
}

impl RequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ModelNegotiation => "model_negotiation",
            Self::ParamCacheRefresh => "param_cache_refresh",
            Self::PromptSubmit => "prompt_submit",
            Self::ResponseDispatch => "response_dispatch",
            Self::StreamingWait => "streaming_wait",
            Self::NonStreamWait => "nonstream_wait",
            Self::Done => "done",
        }
    }
}

/// Per-request handles threaded through every stage.
pub struct RequestContext {
    pub request_id: String,
    pub connection: ConnectionHandle,
    pub disconnect: DisconnectState,
    pub slot: RelaySlot,
    pub monitors: MonitorSet,
    stage: RequestStage,
    prompt_submitted: bool,
}

impl RequestContext {
    pub fn new(request_id: String, connection: ConnectionHandle, slot: RelaySlot) -> Self {
        let disconnect = DisconnectState::new(&request_id);
        Self {
            request_id,
            connection,
            disconnect,
            slot,
            monitors: MonitorSet::default(),
            stage: RequestStage::Init,
            prompt_submitted: false,
        }
    }

    pub fn stage(&self) -> RequestStage {
        self.stage
    }

    /// Whether the page has been given this request's prompt and needs a reset.
    pub fn prompt_submitted(&self) -> bool {
        self.prompt_submitted
    }

    pub fn set_stage(&mut self, stage: RequestStage) {
        tracing::debug!(request_id = %self.request_id, stage = stage.as_str(), "entering stage");
        self.stage = stage;
    }

    /// Transition with a disconnect check.
    pub fn enter(&mut self, stage: RequestStage) -> Result<(), RelayError> {
        self.set_stage(stage);
        if self
            .disconnect
            .observe(&self.connection, &self.slot, stage.as_str())
        {
            Ok(())
        } else {
            Err(RelayError::disconnected(&self.request_id, stage.as_str()))
        }
    }
}

/// How the response reached the client.
#[derive(Debug)]
pub enum Dispatch {
    /// The slot holds a live event stream; the producer sets `completion`.
    Streaming {
        completion: CompletionSignal,
        producer: JoinHandle<()>,
    },
    /// The slot already holds the full JSON response.
    Complete,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub response_source: ResponseSource,
    pub liveness_interval: Duration,
    pub pseudo_stream_delay: Duration,
}

impl From<&RelayConfig> for ProcessorConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            response_source: config.response_source,
            liveness_interval: config.liveness_interval,
            pseudo_stream_delay: config.pseudo_stream_delay,
        }
    }
}

pub struct RequestProcessor {
    automation: Arc<dyn ChatAutomation>,
    state: Arc<ServerState>,
    stream_queue: Arc<StreamQueue>,
    estimator: Arc<dyn TokenEstimator>,
    config: ProcessorConfig,
}

impl RequestProcessor {
    pub fn new(
        automation: Arc<dyn ChatAutomation>,
        state: Arc<ServerState>,
        stream_queue: Arc<StreamQueue>,
        estimator: Arc<dyn TokenEstimator>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            automation,
            state,
            stream_queue,
            estimator,
            config,
        }
    }

    /// Drives one request up to dispatch. On success the slot has been
    /// resolved (or was already resolved by a disconnect); on error the
    /// caller resolves it.
    pub async fn run(
        &self,
        ctx: &mut RequestContext,
        request: &ChatCompletionRequest,
    ) -> Result<Dispatch, RelayError> {
        ctx.monitors.push(
            "disconnect",
            spawn_disconnect_monitor(
                ctx.connection.clone(),
                ctx.disconnect.clone(),
                ctx.slot.clone(),
                self.config.liveness_interval,
            ),
        );

        ctx.enter(RequestStage::Init)?;
        match self.automation.is_ready().await {
            Ok(true) => {}
            Ok(false) => return Err(RelayError::unavailable("chat page is not ready")),
            Err(err) => return Err(self.classify(ctx, err).await),
        }

        ctx.enter(RequestStage::ModelNegotiation)?;
        let switched = self.negotiate_model(ctx, request.model.as_deref()).await?;

        ctx.enter(RequestStage::ParamCacheRefresh)?;
        self.refresh_parameters(ctx, request, switched).await?;

        ctx.enter(RequestStage::PromptSubmit)?;
        let prompt = prepare_combined_prompt(&ctx.request_id, &request.messages);
        ctx.disconnect.check("before prompt submission")?;
        if let Err(err) = self.automation.submit_prompt(&prompt, &ctx.disconnect).await {
            return Err(self.classify(ctx, err).await);
        }
        ctx.prompt_submitted = true;

        ctx.enter(RequestStage::ResponseDispatch)?;
        if request.stream {
            Ok(self.dispatch_stream(ctx, request))
        } else {
            self.dispatch_json(ctx, request).await
        }
    }

    /// Returns whether the active model changed.
    async fn negotiate_model(
        &self,
        ctx: &RequestContext,
        requested: Option<&str>,
    ) -> Result<bool, RelayError> {
        let Some(requested) = requested.map(str::trim).filter(|model| !model.is_empty()) else {
            return Ok(false);
        };
        if requested == self.state.proxy_model_name() {
            return Ok(false);
        }
        // `vendor/model` ids address the bare model name.
        let model_id = requested.rsplit('/').next().unwrap_or(requested);

        let available = self.state.models(self.automation.as_ref()).await;
        if !available.iter().any(|entry| entry.id == model_id) {
            return Err(RelayError::ModelUnavailable {
                model: requested.to_string(),
                available: available.into_iter().map(|entry| entry.id).collect(),
            });
        }

        let _switch = self.state.lock_model_switch().await;
        let previous = self.state.active_model();
        if previous.as_deref() == Some(model_id) {
            return Ok(false);
        }
        ctx.disconnect.check("before model switch")?;
        tracing::info!(
            request_id = %ctx.request_id,
            from = previous.as_deref().unwrap_or("unknown"),
            to = %model_id,
            "switching model"
        );
        match self.automation.switch_model(model_id).await {
            Ok(true) => {
                self.state.set_active_model(Some(model_id.to_string()));
                Ok(true)
            }
            Ok(false) => {
                tracing::warn!(request_id = %ctx.request_id, model = %model_id, "page refused model switch");
                self.state.set_active_model(previous);
                Err(RelayError::ModelSwitchFailed {
                    model: model_id.to_string(),
                })
            }
            Err(AutomationError::Disconnected) => {
                self.state.set_active_model(previous);
                Err(RelayError::disconnected(&ctx.request_id, "model switch"))
            }
            Err(err) => {
                tracing::error!(request_id = %ctx.request_id, model = %model_id, error = %err, "model switch failed");
                self.state.set_active_model(previous);
                self.snapshot(ctx, "model_switch").await;
                Err(RelayError::ModelSwitchFailed {
                    model: model_id.to_string(),
                })
            }
        }
    }

    async fn refresh_parameters(
        &self,
        ctx: &RequestContext,
        request: &ChatCompletionRequest,
        switched: bool,
    ) -> Result<(), RelayError> {
        let active = self.state.active_model();
        let mut cache = self.state.lock_params_cache().await;
        if switched || cache.model() != active.as_deref() {
            tracing::debug!(request_id = %ctx.request_id, "clearing parameter cache");
            cache.clear();
        }
        let pending = cache.diff(&request.generation_params());
        if pending.is_empty() {
            cache.record(active, &pending);
            return Ok(());
        }
        ctx.disconnect.check("before parameter update")?;
        match self.automation.apply_parameters(&pending, &ctx.disconnect).await {
            Ok(()) => {
                cache.record(active, &pending);
                Ok(())
            }
            Err(err) => {
                drop(cache);
                Err(self.classify(ctx, err).await)
            }
        }
    }

    fn dispatch_stream(&self, ctx: &mut RequestContext, request: &ChatCompletionRequest) -> Dispatch {
        let records = match self.config.response_source {
            ResponseSource::AuxStream => self.stream_queue.records(&ctx.request_id),
            ResponseSource::Page => self.page_records(ctx),
        };
        let created = unix_timestamp();
        let setup = StreamSetup {
            request_id: ctx.request_id.clone(),
            completion_id: completion_id(CHAT_COMPLETION_ID_PREFIX, &ctx.request_id, created),
            model: self.state.response_model_name(),
            created,
            messages: request.messages.clone(),
            estimator: self.estimator.clone(),
        };
        let completion = CompletionSignal::new();
        let (events, producer) =
            spawn_stream_producer(setup, records, completion.clone(), ctx.disconnect.clone());
        if !ctx.slot.resolve(Ok(Dispatched::Stream(events))) {
            // Dropping the unused stream closes the channel and stops the producer.
            tracing::info!(request_id = %ctx.request_id, "request already resolved; discarding stream");
        }
        Dispatch::Streaming {
            completion,
            producer,
        }
    }

    /// Page responses are fetched lazily inside the producer so the client
    /// gets its stream headers right away.
    fn page_records(&self, ctx: &RequestContext) -> RecordStream {
        let automation = self.automation.clone();
        let disconnect = ctx.disconnect.clone();
        let delay = self.config.pseudo_stream_delay;
        let tag = format!("{}_{}", RequestStage::ResponseDispatch.as_str(), ctx.request_id);
        let fetch = async move {
            match automation.get_response(&disconnect).await {
                Ok(body) => response_records(body, delay),
                Err(err) => {
                    if !matches!(err, AutomationError::Disconnected) {
                        if let Err(snapshot_err) = automation.save_error_snapshot(&tag).await {
                            tracing::warn!(tag = %tag, error = %snapshot_err, "failed to save error snapshot");
                        }
                    }
                    let failed: RecordStream = Box::pin(futures::stream::once(async move { Err(err) }));
                    failed
                }
            }
        };
        Box::pin(futures::stream::once(fetch).flatten())
    }

    async fn dispatch_json(
        &self,
        ctx: &mut RequestContext,
        request: &ChatCompletionRequest,
    ) -> Result<Dispatch, RelayError> {
        ctx.enter(RequestStage::NonStreamWait)?;
        let outcome = match self.config.response_source {
            ResponseSource::AuxStream => {
                collect_final(self.stream_queue.records(&ctx.request_id), &ctx.disconnect).await
            }
            ResponseSource::Page => match self.automation.get_response(&ctx.disconnect).await {
                Ok(ResponseBody::Text(text)) => Ok(Some(StreamRecord {
                    body: text,
                    done: true,
                    ..StreamRecord::default()
                })),
                Ok(ResponseBody::Stream(records)) => collect_final(records, &ctx.disconnect).await,
                Err(err) => Err(err),
            },
        };
        let record = match outcome {
            Ok(Some(record)) if record.timed_out => {
                return Err(self
                    .classify(ctx, AutomationError::failed("response source timed out"))
                    .await)
            }
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(self
                    .classify(ctx, AutomationError::failed("response ended without completing"))
                    .await)
            }
            Err(err) => return Err(self.classify(ctx, err).await),
        };

        let response = self.build_response(ctx, request, record);
        ctx.enter(RequestStage::Done)?;
        if !ctx.slot.resolve(Ok(Dispatched::Json(response))) {
            tracing::info!(request_id = %ctx.request_id, "request already resolved; dropping response");
        }
        Ok(Dispatch::Complete)
    }

    fn build_response(
        &self,
        ctx: &RequestContext,
        request: &ChatCompletionRequest,
        record: StreamRecord,
    ) -> ChatCompletionResponse {
        let usage = calculate_usage(
            self.estimator.as_ref(),
            &request.messages,
            &record.body,
            &record.reason,
        );
        let tool_calls: Vec<ToolCall> = record
            .function_calls
            .iter()
            .map(|call| ToolCall {
                index: None,
                id: new_tool_call_id(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: encode_params(&call.params),
                },
            })
            .collect();
        let finish_reason = if tool_calls.is_empty() {
            FINISH_STOP
        } else {
            FINISH_TOOL_CALLS
        };
        let content = if !tool_calls.is_empty() && record.body.is_empty() {
            None
        } else {
            Some(record.body)
        };
        let created = unix_timestamp();
        ChatCompletionResponse {
            id: completion_id(CHAT_COMPLETION_ID_PREFIX, &ctx.request_id, created),
            object: CHAT_COMPLETION_OBJECT.to_string(),
            created,
            model: self.state.response_model_name(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content,
                    reasoning_content: Some(record.reason).filter(|reason| !reason.is_empty()),
                    tool_calls: Some(tool_calls).filter(|calls| !calls.is_empty()),
                },
                finish_reason: finish_reason.to_string(),
                native_finish_reason: Some(finish_reason.to_string()),
            }],
            usage,
        }
    }

    /// Maps a collaborator failure onto the relay taxonomy. Genuine upstream
    /// failures leave a page snapshot behind.
    async fn classify(&self, ctx: &RequestContext, err: AutomationError) -> RelayError {
        let stage = ctx.stage().as_str();
        match err {
            AutomationError::Disconnected => RelayError::disconnected(&ctx.request_id, stage),
            _ if ctx.disconnect.is_disconnected() => RelayError::disconnected(&ctx.request_id, stage),
            AutomationError::NotReady => RelayError::unavailable("chat page is not ready"),
            other => {
                tracing::error!(request_id = %ctx.request_id, stage, error = %other, "automation failure");
                self.snapshot(ctx, stage).await;
                RelayError::upstream(other.to_string())
            }
        }
    }

    async fn snapshot(&self, ctx: &RequestContext, stage: &str) {
        let tag = format!("{stage}_{}", ctx.request_id);
        if let Err(err) = self.automation.save_error_snapshot(&tag).await {
            tracing::warn!(tag = %tag, error = %err, "failed to save error snapshot");
        }
    }
}

/// Reads `records` to the end and returns the final snapshot, or `None` when
/// the source ended without a `done` record.
async fn collect_final(
    mut records: RecordStream,
    disconnect: &DisconnectState,
) -> Result<Option<StreamRecord>, AutomationError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = disconnect.disconnected() => return Err(AutomationError::Disconnected),
            next = records.next() => next,
        };
        match next {
            None => return Ok(None),
            Some(Err(err)) => return Err(err),
            Some(Ok(record)) if record.done => return Ok(Some(record)),
            Some(Ok(_)) => {}
        }
    }
}
