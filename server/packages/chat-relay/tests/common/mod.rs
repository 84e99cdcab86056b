#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::util::ServiceExt;

use chat_relay::automation::{
    AutomationError, AutomationFuture, CatalogEntry, ChatAutomation, RecordStream, ResponseBody,
};
use chat_relay::config::{RelayConfig, ResponseSource};
use chat_relay::delta::StreamRecord;
use chat_relay::monitor::DisconnectState;
use chat_relay::openai::GenerationParams;
use chat_relay::prompt::Prompt;
use chat_relay::relay::Relay;
use chat_relay::router::{build_router, AppState, AuthConfig};

/// What the scripted page does for one `get_response` call.
pub enum Reply {
    Text(String),
    Records(Vec<StreamRecord>),
    Fail(String),
    /// Blocks until the request's client goes away.
    UntilDisconnect,
    /// Blocks until notified, then answers with the text.
    Hold(Arc<Notify>, String),
    /// Never answers.
    Hang,
    Panic,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Submit(String),
    GetResponse,
    SwitchModel(String),
    ApplyParameters(GenerationParams),
    Clear,
    RefreshCatalog,
    Snapshot(String),
}

/// Automation double that replays scripted replies and records every call.
pub struct ScriptedAutomation {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<(Call, Instant)>>,
    catalog: Mutex<Vec<CatalogEntry>>,
    accept_switch: AtomicBool,
    ready: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    record_delay: Duration,
}

impl Default for ScriptedAutomation {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAutomation {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            catalog: Mutex::new(Vec::new()),
            accept_switch: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            record_delay: Duration::from_millis(5),
        }
    }

    pub fn with_replies(replies: Vec<Reply>) -> Self {
        let automation = Self::new();
        automation.replies.lock().expect("replies").extend(replies);
        automation
    }

    pub fn with_catalog(self, ids: &[&str]) -> Self {
        *self.catalog.lock().expect("catalog") = ids
            .iter()
            .map(|id| CatalogEntry::new(id, id, "test"))
            .collect();
        self
    }

    pub fn push_reply(&self, reply: Reply) {
        self.replies.lock().expect("replies").push_back(reply);
    }

    pub fn set_accept_switch(&self, accept: bool) {
        self.accept_switch.store(accept, Ordering::SeqCst);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .map(|(call, _)| call.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Call, Instant)> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .expect("calls")
            .push((call, Instant::now()));
    }

    fn next_reply(&self) -> Reply {
        self.replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or_else(|| Reply::Text("ok".to_string()))
    }
}

impl ChatAutomation for ScriptedAutomation {
    fn is_ready(&self) -> AutomationFuture<'_, bool> {
        Box::pin(async move { Ok(self.ready.load(Ordering::SeqCst)) })
    }

    fn submit_prompt<'a>(
        &'a self,
        prompt: &'a Prompt,
        _disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.record(Call::Submit(prompt.text.clone()));
            Ok(())
        })
    }

    fn get_response<'a>(
        &'a self,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ResponseBody> {
        Box::pin(async move {
            self.record(Call::GetResponse);
            match self.next_reply() {
                Reply::Text(text) => Ok(ResponseBody::Text(text)),
                Reply::Records(records) => {
                    let delay = self.record_delay;
                    let stream: RecordStream = Box::pin(
                        futures::StreamExt::then(futures::stream::iter(records), move |record| async move {
                            tokio::time::sleep(delay).await;
                            Ok(record)
                        }),
                    );
                    Ok(ResponseBody::Stream(stream))
                }
                Reply::Fail(message) => Err(AutomationError::failed(message)),
                Reply::UntilDisconnect => {
                    disconnect.disconnected().await;
                    Err(AutomationError::Disconnected)
                }
                Reply::Hold(notify, text) => {
                    notify.notified().await;
                    Ok(ResponseBody::Text(text))
                }
                Reply::Hang => {
                    futures::future::pending::<()>().await;
                    Err(AutomationError::failed("unreachable"))
                }
                Reply::Panic => panic!("scripted page crashed"),
            }
        })
    }

    fn switch_model<'a>(&'a self, model_id: &'a str) -> AutomationFuture<'a, bool> {
        Box::pin(async move {
            self.record(Call::SwitchModel(model_id.to_string()));
            Ok(self.accept_switch.load(Ordering::SeqCst))
        })
    }

    fn apply_parameters<'a>(
        &'a self,
        params: &'a GenerationParams,
        _disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            self.record(Call::ApplyParameters(params.clone()));
            Ok(())
        })
    }

    fn clear_chat_history<'a>(
        &'a self,
        _disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.record(Call::Clear);
            Ok(())
        })
    }

    fn refresh_model_catalog(&self) -> AutomationFuture<'_, Vec<CatalogEntry>> {
        Box::pin(async move {
            self.record(Call::RefreshCatalog);
            Ok(self.catalog.lock().expect("catalog").clone())
        })
    }

    fn save_error_snapshot<'a>(&'a self, tag: &'a str) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            self.record(Call::Snapshot(tag.to_string()));
            Ok(())
        })
    }
}

pub fn test_config() -> RelayConfig {
    RelayConfig {
        response_source: ResponseSource::Page,
        pseudo_stream_delay: Duration::from_millis(1),
        liveness_interval: Duration::from_millis(10),
        dequeue_timeout: Duration::from_millis(50),
        min_stream_interval: Duration::ZERO,
        stream_idle_timeout: Duration::from_millis(500),
        response_timeout: Duration::from_secs(5),
        completion_slack: Duration::from_secs(1),
        handler_slack: Duration::from_secs(2),
        ..RelayConfig::default()
    }
}

pub struct TestApp {
    pub app: Router,
    pub relay: Arc<Relay>,
    pub automation: Arc<ScriptedAutomation>,
}

impl TestApp {
    pub fn new(automation: ScriptedAutomation) -> Self {
        Self::with_config(automation, test_config(), AuthConfig::disabled())
    }

    pub fn with_config(automation: ScriptedAutomation, config: RelayConfig, auth: AuthConfig) -> Self {
        let automation = Arc::new(automation);
        let relay = Relay::start(config, automation.clone());
        let app = build_router(AppState::new(auth, relay.clone()));
        Self {
            app,
            relay,
            automation,
        }
    }
}

pub fn chat_body(stream: bool, content: &str) -> Value {
    json!({
        "messages": [{"role": "user", "content": content}],
        "stream": stream,
    })
}

pub fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(body) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let (status, _, text) = send(app, builder.body(body).expect("request")).await;
    let value = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    (status, value)
}

pub async fn post_chat(app: &Router, body: Value) -> (StatusCode, Value) {
    send_json(app, Method::POST, "/v1/chat/completions", Some(body)).await
}

/// The `data:` payloads of an SSE body, in order.
pub fn sse_data(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| {
            let data: Vec<&str> = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|line| line.strip_prefix(' ').unwrap_or(line))
                .collect();
            if data.is_empty() {
                None
            } else {
                Some(data.join("\n"))
            }
        })
        .collect()
}

/// Parsed chunks, without the trailing `[DONE]`.
pub fn sse_chunks(body: &str) -> Vec<Value> {
    sse_data(body)
        .iter()
        .filter(|data| data.as_str() != "[DONE]")
        .map(|data| serde_json::from_str(data).expect("chunk json"))
        .collect()
}

pub fn streamed_content(chunks: &[Value]) -> String {
    chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect()
}

pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn error_type(body: &Value) -> Option<&str> {
    body["error"]["type"].as_str()
}
