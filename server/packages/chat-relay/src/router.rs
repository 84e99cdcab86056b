use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::KeepAlive;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use base64::Engine;
use chat_relay_error::{ErrorBody, ErrorType, RelayError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};
use uuid::Uuid;

use crate::auth::{mask, ApiKeyStore};
use crate::config::ResponseSource;
use crate::liveness::connection_pair;
use crate::openai::ChatCompletionRequest;
use crate::processor::Dispatched;
use crate::prompt::validate_chat_request;
use crate::queue::QueueEntryStatus;
use crate::relay::Relay;
use crate::sse::{hold_connection, unix_timestamp};

mod types;
pub use types::*;

const REQUEST_ID_LEN: usize = 7;
const RETRY_AFTER_SECS: &str = "30";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct AppState {
    auth: AuthConfig,
    relay: Arc<Relay>,
}

impl AppState {
    pub fn new(auth: AuthConfig, relay: Arc<Relay>) -> Self {
        Self { auth, relay }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    keys: Arc<ApiKeyStore>,
}

impl AuthConfig {
    /// No keys yet. Keys added later through `/api/keys` switch the guard on.
    pub fn disabled() -> Self {
        Self::with_store(ApiKeyStore::default())
    }

    pub fn with_token(token: String) -> Self {
        Self::with_store(ApiKeyStore::in_memory([token]))
    }

    pub fn with_store(keys: ApiKeyStore) -> Self {
        Self {
            keys: Arc::new(keys),
        }
    }

    pub fn keys(&self) -> &ApiKeyStore {
        &self.keys
    }

    pub fn is_required(&self) -> bool {
        self.keys.is_enabled()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/chat/completions", post(post_chat_completions))
        .route("/models", get(list_models))
        .with_state(shared.clone())
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));

    let control_router = Router::new()
        .route("/cancel/:request_id", post(cancel_request))
        .route("/queue/status", get(get_queue_status))
        .route("/internal/stream", post(post_stream_record))
        .route(
            "/api/keys",
            get(list_api_keys).post(add_api_key).delete(delete_api_key),
        )
        .route("/api/keys/test", post(test_api_key))
        .with_state(shared.clone())
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/api/info", get(get_api_info))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone())
        .nest("/v1", v1_router)
        .merge(control_router)
        .fallback(not_found);

    let http_logging = match std::env::var("CHAT_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_api_info,
        post_chat_completions,
        list_models,
        cancel_request,
        get_queue_status,
        post_stream_record,
        list_api_keys,
        add_api_key,
        delete_api_key,
        test_api_key
    ),
    components(
        schemas(
            HealthResponse,
            ApiInfoResponse,
            ModelInfo,
            ModelListResponse,
            CancelResponse,
            QueueStatusResponse,
            QueueEntryStatus,
            StreamIngestResponse,
            ApiKeyRequest,
            ApiKeyEntry,
            ApiKeyListResponse,
            ApiKeyChangeResponse,
            ApiKeyTestResponse,
            ErrorBody,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "chat", description = "OpenAI-compatible chat completions"),
        (name = "queue", description = "Request queue control"),
        (name = "keys", description = "API key management")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2048")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Relay(err) = &self;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(err.to_error_body())).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

const SERVER_INFO: &str = "\
This is a chat-relay server. It exposes an OpenAI-compatible chat completions API
backed by a single automated chat session.

Endpoints:
  POST /v1/chat/completions
  GET  /v1/models
  GET  /queue/status
  POST /cancel/{request_id}
  GET  /health
";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, body = HealthResponse),
        (status = 503, body = HealthResponse)
    ),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let relay = &state.relay;
    let ready = match relay.automation().is_ready().await {
        Ok(ready) => ready,
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe failed");
            false
        }
    };
    let worker_running = relay.worker_running();
    let healthy = ready && worker_running;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "unavailable" }.to_string(),
            ready,
            worker_running,
            queue_length: relay.queue().len(),
            is_processing: relay.is_processing(),
        }),
    )
}

#[utoipa::path(
    get,
    path = "/api/info",
    responses((status = 200, body = ApiInfoResponse)),
    tag = "meta"
)]
async fn get_api_info(State(state): State<Arc<AppState>>) -> Json<ApiInfoResponse> {
    let config = state.relay.config();
    let api_key_count = state.auth.keys().len();
    let api_key_required = api_key_count > 0;
    Json(ApiInfoResponse {
        model_name: config.model_name.clone(),
        api_base: "/v1".to_string(),
        api_key_required,
        api_key_count,
        supported_auth_methods: if api_key_required {
            vec!["Authorization: Bearer".to_string(), "X-API-Key".to_string()]
        } else {
            Vec::new()
        },
        response_source: match config.response_source {
            ResponseSource::AuxStream => "aux-stream",
            ResponseSource::Page => "page",
        }
        .to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = Value,
    responses(
        (status = 200, description = "A chat.completion object, or a text/event-stream of chat.completion.chunk objects when `stream` is true"),
        (status = 400, body = ErrorBody),
        (status = 499, body = ErrorBody),
        (status = 502, body = ErrorBody),
        (status = 503, body = ErrorBody),
        (status = 504, body = ErrorBody)
    ),
    tag = "chat"
)]
async fn post_chat_completions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| RelayError::invalid_request(rejection.body_text()))?;
    let request_id = new_request_id();
    let streaming = request.stream;
    tracing::info!(
        request_id = %request_id,
        stream = streaming,
        model = request.model.as_deref().unwrap_or("-"),
        messages = request.messages.len(),
        "chat completion received"
    );

    let relay = &state.relay;
    if !relay.worker_running() {
        return Err(RelayError::unavailable("request worker is not running").into());
    }
    validate_chat_request(&request.messages)?;

    let (connection, guard) = connection_pair();
    let receiver = relay.enqueue(request_id.clone(), request, connection)?;
    let outcome = match tokio::time::timeout(relay.config().handler_wait(), receiver.recv()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RelayError::timeout(format!(
            "request {request_id} did not complete in time"
        ))),
    };

    match outcome {
        Ok(Dispatched::Json(response)) => Ok(Json(response).into_response()),
        Ok(Dispatched::Stream(events)) => Ok(Sse::new(hold_connection(events, guard))
            .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
            .into_response()),
        Err(err) => {
            if err.is_client_side() {
                tracing::info!(request_id = %request_id, error = %err, "chat completion ended early");
            } else {
                tracing::warn!(request_id = %request_id, error = %err, "chat completion failed");
            }
            Err(err.into())
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/models",
    responses((status = 200, body = ModelListResponse)),
    tag = "chat"
)]
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelListResponse> {
    let relay = &state.relay;
    let created = unix_timestamp();
    let data = relay
        .state()
        .models(relay.automation())
        .await
        .into_iter()
        .map(|entry| ModelInfo {
            id: entry.id,
            object: "model".to_string(),
            created,
            owned_by: entry.owned_by,
            display_name: entry.display_name,
            description: entry.description,
        })
        .collect();
    Json(ModelListResponse {
        object: "list".to_string(),
        data,
    })
}

#[utoipa::path(
    post,
    path = "/cancel/{request_id}",
    params(("request_id" = String, Path, description = "Request id")),
    responses(
        (status = 200, body = CancelResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "queue"
)]
async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    if state.relay.queue().cancel_by_id(&request_id) {
        Ok(Json(CancelResponse {
            success: true,
            message: format!("request {request_id} marked as cancelled"),
        }))
    } else {
        Err(RelayError::RequestNotFound { request_id }.into())
    }
}

#[utoipa::path(
    get,
    path = "/queue/status",
    responses((status = 200, body = QueueStatusResponse)),
    tag = "queue"
)]
async fn get_queue_status(State(state): State<Arc<AppState>>) -> Json<QueueStatusResponse> {
    let relay = &state.relay;
    let items = relay.queue().snapshot();
    Json(QueueStatusResponse {
        queue_length: items.len(),
        is_processing_locked: relay.is_processing(),
        items,
    })
}

#[utoipa::path(
    post,
    path = "/internal/stream",
    responses((status = 202, body = StreamIngestResponse)),
    tag = "queue"
)]
async fn post_stream_record(
    State(state): State<Arc<AppState>>,
    Json(record): Json<Value>,
) -> (StatusCode, Json<StreamIngestResponse>) {
    state.relay.stream_queue().push(record);
    (
        StatusCode::ACCEPTED,
        Json(StreamIngestResponse { accepted: true }),
    )
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let keys = state.auth.keys();
    if !keys.is_enabled() {
        return Ok(next.run(req).await);
    }
    match extract_token(req.headers()) {
        Some(provided) if keys.verify(&provided) => Ok(next.run(req).await),
        _ => Err(RelayError::Unauthorized.into()),
    }
}

fn key_from(payload: Result<Json<ApiKeyRequest>, JsonRejection>) -> Result<String, RelayError> {
    let Json(request) =
        payload.map_err(|rejection| RelayError::invalid_request(rejection.body_text()))?;
    Ok(request.key)
}

#[utoipa::path(
    get,
    path = "/api/keys",
    responses((status = 200, body = ApiKeyListResponse)),
    tag = "keys"
)]
async fn list_api_keys(State(state): State<Arc<AppState>>) -> Json<ApiKeyListResponse> {
    let keys: Vec<ApiKeyEntry> = state
        .auth
        .keys()
        .keys()
        .into_iter()
        .map(|value| ApiKeyEntry {
            value,
            status: "valid".to_string(),
        })
        .collect();
    Json(ApiKeyListResponse {
        success: true,
        total_count: keys.len(),
        keys,
    })
}

#[utoipa::path(
    post,
    path = "/api/keys",
    request_body = ApiKeyRequest,
    responses(
        (status = 200, body = ApiKeyChangeResponse),
        (status = 400, body = ErrorBody)
    ),
    tag = "keys"
)]
async fn add_api_key(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ApiKeyRequest>, JsonRejection>,
) -> Result<Json<ApiKeyChangeResponse>, ApiError> {
    let key = key_from(payload)?;
    let key_count = state.auth.keys().add(&key)?;
    Ok(Json(ApiKeyChangeResponse {
        success: true,
        message: "api key added".to_string(),
        key_count,
    }))
}

#[utoipa::path(
    delete,
    path = "/api/keys",
    request_body = ApiKeyRequest,
    responses(
        (status = 200, body = ApiKeyChangeResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "keys"
)]
async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ApiKeyRequest>, JsonRejection>,
) -> Result<Json<ApiKeyChangeResponse>, ApiError> {
    let key = key_from(payload)?;
    let key_count = state.auth.keys().remove(&key)?;
    Ok(Json(ApiKeyChangeResponse {
        success: true,
        message: "api key removed".to_string(),
        key_count,
    }))
}

#[utoipa::path(
    post,
    path = "/api/keys/test",
    request_body = ApiKeyRequest,
    responses(
        (status = 200, body = ApiKeyTestResponse),
        (status = 400, body = ErrorBody)
    ),
    tag = "keys"
)]
async fn test_api_key(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ApiKeyRequest>, JsonRejection>,
) -> Result<Json<ApiKeyTestResponse>, ApiError> {
    let key = key_from(payload)?;
    if key.trim().is_empty() {
        return Err(RelayError::invalid_request("api key must not be empty").into());
    }
    let valid = state.auth.keys().verify(&key);
    tracing::info!(key = %mask(key.trim()), valid, "api key checked");
    Ok(Json(ApiKeyTestResponse {
        success: true,
        valid,
        message: if valid {
            "key is valid"
        } else {
            "key is invalid or unknown"
        }
        .to_string(),
    }))
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            let value = value.trim();
            if let Some((scheme, rest)) = value.split_once(' ') {
                let rest = rest.trim();
                match scheme.to_ascii_lowercase().as_str() {
                    "bearer" | "token" => return Some(rest.to_string()),
                    "basic" => {
                        if let Some(password) = basic_password(rest) {
                            return Some(password);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn basic_password(encoded: &str) -> Option<String> {
    let engines = [
        base64::engine::general_purpose::STANDARD,
        base64::engine::general_purpose::URL_SAFE,
    ];
    for engine in engines {
        if let Ok(decoded) = engine.decode(encoded) {
            if let Ok(decoded) = String::from_utf8(decoded) {
                return match decoded.split_once(':') {
                    Some((_, password)) => Some(password.to_string()),
                    None => Some(decoded).filter(|value| !value.is_empty()),
                };
            }
        }
    }
    None
}

fn new_request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(REQUEST_ID_LEN);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_and_api_key_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(extract_token(&headers).as_deref(), Some("secret"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static(" secret "));
        assert_eq!(extract_token(&headers).as_deref(), Some("secret"));

        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:secret");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).expect("header"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("secret"));

        assert_eq!(extract_token(&HeaderMap::new()), None);
    }

    #[test]
    fn request_ids_are_short() {
        let id = new_request_id();
        assert_eq!(id.len(), REQUEST_ID_LEN);
        assert!(id.chars().all(|ch| ch.is_ascii_alphanumeric()));
    }

    #[test]
    fn service_unavailable_carries_retry_after() {
        let response = ApiError::from(RelayError::unavailable("busy")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("30"))
        );
        let response = ApiError::from(RelayError::Unauthorized).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
