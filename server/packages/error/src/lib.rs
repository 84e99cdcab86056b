use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Unauthorized,
    RequestNotFound,
    KeyNotFound,
    ClientDisconnected,
    Cancelled,
    ModelUnavailable,
    ModelSwitchFailed,
    UpstreamFailure,
    ServiceUnavailable,
    Timeout,
    #[serde(rename = "internal_error")]
    Internal,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::RequestNotFound => "request_not_found",
            Self::KeyNotFound => "key_not_found",
            Self::ClientDisconnected => "client_disconnected",
            Self::Cancelled => "cancelled",
            Self::ModelUnavailable => "model_unavailable",
            Self::ModelSwitchFailed => "model_switch_failed",
            Self::UpstreamFailure => "upstream_failure",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Timeout => "timeout",
            Self::Internal => "internal_error",
        }
    }

    /// 499 is the nginx convention for "client closed request".
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unauthorized => 401,
            Self::RequestNotFound => 404,
            Self::KeyNotFound => 404,
            Self::ClientDisconnected => 499,
            Self::Cancelled => 499,
            Self::ModelUnavailable => 400,
            Self::ModelSwitchFailed => 422,
            Self::UpstreamFailure => 502,
            Self::ServiceUnavailable => 503,
            Self::Timeout => 504,
            Self::Internal => 500,
        }
    }
}

/// OpenAI-compatible error envelope: `{"error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorObject,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorObject {
    pub message: String,
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub code: u16,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ErrorBody {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error: ErrorObject {
                message: message.into(),
                type_: error_type,
                code: error_type.status_code(),
                param: None,
                extensions: Map::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("missing or invalid API token")]
    Unauthorized,
    #[error("request not found: {request_id}")]
    RequestNotFound { request_id: String },
    #[error("api key not found")]
    KeyNotFound,
    #[error("client disconnected ({stage})")]
    ClientDisconnected { request_id: String, stage: String },
    #[error("request cancelled: {request_id}")]
    Cancelled { request_id: String },
    #[error("invalid model '{model}'; available models: {}", available.join(", "))]
    ModelUnavailable {
        model: String,
        available: Vec<String>,
    },
    #[error("failed to switch to model '{model}'")]
    ModelSwitchFailed { model: String },
    #[error("upstream automation failure: {message}")]
    UpstreamAutomationFailure { message: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },
    #[error("timeout: {message}")]
    Timeout { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn disconnected(request_id: &str, stage: impl Into<String>) -> Self {
        Self::ClientDisconnected {
            request_id: request_id.to_string(),
            stage: stage.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamAutomationFailure {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Unauthorized => ErrorType::Unauthorized,
            Self::RequestNotFound { .. } => ErrorType::RequestNotFound,
            Self::KeyNotFound => ErrorType::KeyNotFound,
            Self::ClientDisconnected { .. } => ErrorType::ClientDisconnected,
            Self::Cancelled { .. } => ErrorType::Cancelled,
            Self::ModelUnavailable { .. } => ErrorType::ModelUnavailable,
            Self::ModelSwitchFailed { .. } => ErrorType::ModelSwitchFailed,
            Self::UpstreamAutomationFailure { .. } => ErrorType::UpstreamFailure,
            Self::ServiceUnavailable { .. } => ErrorType::ServiceUnavailable,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.error_type().status_code()
    }

    /// Errors caused by the caller walking away. They are expected traffic,
    /// not server faults.
    pub fn is_client_side(&self) -> bool {
        matches!(
            self,
            Self::ClientDisconnected { .. } | Self::Cancelled { .. }
        )
    }

    pub fn to_error_body(&self) -> ErrorBody {
        let mut body = ErrorBody::new(self.error_type(), self.to_string());
        let extensions = &mut body.error.extensions;
        match self {
            Self::RequestNotFound { request_id }
            | Self::ClientDisconnected { request_id, .. }
            | Self::Cancelled { request_id } => {
                extensions.insert("request_id".to_string(), Value::String(request_id.clone()));
            }
            Self::ModelUnavailable { model, available } => {
                body.error.param = Some("model".to_string());
                extensions.insert("model".to_string(), Value::String(model.clone()));
                extensions.insert(
                    "available_models".to_string(),
                    Value::Array(available.iter().cloned().map(Value::String).collect()),
                );
            }
            Self::ModelSwitchFailed { model } => {
                body.error.param = Some("model".to_string());
                extensions.insert("model".to_string(), Value::String(model.clone()));
            }
            _ => {}
        }
        body
    }
}
