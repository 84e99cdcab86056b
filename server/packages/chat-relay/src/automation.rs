//! Contract with the browser-automation layer that drives the chat page.
//!
//! The relay never touches page elements itself; everything goes through
//! [`ChatAutomation`]. Two implementations ship with the crate: an in-process
//! echo backend ([`mock::MockAutomation`]) and an HTTP client for an external
//! page driver ([`http::HttpAutomation`]).

pub mod http;
pub mod mock;

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::delta::{RecordError, StreamRecord};
use crate::monitor::DisconnectState;
use crate::openai::GenerationParams;
use crate::prompt::Prompt;

pub type AutomationFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, AutomationError>> + Send + 'a>>;

pub type RecordStream = Pin<Box<dyn Stream<Item = Result<StreamRecord, AutomationError>> + Send>>;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("chat page is not ready")]
    NotReady,
    #[error("client disconnected")]
    Disconnected,
    #[error("{0}")]
    Failed(String),
    #[error("page driver request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("page driver returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl AutomationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// What the page produced for a submitted prompt.
pub enum ResponseBody {
    /// Final text scraped from the page.
    Text(String),
    /// Live cumulative snapshots.
    Stream(RecordStream),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CatalogEntry {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_owner")]
    pub owned_by: String,
}

fn default_owner() -> String {
    "chat-relay".to_string()
}

impl CatalogEntry {
    pub fn new(id: &str, display_name: &str, owned_by: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            description: String::new(),
            owned_by: owned_by.to_string(),
        }
    }
}

pub trait ChatAutomation: Send + Sync + 'static {
    fn is_ready(&self) -> AutomationFuture<'_, bool>;

    fn submit_prompt<'a>(
        &'a self,
        prompt: &'a Prompt,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()>;

    fn get_response<'a>(&'a self, disconnect: &'a DisconnectState)
        -> AutomationFuture<'a, ResponseBody>;

    /// Returns `false` when the page refused the switch.
    fn switch_model<'a>(&'a self, model_id: &'a str) -> AutomationFuture<'a, bool>;

    fn apply_parameters<'a>(
        &'a self,
        params: &'a GenerationParams,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()>;

    fn clear_chat_history<'a>(&'a self, disconnect: &'a DisconnectState)
        -> AutomationFuture<'a, ()>;

    fn refresh_model_catalog(&self) -> AutomationFuture<'_, Vec<CatalogEntry>>;

    /// Captures whatever the page looks like for post-mortem debugging.
    fn save_error_snapshot<'a>(&'a self, tag: &'a str) -> AutomationFuture<'a, ()>;
}
