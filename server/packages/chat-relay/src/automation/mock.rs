//! In-process echo backend. Replies word by word with the last turn of the
//! submitted prompt, which is enough to exercise the whole relay without a
//! browser.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{AutomationError, AutomationFuture, CatalogEntry, ChatAutomation, RecordStream, ResponseBody};
use crate::delta::StreamRecord;
use crate::monitor::DisconnectState;
use crate::openai::GenerationParams;
use crate::prompt::Prompt;
use crate::source::StreamQueue;
use crate::state::default_models;

const MOCK_WORD_STREAM_DELAY_MS: u64 = 30;
const TURN_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Default)]
struct MockPage {
    pending_reply: Option<String>,
    active_model: Option<String>,
    parameters: GenerationParams,
    snapshots: Vec<String>,
}

#[derive(Debug)]
pub struct MockAutomation {
    page: Mutex<MockPage>,
    models: Vec<CatalogEntry>,
    stream_queue: Option<Arc<StreamQueue>>,
    word_delay: Duration,
}

impl Default for MockAutomation {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAutomation {
    pub fn new() -> Self {
        Self {
            page: Mutex::new(MockPage::default()),
            models: default_models(),
            stream_queue: None,
            word_delay: Duration::from_millis(MOCK_WORD_STREAM_DELAY_MS),
        }
    }

    /// Also feeds every reply into `stream_queue`, the way a network
    /// interceptor would in `aux-stream` mode.
    pub fn with_stream_queue(mut self, stream_queue: Arc<StreamQueue>) -> Self {
        self.stream_queue = Some(stream_queue);
        self
    }

    pub fn with_word_delay(mut self, word_delay: Duration) -> Self {
        self.word_delay = word_delay;
        self
    }

    pub async fn active_model(&self) -> Option<String> {
        self.page.lock().await.active_model.clone()
    }

    pub async fn snapshots(&self) -> Vec<String> {
        self.page.lock().await.snapshots.clone()
    }
}

impl ChatAutomation for MockAutomation {
    fn is_ready(&self) -> AutomationFuture<'_, bool> {
        Box::pin(async { Ok(true) })
    }

    fn submit_prompt<'a>(
        &'a self,
        prompt: &'a Prompt,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            disconnect
                .check("mock submit")
                .map_err(|_| AutomationError::Disconnected)?;
            let reply = reply_for(prompt);
            if let Some(queue) = &self.stream_queue {
                let queue = queue.clone();
                let chunks = cumulative_records(&reply);
                let delay = self.word_delay;
                tokio::spawn(async move {
                    for record in chunks {
                        sleep(delay).await;
                        queue.push(json!({
                            "reason": record.reason,
                            "body": record.body,
                            "done": record.done,
                        }));
                    }
                });
            }
            self.page.lock().await.pending_reply = Some(reply);
            Ok(())
        })
    }

    fn get_response<'a>(
        &'a self,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ResponseBody> {
        Box::pin(async move {
            let reply = self
                .page
                .lock()
                .await
                .pending_reply
                .clone()
                .ok_or_else(|| AutomationError::failed("no prompt has been submitted"))?;
            let delay = self.word_delay;
            let disconnect = disconnect.clone();
            let records = futures::stream::iter(cumulative_records(&reply)).then(move |record| {
                let disconnect = disconnect.clone();
                async move {
                    sleep(delay).await;
                    if disconnect.is_disconnected() {
                        return Err(AutomationError::Disconnected);
                    }
                    Ok(record)
                }
            });
            let records: RecordStream = Box::pin(records);
            Ok(ResponseBody::Stream(records))
        })
    }

    fn switch_model<'a>(&'a self, model_id: &'a str) -> AutomationFuture<'a, bool> {
        Box::pin(async move {
            if !self.models.iter().any(|entry| entry.id == model_id) {
                return Ok(false);
            }
            self.page.lock().await.active_model = Some(model_id.to_string());
            Ok(true)
        })
    }

    fn apply_parameters<'a>(
        &'a self,
        params: &'a GenerationParams,
        _disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            let mut page = self.page.lock().await;
            if params.temperature.is_some() {
                page.parameters.temperature = params.temperature;
            }
            if params.max_tokens.is_some() {
                page.parameters.max_tokens = params.max_tokens;
            }
            if params.top_p.is_some() {
                page.parameters.top_p = params.top_p;
            }
            if params.stop.is_some() {
                page.parameters.stop = params.stop.clone();
            }
            tracing::debug!(parameters = ?page.parameters, "mock parameters applied");
            Ok(())
        })
    }

    fn clear_chat_history<'a>(
        &'a self,
        _disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            self.page.lock().await.pending_reply = None;
            Ok(())
        })
    }

    fn refresh_model_catalog(&self) -> AutomationFuture<'_, Vec<CatalogEntry>> {
        Box::pin(async move { Ok(self.models.clone()) })
    }

    fn save_error_snapshot<'a>(&'a self, tag: &'a str) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            tracing::info!(tag = %tag, "mock error snapshot");
            self.page.lock().await.snapshots.push(tag.to_string());
            Ok(())
        })
    }
}

fn reply_for(prompt: &Prompt) -> String {
    let last_turn = prompt
        .text
        .rsplit(TURN_SEPARATOR)
        .map(str::trim)
        .find(|turn| !turn.is_empty())
        .unwrap_or_default();
    format!("Echo: {last_turn}")
}

/// Cumulative snapshots growing one word at a time; the last one is `done`.
fn cumulative_records(text: &str) -> Vec<StreamRecord> {
    let chunks = split_text_into_word_chunks(text);
    let last = chunks.len().saturating_sub(1);
    let mut body = String::new();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            body.push_str(&chunk);
            StreamRecord {
                body: body.clone(),
                done: index == last,
                ..StreamRecord::default()
            }
        })
        .collect()
}

fn split_text_into_word_chunks(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return vec![text.to_string()];
    }

    let last = words.len() - 1;
    words
        .into_iter()
        .enumerate()
        .map(|(index, word)| {
            if index == last {
                word.to_string()
            } else {
                format!("{word} ")
            }
        })
        .collect()
}
