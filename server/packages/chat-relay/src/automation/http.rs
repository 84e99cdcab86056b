//! Client for an external page-driver sidecar.
//!
//! The sidecar owns the browser and exposes one small HTTP endpoint per
//! automation operation. `/response` answers either with JSON
//! (`{"text": ...}`) or, for live output, with newline-delimited JSON records.

use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{AutomationError, AutomationFuture, CatalogEntry, ChatAutomation, RecordStream, ResponseBody};
use crate::delta::StreamRecord;
use crate::monitor::DisconnectState;
use crate::openai::GenerationParams;
use crate::prompt::Prompt;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Deserialize)]
struct ReadyReply {
    ready: bool,
}

#[derive(Debug, Deserialize)]
struct TextReply {
    text: String,
}

#[derive(Debug, Deserialize)]
struct SwitchReply {
    switched: bool,
}

#[derive(Debug, Serialize)]
struct PromptPayload<'a> {
    text: &'a str,
    images: Vec<ImagePayload<'a>>,
}

#[derive(Debug, Serialize)]
struct ImagePayload<'a> {
    media_type: &'a str,
    data: String,
}

#[derive(Debug, Clone)]
pub struct HttpAutomation {
    base_url: Url,
    client: Client,
}

impl HttpAutomation {
    pub fn new(base_url: &str) -> Result<Self, AutomationError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| AutomationError::failed(format!("invalid driver url {base_url}: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder().build()?;
        Ok(Self { base_url, client })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, AutomationError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| AutomationError::failed(format!("invalid driver path {path}: {err}")))?;
        Ok(self.client.request(method, url))
    }

    /// Sends a control request bounded by [`CONTROL_TIMEOUT`]. A departed
    /// client stops the call from being issued, but a call already on the
    /// wire runs to completion so the page is never left half-updated.
    async fn send(
        &self,
        builder: RequestBuilder,
        disconnect: Option<&DisconnectState>,
    ) -> Result<Response, AutomationError> {
        if disconnect.is_some_and(DisconnectState::is_disconnected) {
            return Err(AutomationError::Disconnected);
        }
        let response = builder.timeout(CONTROL_TIMEOUT).send().await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, AutomationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AutomationError::Status {
        status: status.as_u16(),
        body,
    })
}

impl ChatAutomation for HttpAutomation {
    fn is_ready(&self) -> AutomationFuture<'_, bool> {
        Box::pin(async move {
            let response = self.send(self.request(Method::GET, "ready")?, None).await?;
            let reply: ReadyReply = response.json().await?;
            Ok(reply.ready)
        })
    }

    fn submit_prompt<'a>(
        &'a self,
        prompt: &'a Prompt,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            let engine = base64::engine::general_purpose::STANDARD;
            let payload = PromptPayload {
                text: &prompt.text,
                images: prompt
                    .images
                    .iter()
                    .map(|image| ImagePayload {
                        media_type: &image.media_type,
                        data: engine.encode(&image.data),
                    })
                    .collect(),
            };
            let builder = self.request(Method::POST, "prompt")?.json(&payload);
            self.send(builder, Some(disconnect)).await?;
            Ok(())
        })
    }

    fn get_response<'a>(
        &'a self,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ResponseBody> {
        Box::pin(async move {
            // Response generation can take minutes; only the worker's
            // completion wait bounds it, and a disconnect abandons it.
            if disconnect.is_disconnected() {
                return Err(AutomationError::Disconnected);
            }
            let send = self.request(Method::GET, "response")?.send();
            let response = tokio::select! {
                biased;
                _ = disconnect.disconnected() => return Err(AutomationError::Disconnected),
                response = send => response?,
            };
            let response = check_status(response).await?;
            let is_ndjson = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.starts_with(NDJSON_CONTENT_TYPE));
            if is_ndjson {
                Ok(ResponseBody::Stream(ndjson_records(response)))
            } else {
                let reply: TextReply = response.json().await?;
                Ok(ResponseBody::Text(reply.text))
            }
        })
    }

    fn switch_model<'a>(&'a self, model_id: &'a str) -> AutomationFuture<'a, bool> {
        Box::pin(async move {
            let builder = self
                .request(Method::POST, "model")?
                .json(&serde_json::json!({ "model": model_id }));
            let reply: SwitchReply = self.send(builder, None).await?.json().await?;
            Ok(reply.switched)
        })
    }

    fn apply_parameters<'a>(
        &'a self,
        params: &'a GenerationParams,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            let builder = self.request(Method::POST, "parameters")?.json(params);
            self.send(builder, Some(disconnect)).await?;
            Ok(())
        })
    }

    fn clear_chat_history<'a>(
        &'a self,
        disconnect: &'a DisconnectState,
    ) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            self.send(self.request(Method::POST, "clear")?, Some(disconnect))
                .await?;
            Ok(())
        })
    }

    fn refresh_model_catalog(&self) -> AutomationFuture<'_, Vec<CatalogEntry>> {
        Box::pin(async move {
            let response = self.send(self.request(Method::GET, "models")?, None).await?;
            Ok(response.json().await?)
        })
    }

    fn save_error_snapshot<'a>(&'a self, tag: &'a str) -> AutomationFuture<'a, ()> {
        Box::pin(async move {
            let builder = self
                .request(Method::POST, "snapshot")?
                .json(&serde_json::json!({ "tag": tag }));
            self.send(builder, None).await?;
            Ok(())
        })
    }
}

/// Splits a streaming body into lines and parses each as a record. Blank and
/// malformed lines are skipped.
fn ndjson_records(response: Response) -> RecordStream {
    struct LineReader {
        bytes: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
        buffer: Vec<u8>,
        finished: bool,
    }

    let reader = LineReader {
        bytes: response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed(),
        buffer: Vec::new(),
        finished: false,
    };

    let records = futures::stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(position) = reader.buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = reader.buffer.drain(..=position).collect();
                match parse_line(&line) {
                    Some(record) => return Some((record, reader)),
                    None => continue,
                }
            }
            if reader.finished {
                if reader.buffer.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut reader.buffer);
                return parse_line(&line).map(|record| (record, reader));
            }
            match reader.bytes.next().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    reader.finished = true;
                    reader.buffer.clear();
                    return Some((Err(AutomationError::from(err)), reader));
                }
                None => reader.finished = true,
            }
        }
    });
    Box::pin(records)
}

fn parse_line(line: &[u8]) -> Option<Result<StreamRecord, AutomationError>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "skipping malformed driver record");
            return None;
        }
    };
    match StreamRecord::parse(value) {
        Ok(record) => Some(Ok(record)),
        Err(err) => {
            tracing::warn!(error = %err, "skipping malformed driver record");
            None
        }
    }
}
