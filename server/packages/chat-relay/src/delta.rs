//! Turns cumulative `{reason, body, done, function}` snapshots into minimal
//! chat-completion chunk deltas.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::openai::{
    ChatCompletionChunk, ChunkChoice, Delta, FunctionCall, ToolCall, Usage,
    CHAT_COMPLETION_CHUNK_OBJECT, FINISH_STOP, FINISH_TOOL_CALLS,
};

const PSEUDO_STREAM_PIECE_CHARS: usize = 5;

/// One full-so-far snapshot read from a response source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub reason: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub body: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, rename = "function", deserialize_with = "null_as_empty")]
    pub function_calls: Vec<FunctionCallRecord>,
    /// Set when the source went idle for too long and gave up.
    #[serde(skip)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRecord {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("stream record is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream record must be a json object, got {0}")]
    NotAnObject(&'static str),
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl StreamRecord {
    /// Parses a record pushed by an external source. The payload is either
    /// the record object itself or a string holding its json encoding.
    pub fn parse(value: Value) -> Result<Self, RecordError> {
        let value = match value {
            Value::String(raw) => serde_json::from_str(&raw)?,
            other => other,
        };
        match value {
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            Value::Null => Err(RecordError::NotAnObject("null")),
            Value::Bool(_) => Err(RecordError::NotAnObject("bool")),
            Value::Number(_) => Err(RecordError::NotAnObject("number")),
            Value::String(_) => Err(RecordError::NotAnObject("string")),
            Value::Array(_) => Err(RecordError::NotAnObject("array")),
        }
    }

    pub fn source_timeout() -> Self {
        Self {
            done: true,
            timed_out: true,
            ..Self::default()
        }
    }
}

/// Cumulative snapshots that replay `text` in small pieces, each newline as
/// its own piece. The last snapshot is marked done.
pub fn pseudo_stream_records(text: &str) -> Vec<StreamRecord> {
    let mut pieces: Vec<String> = Vec::new();
    for (index, line) in text.split('\n').enumerate() {
        if index > 0 {
            pieces.push("\n".to_string());
        }
        let chars: Vec<char> = line.chars().collect();
        for piece in chars.chunks(PSEUDO_STREAM_PIECE_CHARS) {
            pieces.push(piece.iter().collect());
        }
    }

    let mut records = Vec::with_capacity(pieces.len().max(1));
    let mut body = String::new();
    for piece in pieces {
        body.push_str(&piece);
        records.push(StreamRecord {
            body: body.clone(),
            ..StreamRecord::default()
        });
    }
    match records.last_mut() {
        Some(last) => last.done = true,
        None => records.push(StreamRecord {
            done: true,
            ..StreamRecord::default()
        }),
    }
    records
}

/// Emitted lengths of the two growing snapshot fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCursor {
    pub reasoning: usize,
    pub body: usize,
}

fn advance<'a>(
    request_id: &str,
    field: &'static str,
    cursor: &mut usize,
    snapshot: &'a str,
) -> Option<&'a str> {
    if snapshot.len() < *cursor {
        tracing::warn!(
            request_id = %request_id,
            field,
            previous = *cursor,
            current = snapshot.len(),
            "stream snapshot shrank; ignoring"
        );
        return None;
    }
    if snapshot.len() == *cursor {
        return None;
    }
    if !snapshot.is_char_boundary(*cursor) {
        tracing::warn!(
            request_id = %request_id,
            field,
            position = *cursor,
            "stream snapshot rewrote emitted text; ignoring"
        );
        return None;
    }
    let suffix = &snapshot[*cursor..];
    *cursor = snapshot.len();
    Some(suffix)
}

pub fn new_tool_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..24])
}

pub struct DeltaEmitter {
    request_id: String,
    completion_id: String,
    model: String,
    created: i64,
    cursor: StreamCursor,
    reasoning: String,
    body: String,
    finish_reason: Option<&'static str>,
}

impl DeltaEmitter {
    pub fn new(request_id: &str, completion_id: String, model: String, created: i64) -> Self {
        Self {
            request_id: request_id.to_string(),
            completion_id,
            model,
            created,
            cursor: StreamCursor::default(),
            reasoning: String::new(),
            body: String::new(),
            finish_reason: None,
        }
    }

    pub fn cursor(&self) -> StreamCursor {
        self.cursor
    }

    /// Everything emitted so far as `(body, reasoning)`.
    pub fn emitted(&self) -> (&str, &str) {
        (&self.body, &self.reasoning)
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn observe(&mut self, record: &StreamRecord) -> Vec<ChatCompletionChunk> {
        if self.is_finished() {
            return Vec::new();
        }
        let mut chunks = Vec::new();

        if let Some(suffix) = advance(
            &self.request_id,
            "reason",
            &mut self.cursor.reasoning,
            &record.reason,
        ) {
            self.reasoning.push_str(suffix);
            chunks.push(self.chunk(
                Delta {
                    role: Some("assistant".to_string()),
                    reasoning_content: Some(suffix.to_string()),
                    ..Delta::default()
                },
                None,
            ));
        }

        let body = advance(&self.request_id, "body", &mut self.cursor.body, &record.body);
        if let Some(suffix) = body {
            self.body.push_str(suffix);
        }
        let content_delta = |content: &str| Delta {
            role: Some("assistant".to_string()),
            content: Some(content.to_string()),
            ..Delta::default()
        };

        if !record.done {
            if let Some(suffix) = body {
                chunks.push(self.chunk(content_delta(suffix), None));
            }
            return chunks;
        }

        if !record.function_calls.is_empty() {
            if let Some(suffix) = body {
                chunks.push(self.chunk(content_delta(suffix), None));
            }
            let tool_calls = record
                .function_calls
                .iter()
                .enumerate()
                .map(|(index, call)| ToolCall {
                    index: Some(index as u32),
                    id: new_tool_call_id(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: encode_params(&call.params),
                    },
                })
                .collect();
            chunks.push(self.chunk(
                Delta {
                    role: Some("assistant".to_string()),
                    tool_calls: Some(tool_calls),
                    ..Delta::default()
                },
                Some(FINISH_TOOL_CALLS),
            ));
            self.finish_reason = Some(FINISH_TOOL_CALLS);
        } else {
            let delta = match body {
                Some(suffix) => content_delta(suffix),
                None => Delta {
                    role: Some("assistant".to_string()),
                    ..Delta::default()
                },
            };
            chunks.push(self.chunk(delta, Some(FINISH_STOP)));
            self.finish_reason = Some(FINISH_STOP);
        }
        chunks
    }

    /// Terminal content chunk describing a source failure.
    pub fn error_chunk(&mut self, message: &str) -> ChatCompletionChunk {
        self.finish_reason = Some(FINISH_STOP);
        self.chunk(
            Delta {
                role: Some("assistant".to_string()),
                content: Some(format!("\n\n[error: {message}]")),
                ..Delta::default()
            },
            Some(FINISH_STOP),
        )
    }

    pub fn usage_chunk(&self, usage: Usage) -> ChatCompletionChunk {
        let mut chunk = self.chunk(
            Delta::default(),
            Some(self.finish_reason.unwrap_or(FINISH_STOP)),
        );
        chunk.usage = Some(usage);
        chunk
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.completion_id.clone(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
                native_finish_reason: finish_reason.map(str::to_string),
            }],
            usage: None,
        }
    }
}

pub fn encode_params(params: &Value) -> String {
    if params.is_null() {
        return "{}".to_string();
    }
    params.to_string()
}
